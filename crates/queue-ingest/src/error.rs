use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
	#[error("Queue backend error: {0}")]
	Backend(String),
	#[error("Listener already started")]
	AlreadyStarted,
	#[error("Message {0} was already settled")]
	AlreadySettled(String),
	#[error("Queue backend is not connected")]
	NotConnected,
}

pub type Result<T> = std::result::Result<T, IngestError>;
