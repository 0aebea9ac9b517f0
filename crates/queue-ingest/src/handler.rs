use crate::envelope::EnvelopeMetadata;
use crate::job::AudioProcessingJob;
use async_trait::async_trait;
use clap::ValueEnum;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HandlerError {
	/// The shared outbound throttle is open; the job was not attempted.
	#[error("Rate limit active, retry after {retry_after:.1}s")]
	RateLimited { retry_after: f64 },
	#[error("{0}")]
	Failed(String),
}

/// Processes one decoded job. Dispositions are decided by the listener.
#[async_trait]
pub trait MessageHandler: Send + Sync {
	async fn handle(&self, job: &AudioProcessingJob, metadata: &EnvelopeMetadata) -> Result<(), HandlerError>;
}

/// What to do with a message whose handler reported an active rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum RateLimitedDisposition {
	#[default]
	Complete,
	Abandon,
}

/// What to do with a message the admission controller refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum DegradedMode {
	/// Run it on the receive loop.
	#[default]
	Inline,
	/// Complete it without processing.
	Skip,
}
