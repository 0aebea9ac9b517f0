use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Backend handle used to settle or renew one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken(String);

impl LockToken {
	pub fn new(token: impl Into<String>) -> Self {
		Self(token.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for LockToken {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

#[derive(Debug, Clone, Default)]
pub struct EnvelopeMetadata {
	pub message_id: Option<String>,
	pub correlation_id: Option<String>,
	pub enqueued_time: Option<DateTime<Utc>>,
	pub application_properties: HashMap<String, Value>,
	pub delivery_count: u32,
}

/// One delivery as handed out by a [`QueueBackend`](crate::QueueBackend).
///
/// The envelope is settled exactly once, through its lock token.
#[derive(Debug, Clone)]
pub struct QueueEnvelope {
	pub body: Bytes,
	pub metadata: EnvelopeMetadata,
	pub lock_token: LockToken,
}

impl QueueEnvelope {
	/// Message id, falling back to the lock token for logging.
	pub fn display_id(&self) -> &str {
		self.metadata.message_id.as_deref().unwrap_or_else(|| self.lock_token.as_str())
	}
}
