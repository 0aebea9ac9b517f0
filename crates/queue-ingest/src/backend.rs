use crate::envelope::{LockToken, QueueEnvelope};
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::time::Duration;

/// Receive side of a queue with peek-lock semantics.
///
/// Every envelope returned by [`receive`](Self::receive) must be settled exactly
/// once with [`complete`](Self::complete) or [`abandon`](Self::abandon); a second
/// disposition of the same lock token fails with `AlreadySettled`.
#[async_trait]
pub trait QueueBackend: Send + Sync {
	async fn connect(&self) -> Result<()>;

	/// Up to `max_messages` envelopes, waiting at most `max_wait` for the first.
	async fn receive(&self, max_messages: usize, max_wait: Duration) -> Result<Vec<QueueEnvelope>>;

	async fn complete(&self, lock: &LockToken) -> Result<()>;

	/// Releases the lock so the message is redelivered.
	async fn abandon(&self, lock: &LockToken) -> Result<()>;

	/// Extends the lease on an unsettled message.
	async fn renew_lock(&self, lock: &LockToken) -> Result<()>;

	async fn close(&self) -> Result<()>;
}

/// Send side, used to publish results.
#[async_trait]
pub trait QueueSender: Send + Sync {
	async fn send(&self, body: Bytes, properties: HashMap<String, String>) -> Result<()>;
}
