//! Queue Ingest Crate
//!
//! Consumes audio processing jobs from a peek-lock queue and runs them through a
//! [`MessageHandler`] under resource-aware admission control.
//!
//! # Architecture
//!
//! - [`QueueBackend`] abstracts the broker: receive, complete, abandon and renew.
//!   [`InMemoryQueue`] is always available; [`JetStreamBackend`] is behind the
//!   `nats` feature (on by default).
//! - [`QueueListener`] owns the receive loop. Each decoded job is offered to the
//!   [`AdmissionController`], which spawns it on a bounded pool or hands it back
//!   for the configured [`DegradedMode`].
//! - A [`LockRenewalTask`] keeps the message lease alive while the handler runs
//!   and is cancelled before the message is settled.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use queue_ingest::{InMemoryQueue, ListenerConfig, MessageHandler, QueueListener};
//!
//! async fn example(handler: Arc<dyn MessageHandler>) -> Result<(), queue_ingest::IngestError> {
//!     let queue = Arc::new(InMemoryQueue::new());
//!     let listener = QueueListener::from_config(queue.clone(), handler, ListenerConfig::default());
//!
//!     listener.start().await?;
//!     queue.push(r#"{"callId": "42", "audioUrl": "https://example.com/42.mp3"}"#);
//!     listener.stop().await;
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod backend;
pub mod config;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod inmem;
pub mod job;
pub mod listener;
mod metrics;
#[cfg(feature = "nats")]
pub mod nats;
pub mod renewal;

pub use admission::{AdmissionBudget, AdmissionController, MemoryProbe, ProbeError, SysinfoProbe};
pub use backend::{QueueBackend, QueueSender};
pub use config::ListenerConfig;
pub use envelope::{EnvelopeMetadata, LockToken, QueueEnvelope};
pub use error::{IngestError, Result};
pub use handler::{DegradedMode, HandlerError, MessageHandler, RateLimitedDisposition};
pub use inmem::InMemoryQueue;
pub use job::{AudioProcessingJob, JobError};
pub use listener::QueueListener;
#[cfg(feature = "nats")]
pub use nats::{JetStreamBackend, JetStreamSender, JetStreamSettings};
pub use renewal::{LockRenewalHandle, LockRenewalTask, RenewalConfig};
