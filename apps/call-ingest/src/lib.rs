//! Call recording ingest service.
//!
//! Consumes audio processing jobs from a JetStream work queue, downloads each
//! recording from the telephony provider and posts it to a transcription engine.

pub mod config;
pub mod handler;
pub mod observability;
pub mod transcriber;

pub use config::Config;
pub use handler::AudioJobHandler;

use anyhow::Context;
use queue_ingest::{JetStreamBackend, JetStreamSender, QueueListener, QueueSender};
use std::sync::Arc;
use telephony_client::{JwtBearerExchange, RateLimiter, SlidingWindowLimiter, TelephonyClient};
use tracing::info;
use transcriber::HttpTranscriber;

/// Wire the telephony client, transcriber and queue backend into a listener ready to start.
pub async fn build_listener(config: &Config) -> anyhow::Result<QueueListener> {
	let limiter = Arc::new(RateLimiter::new());
	let exchange = JwtBearerExchange::from_config(&config.telephony).context("failed to build credential exchange")?;
	let client = TelephonyClient::from_config(&config.telephony, limiter, Arc::new(exchange)).context("failed to build telephony client")?;

	let quota = Arc::new(SlidingWindowLimiter::per_minute(config.transcriber_requests_per_minute));
	let transcriber = HttpTranscriber::from_config(config).context("failed to build transcriber")?;

	let responses: Option<Arc<dyn QueueSender>> = match &config.response_subject {
		Some(subject) => {
			let sender = JetStreamSender::connect(&config.queue_connection_string, subject.clone(), config.connect_timeout())
				.await
				.context("failed to connect response publisher")?;
			info!(subject = %subject, "📤 Publishing transcriptions");
			Some(Arc::new(sender))
		}
		None => None,
	};

	let handler = AudioJobHandler::new(Arc::new(client), quota, Arc::new(transcriber), responses);
	let backend = JetStreamBackend::new(config.jetstream_settings());

	Ok(QueueListener::from_config(Arc::new(backend), Arc::new(handler), config.listener.clone()))
}
