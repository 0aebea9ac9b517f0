use clap::Parser;
use queue_ingest::{JetStreamSettings, ListenerConfig};
use std::time::Duration;
use telephony_client::TelephonyConfig;

#[derive(Parser, Debug, Clone)]
#[command(name = "call-ingest")]
#[command(about = "Fetches call recordings for queued jobs and hands them to transcription", long_about = None)]
pub struct Config {
	/// NATS server URL
	#[arg(long, env = "QUEUE_CONNECTION_STRING", default_value = "nats://localhost:4222")]
	pub queue_connection_string: String,

	/// JetStream stream holding the audio jobs
	#[arg(long, env = "QUEUE_NAME", default_value = "")]
	pub queue_name: String,

	/// Durable consumer name, defaults to `<queue>-ingest`
	#[arg(long, env = "QUEUE_CONSUMER")]
	pub queue_consumer: Option<String>,

	/// Only consume subjects matching this filter
	#[arg(long, env = "QUEUE_SUBJECT")]
	pub queue_subject: Option<String>,

	/// Lease length before an unacknowledged message is redelivered
	#[arg(long, env = "QUEUE_ACK_WAIT_SECS", default_value = "30")]
	pub queue_ack_wait_secs: u64,

	#[arg(long, env = "QUEUE_CONNECT_TIMEOUT_SECS", default_value = "10")]
	pub queue_connect_timeout_secs: u64,

	#[command(flatten)]
	pub listener: ListenerConfig,

	#[command(flatten)]
	pub telephony: TelephonyConfig,

	/// Transcription endpoint accepting multipart audio uploads
	#[arg(long, env = "TRANSCRIBER_URL", default_value = "https://api.openai.com/v1/audio/transcriptions")]
	pub transcriber_url: String,

	#[arg(long, env = "TRANSCRIBER_API_KEY", default_value = "", hide_env_values = true)]
	pub transcriber_api_key: String,

	#[arg(long, env = "TRANSCRIBER_MODEL", default_value = "whisper-1")]
	pub transcriber_model: String,

	/// Transcription quota per rolling minute
	#[arg(long, env = "TRANSCRIBER_REQUESTS_PER_MINUTE", default_value = "3")]
	pub transcriber_requests_per_minute: usize,

	/// Publish transcription results to this subject when set
	#[arg(long, env = "RESPONSE_SUBJECT")]
	pub response_subject: Option<String>,

	/// Service name for observability
	#[arg(long, env = "OTEL_SERVICE_NAME", default_value = "call-ingest")]
	pub service_name: String,
}

impl Config {
	pub fn consumer_name(&self) -> String {
		self.queue_consumer.clone().unwrap_or_else(|| format!("{}-ingest", self.queue_name))
	}

	pub const fn connect_timeout(&self) -> Duration {
		Duration::from_secs(self.queue_connect_timeout_secs)
	}

	pub fn jetstream_settings(&self) -> JetStreamSettings {
		JetStreamSettings {
			url: self.queue_connection_string.clone(),
			stream: self.queue_name.clone(),
			consumer: self.consumer_name(),
			filter_subject: self.queue_subject.clone(),
			ack_wait: Duration::from_secs(self.queue_ack_wait_secs),
			connect_timeout: self.connect_timeout(),
		}
	}

	/// Validate configuration values
	pub fn validate(&self) -> Result<(), String> {
		if self.queue_connection_string.is_empty() {
			return Err("QUEUE_CONNECTION_STRING is required".to_string());
		}

		if self.queue_name.is_empty() {
			return Err("QUEUE_NAME is required".to_string());
		}

		// Renewals must land before the lease lapses
		if Duration::from_secs(self.queue_ack_wait_secs) <= self.listener.lock_renewal_interval {
			return Err("queue_ack_wait_secs must be longer than lock_renewal_interval_secs".to_string());
		}

		if self.transcriber_api_key.is_empty() {
			return Err("TRANSCRIBER_API_KEY is required".to_string());
		}

		if self.transcriber_requests_per_minute == 0 {
			return Err("transcriber_requests_per_minute must be greater than 0".to_string());
		}

		self.listener.validate()?;
		self.telephony.validate()
	}
}
