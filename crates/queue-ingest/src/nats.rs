//! NATS JetStream backend: a durable pull consumer with explicit acks.
//!
//! Complete maps to `Ack`, abandon to `Nak` (immediate redelivery) and lock
//! renewal to `Progress`, which resets the consumer's ack-wait timer.

use crate::backend::{QueueBackend, QueueSender};
use crate::envelope::{EnvelopeMetadata, LockToken, QueueEnvelope};
use crate::error::{IngestError, Result};
use async_nats::jetstream::consumer::{pull, AckPolicy, PullConsumer};
use async_nats::jetstream::{self, AckKind, Message};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";
const CORRELATION_ID_HEADER: &str = "Correlation-Id";
const CONTENT_TYPE_HEADER: &str = "Content-Type";

fn backend_error(context: &str, error: impl Display) -> IngestError {
	IngestError::Backend(format!("{context}: {error}"))
}

#[derive(Debug, Clone)]
pub struct JetStreamSettings {
	pub url: String,
	pub stream: String,
	pub consumer: String,
	pub filter_subject: Option<String>,
	pub ack_wait: Duration,
	pub connect_timeout: Duration,
}

struct Connection {
	client: async_nats::Client,
	consumer: PullConsumer,
}

pub struct JetStreamBackend {
	settings: JetStreamSettings,
	connection: RwLock<Option<Connection>>,
	in_flight: DashMap<LockToken, Arc<Message>>,
}

impl JetStreamBackend {
	pub fn new(settings: JetStreamSettings) -> Self {
		Self {
			settings,
			connection: RwLock::new(None),
			in_flight: DashMap::new(),
		}
	}

	async fn consumer(&self) -> Result<PullConsumer> {
		self.connection.read().await.as_ref().map(|c| c.consumer.clone()).ok_or(IngestError::NotConnected)
	}

	fn take(&self, lock: &LockToken) -> Result<Arc<Message>> {
		self.in_flight.remove(lock).map(|(_, message)| message).ok_or_else(|| IngestError::AlreadySettled(lock.to_string()))
	}

	fn envelope(&self, message: Message) -> QueueEnvelope {
		let header = |name: &str| message.headers.as_ref().and_then(|h| h.get(name)).map(|v| v.as_str().to_string());

		let mut application_properties = HashMap::new();
		application_properties.insert("subject".to_string(), Value::String(message.subject.to_string()));
		if let Some(content_type) = header(CONTENT_TYPE_HEADER) {
			application_properties.insert("content_type".to_string(), Value::String(content_type));
		}

		let (enqueued_time, delivery_count) = match message.info() {
			Ok(info) => (
				DateTime::<Utc>::from_timestamp(info.published.unix_timestamp(), info.published.nanosecond()),
				u32::try_from(info.delivered).unwrap_or(u32::MAX),
			),
			Err(e) => {
				debug!(error = %e, "Message carries no JetStream info");
				(None, 1)
			}
		};

		let metadata = EnvelopeMetadata {
			message_id: header(MESSAGE_ID_HEADER),
			correlation_id: header(CORRELATION_ID_HEADER),
			enqueued_time,
			application_properties,
			delivery_count,
		};

		let lock_token = LockToken::new(uuid::Uuid::new_v4().to_string());
		let body = message.payload.clone();
		self.in_flight.insert(lock_token.clone(), Arc::new(message));

		QueueEnvelope { body, metadata, lock_token }
	}
}

#[async_trait]
impl QueueBackend for JetStreamBackend {
	async fn connect(&self) -> Result<()> {
		let settings = &self.settings;
		info!(url = %settings.url, stream = %settings.stream, consumer = %settings.consumer, "Connecting to JetStream");

		let client = async_nats::ConnectOptions::new()
			.connection_timeout(settings.connect_timeout)
			.connect(settings.url.as_str())
			.await
			.map_err(|e| backend_error("failed to connect to NATS", e))?;

		let context = jetstream::new(client.clone());
		let stream = context
			.get_stream(&settings.stream)
			.await
			.map_err(|e| backend_error("failed to look up stream", e))?;

		let consumer = stream
			.get_or_create_consumer(
				&settings.consumer,
				pull::Config {
					durable_name: Some(settings.consumer.clone()),
					filter_subject: settings.filter_subject.clone().unwrap_or_default(),
					ack_policy: AckPolicy::Explicit,
					ack_wait: settings.ack_wait,
					..Default::default()
				},
			)
			.await
			.map_err(|e| backend_error("failed to create consumer", e))?;

		*self.connection.write().await = Some(Connection { client, consumer });
		info!("JetStream consumer ready");
		Ok(())
	}

	async fn receive(&self, max_messages: usize, max_wait: Duration) -> Result<Vec<QueueEnvelope>> {
		let consumer = self.consumer().await?;

		let mut messages = consumer
			.fetch()
			.max_messages(max_messages)
			.expires(max_wait)
			.messages()
			.await
			.map_err(|e| backend_error("failed to fetch messages", e))?;

		let mut batch = Vec::new();
		while let Some(result) = messages.next().await {
			match result {
				Ok(message) => batch.push(self.envelope(message)),
				Err(e) => warn!(error = %e, "Error receiving message from batch"),
			}
		}
		Ok(batch)
	}

	async fn complete(&self, lock: &LockToken) -> Result<()> {
		let message = self.take(lock)?;
		message.ack().await.map_err(|e| backend_error("failed to ack", e))
	}

	async fn abandon(&self, lock: &LockToken) -> Result<()> {
		let message = self.take(lock)?;
		message.ack_with(AckKind::Nak(None)).await.map_err(|e| backend_error("failed to nak", e))
	}

	async fn renew_lock(&self, lock: &LockToken) -> Result<()> {
		let message = self
			.in_flight
			.get(lock)
			.map(|entry| entry.value().clone())
			.ok_or_else(|| IngestError::AlreadySettled(lock.to_string()))?;

		message.ack_with(AckKind::Progress).await.map_err(|e| backend_error("failed to extend ack wait", e))
	}

	async fn close(&self) -> Result<()> {
		let Some(connection) = self.connection.write().await.take() else {
			return Ok(());
		};

		if !self.in_flight.is_empty() {
			warn!(unsettled = self.in_flight.len(), "Closing with unsettled messages, they will be redelivered");
			self.in_flight.clear();
		}

		connection.client.flush().await.map_err(|e| backend_error("failed to flush", e))?;
		info!("JetStream connection closed");
		Ok(())
	}
}

/// Publishes JSON results to a JetStream subject.
pub struct JetStreamSender {
	context: jetstream::Context,
	subject: String,
}

impl JetStreamSender {
	pub fn new(context: jetstream::Context, subject: impl Into<String>) -> Self {
		Self {
			context,
			subject: subject.into(),
		}
	}

	pub async fn connect(url: &str, subject: impl Into<String>, timeout: Duration) -> Result<Self> {
		let client = async_nats::ConnectOptions::new()
			.connection_timeout(timeout)
			.connect(url)
			.await
			.map_err(|e| backend_error("failed to connect to NATS", e))?;

		Ok(Self::new(jetstream::new(client), subject))
	}
}

#[async_trait]
impl QueueSender for JetStreamSender {
	async fn send(&self, body: Bytes, properties: HashMap<String, String>) -> Result<()> {
		let mut headers = async_nats::HeaderMap::new();
		for (name, value) in &properties {
			headers.insert(name.as_str(), value.as_str());
		}

		let size_bytes = body.len();
		let ack = self
			.context
			.publish_with_headers(self.subject.clone(), headers, body)
			.await
			.map_err(|e| backend_error("failed to publish", e))?;
		ack.await.map_err(|e| backend_error("publish was not acknowledged", e))?;

		debug!(subject = %self.subject, size_bytes, "Published message");
		Ok(())
	}
}
