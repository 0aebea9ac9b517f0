use crate::transcriber::Transcriber;
use async_trait::async_trait;
use bytes::Bytes;
use queue_ingest::{AudioProcessingJob, EnvelopeMetadata, HandlerError, MessageHandler, QueueSender};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use telephony_client::{FetchedAudio, SlidingWindowLimiter, TelephonyClient};
use tracing::{info, instrument, warn};

/// Fetches the job's recording, transcribes it and optionally publishes the result.
pub struct AudioJobHandler {
	client: Arc<TelephonyClient>,
	quota: Arc<SlidingWindowLimiter>,
	transcriber: Arc<dyn Transcriber>,
	responses: Option<Arc<dyn QueueSender>>,
}

impl AudioJobHandler {
	pub fn new(
		client: Arc<TelephonyClient>,
		quota: Arc<SlidingWindowLimiter>,
		transcriber: Arc<dyn Transcriber>,
		responses: Option<Arc<dyn QueueSender>>,
	) -> Self {
		Self {
			client,
			quota,
			transcriber,
			responses,
		}
	}

	async fn publish(&self, sender: &dyn QueueSender, job: &AudioProcessingJob, metadata: &EnvelopeMetadata, audio: &FetchedAudio, result: serde_json::Value) -> Result<(), HandlerError> {
		let payload = json!({
			"callId": job.call_id,
			"messageId": metadata.message_id,
			"correlationId": metadata.correlation_id,
			"contentType": audio.content_type,
			"filename": audio.filename,
			"result": result,
		});

		let mut properties = HashMap::new();
		properties.insert("Call-Id".to_string(), job.call_id.clone());
		properties.insert("Content-Type".to_string(), "application/json".to_string());
		if let Some(correlation_id) = &metadata.correlation_id {
			properties.insert("Correlation-Id".to_string(), correlation_id.clone());
		}

		sender
			.send(Bytes::from(payload.to_string()), properties)
			.await
			.map_err(|e| HandlerError::Failed(format!("failed to publish transcription: {e}")))
	}
}

#[async_trait]
impl MessageHandler for AudioJobHandler {
	#[instrument(skip_all, fields(call_id = %job.call_id))]
	async fn handle(&self, job: &AudioProcessingJob, metadata: &EnvelopeMetadata) -> Result<(), HandlerError> {
		let Some(url) = job.audio_url.as_deref() else {
			warn!("Job has no audio URL, nothing to fetch");
			return Ok(());
		};

		let audio = self.client.fetch(url).await.map_err(|e| match e.retry_after() {
			Some(retry_after) => HandlerError::RateLimited { retry_after },
			None => HandlerError::Failed(format!("audio fetch failed: {e}")),
		})?;

		info!(
			size_bytes = audio.bytes.len(),
			content_type = %audio.content_type,
			filename = %audio.filename,
			"📥 Recording fetched"
		);

		self.quota.acquire().await;
		let result = self
			.transcriber
			.transcribe(&audio)
			.await
			.map_err(|e| HandlerError::Failed(format!("transcription failed: {e}")))?;

		info!("📝 Transcription complete");

		if let Some(sender) = &self.responses {
			self.publish(sender.as_ref(), job, metadata, &audio, result.0).await?;
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transcriber::{MockTranscriber, TranscriptionResult};
	use queue_ingest::InMemoryQueue;
	use std::time::Duration;
	use telephony_client::{CredentialExchange, FetchStrategy, HttpResponse, IssuedToken, RateLimitMode, RateLimiter, TelephonyError};

	struct StaticToken;

	#[async_trait]
	impl CredentialExchange for StaticToken {
		async fn exchange(&self) -> telephony_client::Result<IssuedToken> {
			Ok(IssuedToken {
				access_token: "token".to_string(),
				expires_in: Duration::from_secs(3600),
			})
		}
	}

	struct FixedReply(u16);

	#[async_trait]
	impl FetchStrategy for FixedReply {
		fn name(&self) -> &'static str {
			"fixed"
		}

		async fn get(&self, _url: &str, _bearer: &str) -> telephony_client::Result<HttpResponse> {
			let mut headers = reqwest::header::HeaderMap::new();
			headers.insert(reqwest::header::CONTENT_TYPE, reqwest::header::HeaderValue::from_static("audio/wav"));
			Ok(HttpResponse {
				status: self.0,
				headers,
				body: Bytes::from_static(b"RIFF"),
			})
		}
	}

	fn client(status: u16, limiter: Arc<RateLimiter>, mode: RateLimitMode) -> Arc<TelephonyClient> {
		Arc::new(TelephonyClient::new(vec![Arc::new(FixedReply(status)) as Arc<dyn FetchStrategy>], limiter, Arc::new(StaticToken), mode, 4, Duration::from_secs(180)).unwrap())
	}

	fn job(value: serde_json::Value) -> AudioProcessingJob {
		AudioProcessingJob::from_body(value.to_string().as_bytes()).unwrap()
	}

	fn quota() -> Arc<SlidingWindowLimiter> {
		Arc::new(SlidingWindowLimiter::per_minute(3))
	}

	#[tokio::test(start_paused = true)]
	async fn test_job_without_audio_url_is_a_no_op() {
		let mut transcriber = MockTranscriber::new();
		transcriber.expect_transcribe().times(0);
		let handler = AudioJobHandler::new(client(200, Arc::new(RateLimiter::new()), RateLimitMode::Lenient), quota(), Arc::new(transcriber), None);

		let outcome = handler.handle(&job(json!({"callId": "c-1"})), &EnvelopeMetadata::default()).await;
		assert!(outcome.is_ok());
	}

	#[tokio::test(start_paused = true)]
	async fn test_active_rate_limit_is_signalled() {
		let limiter = Arc::new(RateLimiter::new());
		limiter.defer_for(Duration::from_secs(20));
		let mut transcriber = MockTranscriber::new();
		transcriber.expect_transcribe().times(0);
		let handler = AudioJobHandler::new(client(200, limiter, RateLimitMode::Strict), quota(), Arc::new(transcriber), None);

		let outcome = handler.handle(&job(json!({"callId": "c-1", "audioUrl": "https://media.example.com/1"})), &EnvelopeMetadata::default()).await;

		match outcome {
			Err(HandlerError::RateLimited { retry_after }) => assert!(retry_after > 19.0),
			other => panic!("expected rate limit signal, got {other:?}"),
		}
	}

	#[tokio::test(start_paused = true)]
	async fn test_fetch_failure_is_handler_failure() {
		let mut transcriber = MockTranscriber::new();
		transcriber.expect_transcribe().times(0);
		let handler = AudioJobHandler::new(client(404, Arc::new(RateLimiter::new()), RateLimitMode::Lenient), quota(), Arc::new(transcriber), None);

		let outcome = handler.handle(&job(json!({"callId": "c-1", "audioUrl": "https://media.example.com/1"})), &EnvelopeMetadata::default()).await;
		assert!(matches!(outcome, Err(HandlerError::Failed(_))));
	}

	#[tokio::test(start_paused = true)]
	async fn test_result_published_when_configured() {
		let mut transcriber = MockTranscriber::new();
		transcriber
			.expect_transcribe()
			.times(1)
			.returning(|_| Ok(TranscriptionResult(json!({"text": "hello"}))));
		let responses = Arc::new(InMemoryQueue::new());
		let handler = AudioJobHandler::new(
			client(200, Arc::new(RateLimiter::new()), RateLimitMode::Lenient),
			quota(),
			Arc::new(transcriber),
			Some(responses.clone()),
		);
		let metadata = EnvelopeMetadata {
			message_id: Some("m-1".to_string()),
			correlation_id: Some("corr-1".to_string()),
			..EnvelopeMetadata::default()
		};

		handler.handle(&job(json!({"callId": "c-1", "audioUrl": "https://media.example.com/rec.wav"})), &metadata).await.unwrap();

		let sent = responses.sent();
		assert_eq!(sent.len(), 1);
		let (body, properties) = &sent[0];
		let payload: serde_json::Value = serde_json::from_slice(body).unwrap();
		assert_eq!(payload["callId"], "c-1");
		assert_eq!(payload["messageId"], "m-1");
		assert_eq!(payload["contentType"], "audio/wav");
		assert_eq!(payload["filename"], "rec.wav");
		assert_eq!(payload["result"]["text"], "hello");
		assert_eq!(properties.get("Correlation-Id").map(String::as_str), Some("corr-1"));
	}

	#[tokio::test(start_paused = true)]
	async fn test_transcriber_error_fails_job() {
		let mut transcriber = MockTranscriber::new();
		transcriber
			.expect_transcribe()
			.times(1)
			.returning(|_| Err(crate::transcriber::TranscribeError::Http { status: 500, body: "boom".to_string() }));
		let handler = AudioJobHandler::new(client(200, Arc::new(RateLimiter::new()), RateLimitMode::Lenient), quota(), Arc::new(transcriber), None);

		let outcome = handler.handle(&job(json!({"callId": "c-1", "audioUrl": "https://media.example.com/1"})), &EnvelopeMetadata::default()).await;
		assert!(matches!(outcome, Err(HandlerError::Failed(message)) if message.contains("500")));
	}

	#[test]
	fn test_rate_limit_error_maps_to_signal() {
		let err = TelephonyError::RateLimitActive { retry_after: 3.0 };
		assert_eq!(err.retry_after(), Some(3.0));
	}
}
