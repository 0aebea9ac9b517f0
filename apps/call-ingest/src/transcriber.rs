use crate::config::Config;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use telephony_client::FetchedAudio;
use thiserror::Error;
use tracing::{debug, instrument};

const TRANSCRIBE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum TranscribeError {
	#[error("Transcriber returned HTTP {status}: {body}")]
	Http { status: u16, body: String },
	#[error("Transcriber unreachable: {0}")]
	Transport(String),
	#[error("Invalid transcriber response: {0}")]
	InvalidResponse(String),
}

impl From<reqwest::Error> for TranscribeError {
	fn from(err: reqwest::Error) -> Self {
		Self::Transport(err.to_string())
	}
}

/// Engine output, passed through untouched.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TranscriptionResult(pub Value);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transcriber: Send + Sync {
	async fn transcribe(&self, audio: &FetchedAudio) -> Result<TranscriptionResult, TranscribeError>;
}

/// Whisper-compatible multipart transcription endpoint.
pub struct HttpTranscriber {
	http: reqwest::Client,
	url: String,
	api_key: String,
	model: String,
}

impl HttpTranscriber {
	pub fn from_config(config: &Config) -> Result<Self, TranscribeError> {
		let http = reqwest::Client::builder().timeout(TRANSCRIBE_TIMEOUT).build()?;

		Ok(Self {
			http,
			url: config.transcriber_url.clone(),
			api_key: config.transcriber_api_key.clone(),
			model: config.transcriber_model.clone(),
		})
	}
}

#[async_trait]
impl Transcriber for HttpTranscriber {
	#[instrument(skip_all, fields(filename = %audio.filename, size_bytes = audio.bytes.len()))]
	async fn transcribe(&self, audio: &FetchedAudio) -> Result<TranscriptionResult, TranscribeError> {
		let file = Part::bytes(audio.bytes.to_vec())
			.file_name(audio.filename.clone())
			.mime_str(&audio.content_type)
			.map_err(|e| TranscribeError::InvalidResponse(format!("bad content type {}: {e}", audio.content_type)))?;

		let form = Form::new().part("file", file).text("model", self.model.clone()).text("response_format", "verbose_json");

		let response = self.http.post(&self.url).bearer_auth(&self.api_key).multipart(form).send().await?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
			return Err(TranscribeError::Http { status: status.as_u16(), body });
		}

		let result = response.json::<Value>().await.map_err(|e| TranscribeError::InvalidResponse(e.to_string()))?;
		debug!("Transcription received");
		Ok(TranscriptionResult(result))
	}
}
