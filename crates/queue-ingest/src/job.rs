use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum JobError {
	#[error("Body is not a JSON object: {0}")]
	Malformed(String),
	#[error("Payload missing 'callId'")]
	MissingCallId,
}

/// Audio processing request produced by the call webhook.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioProcessingJob {
	pub call_id: String,
	pub audio_url: Option<String>,
	pub timestamp: Option<String>,
	pub correlation_data: Map<String, Value>,
	pub priority: Option<String>,
	pub raw: Map<String, Value>,
}

impl AudioProcessingJob {
	pub fn from_body(body: &[u8]) -> Result<Self, JobError> {
		match serde_json::from_slice::<Value>(body) {
			Ok(Value::Object(payload)) => Self::from_payload(payload),
			Ok(other) => Err(JobError::Malformed(format!("expected object, got {}", kind(&other)))),
			Err(e) => Err(JobError::Malformed(e.to_string())),
		}
	}

	/// First non-empty value wins for each aliased field; unknown keys are kept in `raw` only.
	pub fn from_payload(payload: Map<String, Value>) -> Result<Self, JobError> {
		let call_id = first_present(&payload, &["callId", "call_id"]).and_then(scalar_string).ok_or(JobError::MissingCallId)?;

		let audio_url = first_present(&payload, &["audioUrl", "recordingUrl"]).and_then(scalar_string);
		let timestamp = payload.get("timestamp").and_then(scalar_string);
		let priority = payload.get("priority").and_then(scalar_string);

		let correlation_data = match first_present(&payload, &["ringcentralData", "ringcentral_data"]) {
			Some(Value::Object(map)) => map.clone(),
			_ => Map::new(),
		};

		Ok(Self {
			call_id,
			audio_url,
			timestamp,
			correlation_data,
			priority,
			raw: payload,
		})
	}
}

fn is_truthy(value: &Value) -> bool {
	match value {
		Value::Null => false,
		Value::Bool(b) => *b,
		Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
		Value::String(s) => !s.is_empty(),
		Value::Array(a) => !a.is_empty(),
		Value::Object(o) => !o.is_empty(),
	}
}

fn first_present<'a>(payload: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
	keys.iter().filter_map(|key| payload.get(*key)).find(|value| is_truthy(value))
}

fn scalar_string(value: &Value) -> Option<String> {
	match value {
		Value::String(s) if !s.is_empty() => Some(s.clone()),
		Value::Number(n) => Some(n.to_string()),
		_ => None,
	}
}

const fn kind(value: &Value) -> &'static str {
	match value {
		Value::Null => "null",
		Value::Bool(_) => "boolean",
		Value::Number(_) => "number",
		Value::String(_) => "string",
		Value::Array(_) => "array",
		Value::Object(_) => "object",
	}
}
