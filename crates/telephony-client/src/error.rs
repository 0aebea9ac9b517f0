use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelephonyError {
	/// The shared throttle window is still open and the client runs in strict mode.
	#[error("Rate limit active, retry after {retry_after:.1}s")]
	RateLimitActive { retry_after: f64 },

	#[error("Authentication failed with HTTP {status}: {message}")]
	Authentication { status: u16, message: String },

	#[error("HTTP {status} from {url}: {body}")]
	Http { status: u16, url: String, body: String },

	/// No usable response was produced (connect error, timeout, unsupported URL).
	#[error("Transport error: {0}")]
	Transport(String),

	#[error("Token exchange failed: {0}")]
	TokenExchange(String),

	#[error("Gave up after {attempts} attempts: {last}")]
	RetriesExhausted {
		attempts: u32,
		#[source]
		last: Box<TelephonyError>,
	},

	#[error("Fetch timed out after {0:?}")]
	Timeout(std::time::Duration),

	#[error("Invalid configuration: {0}")]
	Config(String),
}

impl TelephonyError {
	/// HTTP status carried by this error, looking through exhausted retries.
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Http { status, .. } | Self::Authentication { status, .. } => Some(*status),
			Self::RetriesExhausted { last, .. } => last.status(),
			_ => None,
		}
	}

	/// Seconds to wait when this error is the rate limit signal.
	pub const fn retry_after(&self) -> Option<f64> {
		match self {
			Self::RateLimitActive { retry_after } => Some(*retry_after),
			_ => None,
		}
	}
}

impl From<reqwest::Error> for TelephonyError {
	fn from(err: reqwest::Error) -> Self {
		Self::Transport(err.to_string())
	}
}

pub type Result<T> = std::result::Result<T, TelephonyError>;
