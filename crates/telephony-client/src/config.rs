use crate::rate_limit::RateLimitMode;
use clap::Args;
use std::time::Duration;

#[derive(Args, Clone, Debug)]
pub struct TelephonyConfig {
	#[arg(long, env = "RINGCENTRAL_SERVER_URL", default_value = "https://platform.ringcentral.com", help = "Telephony platform base URL")]
	pub server_url: String,

	#[arg(long, env = "RINGCENTRAL_CLIENT_ID", default_value = "", help = "OAuth client id")]
	pub client_id: String,

	#[arg(long, env = "RINGCENTRAL_CLIENT_SECRET", default_value = "", hide_env_values = true, help = "OAuth client secret")]
	pub client_secret: String,

	#[arg(long, env = "RINGCENTRAL_JWT", default_value = "", hide_env_values = true, help = "JWT assertion used for the bearer grant")]
	pub jwt: String,

	#[arg(long, env = "STRICT_RATE_LIMIT", default_value_t = false, help = "Fail fast instead of waiting while the rate limit window is open")]
	pub strict_rate_limit: bool,

	#[arg(long = "fetch-timeout-secs", env = "FETCH_TIMEOUT_SECS", default_value = "180", help = "Upper bound for one logical fetch including backoff")]
	pub fetch_timeout_secs: u64,

	#[arg(long = "fetch-max-attempts", env = "FETCH_MAX_ATTEMPTS", default_value = "4", help = "Attempts per logical fetch across all strategies")]
	pub max_attempts: u32,

	#[arg(long = "http-request-timeout-secs", env = "HTTP_REQUEST_TIMEOUT_SECS", default_value = "60", help = "Timeout for a single HTTP request")]
	pub request_timeout_secs: u64,
}

impl TelephonyConfig {
	pub const fn mode(&self) -> RateLimitMode {
		RateLimitMode::from_strict(self.strict_rate_limit)
	}

	pub const fn fetch_timeout(&self) -> Duration {
		Duration::from_secs(self.fetch_timeout_secs)
	}

	pub const fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.request_timeout_secs)
	}

	/// Validate configuration values
	pub fn validate(&self) -> Result<(), String> {
		if self.client_id.is_empty() || self.client_secret.is_empty() || self.jwt.is_empty() {
			return Err("RINGCENTRAL_CLIENT_ID, RINGCENTRAL_CLIENT_SECRET and RINGCENTRAL_JWT are required".to_string());
		}

		if self.max_attempts == 0 {
			return Err("fetch_max_attempts must be at least 1".to_string());
		}

		// 4 attempts with a 30s floor on 429s need at least this much headroom
		if self.fetch_timeout_secs < 120 {
			return Err("fetch_timeout_secs must be at least 120".to_string());
		}

		if self.request_timeout_secs == 0 {
			return Err("http_request_timeout_secs must be greater than 0".to_string());
		}

		Ok(())
	}
}
