use crate::backoff::{backoff_for, delay_from_secs, exponential, is_retryable_status, parse_retry_after};
use crate::config::TelephonyConfig;
use crate::error::{Result, TelephonyError};
use crate::rate_limit::{RateLimitMode, RateLimiter};
use crate::strategy::{DirectHttp, FetchStrategy, HttpResponse, PlatformSession};
use crate::token::{CredentialExchange, TokenManager};
use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, RETRY_AFTER};
use reqwest::Url;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

const RATE_LIMIT_REMAINING: &str = "x-rate-limit-remaining";
const RATE_LIMIT_WINDOW: &str = "x-rate-limit-window";
const RATE_LIMIT_GROUP: &str = "x-rate-limit-group";

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const DEFAULT_FILENAME: &str = "recording";
const DEFAULT_EXTENSION: &str = ".mp3";
const MAX_ERROR_BODY_CHARS: usize = 512;

static EXTENDED_FILENAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)filename\*=UTF-8''([^;]+)").unwrap());
static PLAIN_FILENAME: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?i)filename="?([^";]+)"?"#).unwrap());

/// Audio returned by a successful fetch.
#[derive(Debug, Clone)]
pub struct FetchedAudio {
	pub bytes: Bytes,
	pub content_type: String,
	pub filename: String,
}

/// Authenticated recording fetcher sharing one throttle clock with every other caller.
pub struct TelephonyClient {
	strategies: Vec<Arc<dyn FetchStrategy>>,
	tokens: TokenManager,
	limiter: Arc<RateLimiter>,
	mode: RateLimitMode,
	max_attempts: u32,
	fetch_timeout: Duration,
}

impl TelephonyClient {
	pub fn new(
		strategies: Vec<Arc<dyn FetchStrategy>>,
		limiter: Arc<RateLimiter>,
		exchange: Arc<dyn CredentialExchange>,
		mode: RateLimitMode,
		max_attempts: u32,
		fetch_timeout: Duration,
	) -> Result<Self> {
		if strategies.is_empty() {
			return Err(TelephonyError::Config("at least one fetch strategy is required".to_string()));
		}
		if max_attempts == 0 {
			return Err(TelephonyError::Config("max_attempts must be at least 1".to_string()));
		}

		Ok(Self {
			strategies,
			tokens: TokenManager::new(limiter.clone(), exchange),
			limiter,
			mode,
			max_attempts,
			fetch_timeout,
		})
	}

	/// Platform session first, direct HTTP as the fallback.
	pub fn from_config(config: &TelephonyConfig, limiter: Arc<RateLimiter>, exchange: Arc<dyn CredentialExchange>) -> Result<Self> {
		let strategies: Vec<Arc<dyn FetchStrategy>> = vec![
			Arc::new(PlatformSession::new(&config.server_url, config.request_timeout())?),
			Arc::new(DirectHttp::new(&config.server_url, config.request_timeout())?),
		];

		Self::new(strategies, limiter, exchange, config.mode(), config.max_attempts, config.fetch_timeout())
	}

	pub const fn limiter(&self) -> &Arc<RateLimiter> {
		&self.limiter
	}

	/// Fetch the recording at `url`, bounded by the configured fetch timeout.
	#[instrument(skip(self), fields(mode = ?self.mode))]
	pub async fn fetch(&self, url: &str) -> Result<FetchedAudio> {
		tokio::time::timeout(self.fetch_timeout, self.fetch_with_retries(url))
			.await
			.map_err(|_| TelephonyError::Timeout(self.fetch_timeout))?
	}

	async fn fetch_with_retries(&self, url: &str) -> Result<FetchedAudio> {
		let mut token = self.tokens.acquire().await?;
		let mut strategy_index = 0;
		let mut previous_unauthorized = false;
		let mut last_error = None;

		for attempt in 1..=self.max_attempts {
			// Only the first attempt may fail fast; retries are already committed
			let mode = if attempt == 1 { self.mode } else { RateLimitMode::Lenient };
			self.limiter.wait_turn(mode).await?;

			let strategy = &self.strategies[strategy_index];
			debug!(attempt, strategy = strategy.name(), "Fetching recording");

			let response = match strategy.get(url, &token).await {
				Ok(response) => response,
				Err(TelephonyError::Transport(reason)) => {
					warn!(attempt, strategy = strategy.name(), %reason, "No usable response");
					previous_unauthorized = false;

					if strategy_index + 1 < self.strategies.len() {
						strategy_index += 1;
					} else if attempt < self.max_attempts {
						// The next wait_turn sleeps it off along with every other caller
						self.limiter.defer_for(exponential(attempt));
					}
					last_error = Some(TelephonyError::Transport(reason));
					continue;
				}
				Err(err) => return Err(err),
			};

			if response.is_success() {
				return Ok(self.accept(url, &response));
			}

			let status = response.status;
			if status == 401 && !strategy.sends_credentials(url) {
				return Err(TelephonyError::Http {
					status,
					url: url.to_string(),
					body: error_body(&response),
				});
			}

			if status == 401 {
				let message = error_body(&response);
				if previous_unauthorized {
					return Err(TelephonyError::Authentication { status, message });
				}

				warn!(attempt, "🔐 Token rejected, refreshing once");
				previous_unauthorized = true;
				token = self.tokens.force_refresh(&token).await?;
				last_error = Some(TelephonyError::Authentication { status, message });
				continue;
			}
			previous_unauthorized = false;

			if !is_retryable_status(status) {
				return Err(TelephonyError::Http {
					status,
					url: url.to_string(),
					body: error_body(&response),
				});
			}

			let retry_after = response.header(RETRY_AFTER.as_str()).and_then(parse_retry_after);
			let delay = backoff_for(attempt, Some(status), retry_after);
			self.limiter.defer_for(delay);
			warn!(
				attempt,
				status,
				delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
				"⏳ Retryable response, throttling outbound calls"
			);

			last_error = Some(TelephonyError::Http {
				status,
				url: url.to_string(),
				body: error_body(&response),
			});
		}

		Err(TelephonyError::RetriesExhausted {
			attempts: self.max_attempts,
			last: Box::new(last_error.unwrap_or_else(|| TelephonyError::Transport("no attempt was made".to_string()))),
		})
	}

	fn accept(&self, url: &str, response: &HttpResponse) -> FetchedAudio {
		if let Some(group) = response.header(RATE_LIMIT_GROUP) {
			debug!(group, "Rate limit group");
		}

		let remaining = response.header(RATE_LIMIT_REMAINING).and_then(|v| v.trim().parse::<f64>().ok());
		let window = response
			.header(RATE_LIMIT_WINDOW)
			.and_then(|v| v.trim().parse::<f64>().ok())
			.and_then(delay_from_secs)
			.filter(|window| !window.is_zero());
		if let (Some(remaining), Some(window)) = (remaining, window) {
			if remaining <= 0.0 {
				self.limiter.defer_for(window);
				info!(window_secs = window.as_secs_f64(), "⏸️ Rate limit budget spent, pausing outbound calls");
			}
		}

		let content_type = response
			.header(CONTENT_TYPE.as_str())
			.map(str::trim)
			.filter(|v| !v.is_empty())
			.unwrap_or(DEFAULT_CONTENT_TYPE)
			.to_string();

		FetchedAudio {
			bytes: response.body.clone(),
			content_type,
			filename: filename_for(response.header(CONTENT_DISPOSITION.as_str()), url),
		}
	}
}

fn error_body(response: &HttpResponse) -> String {
	String::from_utf8_lossy(&response.body).chars().take(MAX_ERROR_BODY_CHARS).collect()
}

/// Name to store the recording under.
pub fn filename_for(content_disposition: Option<&str>, url: &str) -> String {
	if let Some(name) = content_disposition.and_then(disposition_filename) {
		return name;
	}

	let path = Url::parse(url).map_or_else(|_| url.split(['?', '#']).next().unwrap_or_default().to_string(), |u| u.path().to_string());
	let segment = path.rsplit('/').next().unwrap_or_default();

	let mut name = urlencoding::decode(segment).map_or_else(|_| segment.to_string(), Cow::into_owned);
	if name.is_empty() {
		name = DEFAULT_FILENAME.to_string();
	}
	if !name.contains('.') {
		name.push_str(DEFAULT_EXTENSION);
	}
	name
}

fn disposition_filename(header: &str) -> Option<String> {
	let raw = EXTENDED_FILENAME
		.captures(header)
		.or_else(|| PLAIN_FILENAME.captures(header))
		.and_then(|caps| caps.get(1))
		.map(|m| m.as_str().trim())?;

	let decoded = urlencoding::decode(raw).map_or_else(|_| raw.to_string(), Cow::into_owned);
	(!decoded.is_empty()).then_some(decoded)
}
