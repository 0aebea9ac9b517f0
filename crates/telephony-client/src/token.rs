use crate::config::TelephonyConfig;
use crate::error::{Result, TelephonyError};
use crate::rate_limit::RateLimiter;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

/// A cached token must outlive this margin to be handed out.
pub const MIN_TOKEN_VALIDITY: Duration = Duration::from_secs(30);

/// Shaved off the provider-reported lifetime before caching.
pub const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

const DEFAULT_TOKEN_TTL_SECS: u64 = 3600;
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
	pub value: String,
	pub expires_at: Instant,
}

/// Token as reported by the provider, before the expiry margin is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
	pub access_token: String,
	pub expires_in: Duration,
}

/// Exchanges long-lived credentials for a short-lived bearer token.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialExchange: Send + Sync {
	async fn exchange(&self) -> Result<IssuedToken>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	expires_in: Option<u64>,
}

/// JWT bearer grant against the provider's OAuth token endpoint.
pub struct JwtBearerExchange {
	http: reqwest::Client,
	token_url: String,
	client_id: String,
	client_secret: String,
	assertion: String,
}

impl JwtBearerExchange {
	pub fn from_config(config: &TelephonyConfig) -> Result<Self> {
		let http = reqwest::Client::builder().timeout(config.request_timeout()).build()?;

		Ok(Self {
			http,
			token_url: format!("{}/restapi/oauth/token", config.server_url.trim_end_matches('/')),
			client_id: config.client_id.clone(),
			client_secret: config.client_secret.clone(),
			assertion: config.jwt.clone(),
		})
	}
}

#[async_trait]
impl CredentialExchange for JwtBearerExchange {
	async fn exchange(&self) -> Result<IssuedToken> {
		let response = self
			.http
			.post(&self.token_url)
			.basic_auth(&self.client_id, Some(&self.client_secret))
			.header(reqwest::header::ACCEPT, "application/json")
			.form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", self.assertion.as_str())])
			.send()
			.await
			.map_err(|e| TelephonyError::TokenExchange(e.to_string()))?;

		let status = response.status();
		if !status.is_success() {
			let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
			return Err(TelephonyError::TokenExchange(format!("HTTP {}: {body}", status.as_u16())));
		}

		let token: TokenResponse = response.json().await.map_err(|e| TelephonyError::TokenExchange(e.to_string()))?;

		Ok(IssuedToken {
			access_token: token.access_token,
			expires_in: Duration::from_secs(token.expires_in.unwrap_or(DEFAULT_TOKEN_TTL_SECS)),
		})
	}
}

/// Hands out bearer tokens from the shared cache, refreshing at most one at a time.
pub struct TokenManager {
	limiter: Arc<RateLimiter>,
	exchange: Arc<dyn CredentialExchange>,
	refresh: Mutex<()>,
}

impl TokenManager {
	pub fn new(limiter: Arc<RateLimiter>, exchange: Arc<dyn CredentialExchange>) -> Self {
		Self {
			limiter,
			exchange,
			refresh: Mutex::new(()),
		}
	}

	/// Returns a token valid for at least [`MIN_TOKEN_VALIDITY`].
	pub async fn acquire(&self) -> Result<String> {
		if let Some(token) = self.limiter.cached_token(MIN_TOKEN_VALIDITY) {
			return Ok(token.value);
		}

		let _guard = self.refresh.lock().await;
		// Another caller may have refreshed while we waited for the lock
		if let Some(token) = self.limiter.cached_token(MIN_TOKEN_VALIDITY) {
			return Ok(token.value);
		}

		self.refresh_locked().await
	}

	/// Drops `rejected` from the cache and acquires a replacement.
	pub async fn force_refresh(&self, rejected: &str) -> Result<String> {
		let _guard = self.refresh.lock().await;
		if let Some(token) = self.limiter.cached_token(MIN_TOKEN_VALIDITY) {
			if token.value != rejected {
				debug!("Token already replaced by a concurrent refresh");
				return Ok(token.value);
			}
		}

		self.limiter.invalidate_token();
		self.refresh_locked().await
	}

	async fn refresh_locked(&self) -> Result<String> {
		let issued = self.exchange.exchange().await?;
		let lifetime = issued.expires_in.saturating_sub(EXPIRY_MARGIN);

		self.limiter.store_token(AccessToken {
			value: issued.access_token.clone(),
			expires_at: Instant::now() + lifetime,
		});

		info!(ttl_secs = lifetime.as_secs(), "🔑 Access token refreshed");
		Ok(issued.access_token)
	}
}
