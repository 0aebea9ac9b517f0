//! Telephony Client Crate
//!
//! Fetches call recordings from the telephony provider while keeping every
//! concurrent caller in the process behind one shared throttle clock.
//!
//! # Architecture
//!
//! - [`RateLimiter`] owns the process-wide `next_allowed_at` instant and the
//!   cached access token. One instance is built at startup and shared by `Arc`.
//! - [`TokenManager`] hands out bearer tokens, refreshing them through a
//!   [`CredentialExchange`] when the cached one is close to expiry.
//! - [`TelephonyClient`] runs a bounded retry loop over an ordered list of
//!   [`FetchStrategy`] implementations, pushing backoff into the shared limiter
//!   so one 429 pauses every worker, not just the failing call.
//! - [`SlidingWindowLimiter`] guards the transcription engine's per-minute quota.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use telephony_client::{JwtBearerExchange, RateLimiter, TelephonyClient, TelephonyConfig};
//!
//! async fn example(config: TelephonyConfig) -> Result<(), telephony_client::TelephonyError> {
//!     let limiter = Arc::new(RateLimiter::new());
//!     let exchange = JwtBearerExchange::from_config(&config)?;
//!     let client = TelephonyClient::from_config(&config, limiter, Arc::new(exchange))?;
//!
//!     let audio = client.fetch("https://media.ringcentral.com/restapi/v1.0/account/~/recording/1/content").await?;
//!     println!("{} bytes ({})", audio.bytes.len(), audio.content_type);
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod rate_limit;
pub mod strategy;
pub mod token;
pub mod window;

pub use client::{FetchedAudio, TelephonyClient};
pub use config::TelephonyConfig;
pub use error::{Result, TelephonyError};
pub use rate_limit::{RateLimitMode, RateLimiter};
pub use strategy::{DirectHttp, FetchStrategy, HttpResponse, PlatformSession};
pub use token::{AccessToken, CredentialExchange, IssuedToken, JwtBearerExchange, TokenManager};
pub use window::SlidingWindowLimiter;
