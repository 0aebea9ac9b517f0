//! Retry classification and backoff computation for telephony API calls.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Statuses worth another attempt: request timeout, throttling and gateway/server faults.
pub const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Minimum pause after a 429 that came without a `Retry-After` header.
pub const RATE_LIMITED_FLOOR: Duration = Duration::from_secs(30);

/// Ceiling for any delay taken from a server header.
pub const MAX_SERVER_DELAY: Duration = Duration::from_secs(3600);

const MAX_EXPONENTIAL_SECS: u64 = 16;
const MAX_JITTER_SECS: f64 = 0.5;

pub fn is_retryable_status(status: u16) -> bool {
	RETRYABLE_STATUSES.contains(&status)
}

/// `min(2^(attempt-1), 16)` seconds plus up to half a second of jitter.
/// `attempt` is 1-based.
pub fn exponential(attempt: u32) -> Duration {
	let base = 2_u64.saturating_pow(attempt.saturating_sub(1)).min(MAX_EXPONENTIAL_SECS);
	let jitter = rand::rng().random_range(0.0..MAX_JITTER_SECS);
	Duration::from_secs(base) + Duration::from_secs_f64(jitter)
}

/// Parses a `Retry-After` value, either delta-seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
	let value = value.trim();

	if let Ok(secs) = value.parse::<f64>() {
		return delay_from_secs(secs);
	}

	let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
	// A date in the past means "now"
	Some((at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(MAX_SERVER_DELAY))
}

/// Server-supplied seconds as a delay capped at [`MAX_SERVER_DELAY`].
/// Negative and NaN values are rejected.
pub fn delay_from_secs(secs: f64) -> Option<Duration> {
	if secs.is_nan() || secs < 0.0 {
		return None;
	}
	Some(Duration::try_from_secs_f64(secs).map_or(MAX_SERVER_DELAY, |delay| delay.min(MAX_SERVER_DELAY)))
}

/// Delay to apply after failed attempt number `attempt`.
///
/// A server-provided `Retry-After` wins verbatim; otherwise 429 gets at least
/// [`RATE_LIMITED_FLOOR`] and everything else the capped exponential.
pub fn backoff_for(attempt: u32, status: Option<u16>, retry_after: Option<Duration>) -> Duration {
	if let Some(delay) = retry_after {
		return delay;
	}

	let delay = exponential(attempt);
	if status == Some(429) {
		delay.max(RATE_LIMITED_FLOOR)
	} else {
		delay
	}
}
