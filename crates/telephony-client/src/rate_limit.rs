use crate::error::{Result, TelephonyError};
use crate::token::AccessToken;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

// Stand-in when `now + backoff` is not representable
const MAX_DEFERRAL: Duration = Duration::from_secs(86_400);

/// How a caller reacts when the shared throttle window is still open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitMode {
	/// Fail fast with [`TelephonyError::RateLimitActive`] carrying the remaining wait.
	Strict,
	/// Sleep until the window closes, then proceed.
	#[default]
	Lenient,
}

impl RateLimitMode {
	pub const fn from_strict(strict: bool) -> Self {
		if strict {
			Self::Strict
		} else {
			Self::Lenient
		}
	}
}

#[derive(Debug, Default)]
struct RateLimitState {
	next_allowed_at: Option<Instant>,
	cached_token: Option<AccessToken>,
}

/// Process-wide throttle clock and credential cache.
///
/// Every outbound call consults the same instance, so a backoff computed by
/// one worker is honored by all of them. `next_allowed_at` only ever moves
/// forward while a window is open.
#[derive(Debug, Default)]
pub struct RateLimiter {
	state: Mutex<RateLimitState>,
}

impl RateLimiter {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, RateLimitState> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn next_allowed_at(&self) -> Option<Instant> {
		self.state().next_allowed_at
	}

	/// Time left before a new call may start, `None` when calls are allowed now.
	pub fn remaining(&self) -> Option<Duration> {
		let now = Instant::now();
		self.state().next_allowed_at.filter(|at| *at > now).map(|at| at - now)
	}

	/// Pushes the throttle clock to at least `now + backoff` and returns the new value.
	pub fn defer_for(&self, backoff: Duration) -> Instant {
		let now = Instant::now();
		let candidate = now.checked_add(backoff).unwrap_or_else(|| now + MAX_DEFERRAL);
		let mut state = self.state();
		let next = state.next_allowed_at.map_or(candidate, |current| current.max(candidate));
		state.next_allowed_at = Some(next);
		next
	}

	/// Gate a call attempt on the shared clock.
	///
	/// Lenient callers re-check after sleeping since another worker may have
	/// extended the window in the meantime.
	pub async fn wait_turn(&self, mode: RateLimitMode) -> Result<()> {
		while let Some(wait) = self.remaining() {
			match mode {
				RateLimitMode::Strict => {
					return Err(TelephonyError::RateLimitActive {
						retry_after: wait.as_secs_f64(),
					})
				}
				RateLimitMode::Lenient => {
					debug!(wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX), "Waiting for shared rate limit window");
					tokio::time::sleep(wait).await;
				}
			}
		}
		Ok(())
	}

	/// Cached token if it stays valid for at least `min_validity`.
	pub fn cached_token(&self, min_validity: Duration) -> Option<AccessToken> {
		let horizon = Instant::now() + min_validity;
		self.state().cached_token.as_ref().filter(|token| token.expires_at > horizon).cloned()
	}

	pub fn store_token(&self, token: AccessToken) {
		self.state().cached_token = Some(token);
	}

	pub fn invalidate_token(&self) {
		self.state().cached_token = None;
	}
}
