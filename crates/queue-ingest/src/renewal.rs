use crate::backend::QueueBackend;
use crate::envelope::LockToken;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenewalConfig {
	pub interval: Duration,
	pub hard_timeout: Duration,
}

impl Default for RenewalConfig {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(10),
			hard_timeout: Duration::from_secs(600),
		}
	}
}

/// Keeps a message lease alive while its handler runs.
pub struct LockRenewalTask;

impl LockRenewalTask {
	pub fn spawn(backend: Arc<dyn QueueBackend>, lock: LockToken, config: RenewalConfig) -> LockRenewalHandle {
		let token = CancellationToken::new();
		let join = tokio::spawn(run(backend, lock, config, token.clone()));

		LockRenewalHandle {
			guard: Some(token.drop_guard()),
			join,
		}
	}
}

/// Cancels the renewal loop when dropped.
pub struct LockRenewalHandle {
	guard: Option<DropGuard>,
	join: JoinHandle<u32>,
}

impl LockRenewalHandle {
	/// Stops renewing and returns how many renewals succeeded.
	pub async fn cancel(mut self) -> u32 {
		drop(self.guard.take());
		(&mut self.join).await.unwrap_or(0)
	}
}

async fn run(backend: Arc<dyn QueueBackend>, lock: LockToken, config: RenewalConfig, token: CancellationToken) -> u32 {
	let started_at = Instant::now();
	let deadline = started_at + config.hard_timeout;
	let mut ticks = interval_at(started_at + config.interval, config.interval);
	ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
	let mut renewed = 0;

	loop {
		tokio::select! {
			biased;
			() = token.cancelled() => break,
			() = tokio::time::sleep_until(deadline) => {
				warn!(lock = %lock, timeout_secs = config.hard_timeout.as_secs(), "Lock renewal hit its hard timeout");
				break;
			}
			_ = ticks.tick() => {}
		}

		tokio::select! {
			biased;
			() = token.cancelled() => break,
			result = backend.renew_lock(&lock) => match result {
				Ok(()) => {
					renewed += 1;
					debug!(lock = %lock, renewed, "Lock renewed");
				}
				Err(e) => {
					warn!(lock = %lock, error = %e, "Lock renewal failed, giving up");
					break;
				}
			},
		}
	}

	renewed
}
