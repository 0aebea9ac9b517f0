use std::collections::VecDeque;
use std::sync::{Mutex as SyncMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

const WINDOW: Duration = Duration::from_secs(60);

/// Allows at most `capacity` calls in any rolling 60 second window.
///
/// Waiters queue on a fair async mutex, so they are admitted in arrival order.
/// The call history sits behind its own short-lived lock, and [`reset`](Self::reset)
/// wakes the waiter at the head of the queue.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
	capacity: usize,
	window: Duration,
	turn: Mutex<()>,
	calls: SyncMutex<VecDeque<Instant>>,
	cleared: Notify,
}

impl SlidingWindowLimiter {
	pub fn per_minute(capacity: usize) -> Self {
		Self::new(capacity, WINDOW)
	}

	pub fn new(capacity: usize, window: Duration) -> Self {
		Self {
			capacity: capacity.max(1),
			window,
			turn: Mutex::new(()),
			calls: SyncMutex::new(VecDeque::with_capacity(capacity)),
			cleared: Notify::new(),
		}
	}

	fn calls(&self) -> MutexGuard<'_, VecDeque<Instant>> {
		self.calls.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Records the call when a slot is free, otherwise returns when the oldest one expires.
	fn try_record(&self) -> Result<(), Instant> {
		let mut calls = self.calls();
		let now = Instant::now();
		while calls.front().is_some_and(|at| now.duration_since(*at) >= self.window) {
			calls.pop_front();
		}

		if calls.len() < self.capacity {
			calls.push_back(now);
			return Ok(());
		}
		Err(calls.front().map_or(now, |oldest| *oldest + self.window))
	}

	/// Suspends until a slot is free, then records the call.
	pub async fn acquire(&self) {
		let _turn = self.turn.lock().await;

		loop {
			// Registered before the check so a concurrent reset is never missed
			let cleared = self.cleared.notified();

			let resume = match self.try_record() {
				Ok(()) => return,
				Err(resume) => resume,
			};

			debug!(
				wait_ms = u64::try_from(resume.saturating_duration_since(Instant::now()).as_millis()).unwrap_or(u64::MAX),
				"Transcription quota reached, waiting"
			);
			tokio::select! {
				() = tokio::time::sleep_until(resume) => {}
				() = cleared => {}
			}
		}
	}

	/// Forgets the recorded calls; a caller currently waiting is admitted right away.
	pub fn reset(&self) {
		self.calls().clear();
		self.cleared.notify_waiters();
	}

	pub fn recorded(&self) -> usize {
		self.calls().len()
	}
}
