use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sysinfo::System;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

pub const MAX_WORKER_CAP: usize = 32;
pub const DEFAULT_MEMORY_CEILING_PERCENT: f64 = 85.0;

#[derive(Error, Debug)]
#[error("Memory probe failed: {0}")]
pub struct ProbeError(pub String);

/// Reports system memory utilisation in percent.
pub trait MemoryProbe: Send + Sync {
	fn used_percent(&self) -> Result<f64, ProbeError>;
}

#[derive(Debug, Default)]
pub struct SysinfoProbe {
	system: Mutex<System>,
}

impl SysinfoProbe {
	pub fn new() -> Self {
		Self::default()
	}
}

impl MemoryProbe for SysinfoProbe {
	fn used_percent(&self) -> Result<f64, ProbeError> {
		let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
		system.refresh_memory();

		let total = system.total_memory();
		if total == 0 {
			return Err(ProbeError("total memory reported as zero".to_string()));
		}

		#[allow(clippy::cast_precision_loss)]
		let percent = system.used_memory() as f64 * 100.0 / total as f64;
		Ok(percent)
	}
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionBudget {
	pub max_workers: usize,
	pub memory_ceiling_percent: f64,
}

impl AdmissionBudget {
	/// `min(32, cpus + 4)` workers and an 85% memory ceiling.
	pub fn from_host() -> Self {
		Self::new(MAX_WORKER_CAP.min(num_cpus::get() + 4), DEFAULT_MEMORY_CEILING_PERCENT)
	}

	pub fn new(max_workers: usize, memory_ceiling_percent: f64) -> Self {
		Self {
			max_workers: max_workers.max(1),
			memory_ceiling_percent,
		}
	}
}

impl Default for AdmissionBudget {
	fn default() -> Self {
		Self::from_host()
	}
}

/// Holds one `active_tasks` slot until dropped.
struct ActiveSlot(Arc<AtomicUsize>);

impl Drop for ActiveSlot {
	fn drop(&mut self) {
		self.0.fetch_sub(1, Ordering::AcqRel);
	}
}

/// Gates dispatch onto a bounded pool by task count and memory pressure.
pub struct AdmissionController {
	budget: AdmissionBudget,
	probe: Arc<dyn MemoryProbe>,
	active: Arc<AtomicUsize>,
	pool: Mutex<JoinSet<()>>,
}

impl AdmissionController {
	pub fn new(budget: AdmissionBudget, probe: Arc<dyn MemoryProbe>) -> Self {
		Self {
			budget,
			probe,
			active: Arc::new(AtomicUsize::new(0)),
			pool: Mutex::new(JoinSet::new()),
		}
	}

	pub const fn budget(&self) -> AdmissionBudget {
		self.budget
	}

	pub fn active_tasks(&self) -> usize {
		self.active.load(Ordering::Acquire)
	}

	fn pool(&self) -> MutexGuard<'_, JoinSet<()>> {
		self.pool.lock().unwrap_or_else(PoisonError::into_inner)
	}

	pub fn can_admit(&self) -> bool {
		self.admits(self.active_tasks())
	}

	fn admits(&self, active: usize) -> bool {
		if active >= self.budget.max_workers {
			return false;
		}

		match self.probe.used_percent() {
			Ok(percent) if percent > self.budget.memory_ceiling_percent => {
				debug!(percent, ceiling = self.budget.memory_ceiling_percent, "Memory above ceiling");
				false
			}
			Ok(_) => true,
			Err(e) => {
				warn!(error = %e, "Memory probe unavailable, using half the worker budget");
				active < self.budget.max_workers / 2
			}
		}
	}

	fn reserve(&self) -> Option<ActiveSlot> {
		let max = self.budget.max_workers;
		self.active.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < max).then_some(n + 1)).ok()?;
		let slot = ActiveSlot(self.active.clone());

		// The slot already counts against the budget, compare with what was there before
		if self.admits(self.active_tasks().saturating_sub(1)) {
			Some(slot)
		} else {
			None
		}
	}

	/// Spawns `work` on the pool when admitted, otherwise hands it back untouched.
	pub fn try_dispatch<F>(&self, work: F) -> Result<(), F>
	where
		F: Future<Output = ()> + Send + 'static,
	{
		self.reap();

		let Some(slot) = self.reserve() else {
			return Err(work);
		};

		self.pool().spawn(async move {
			let _slot = slot;
			work.await;
		});
		Ok(())
	}

	/// Collects finished tasks and logs panics.
	pub fn reap(&self) {
		let mut pool = self.pool();
		while let Some(result) = pool.try_join_next() {
			log_join(result);
		}
	}

	/// Waits for every dispatched task to finish.
	///
	/// Dropping the future before it resolves aborts the work it was waiting on.
	pub async fn wait_idle(&self) {
		let mut tasks = std::mem::take(&mut *self.pool());
		while let Some(result) = tasks.join_next().await {
			log_join(result);
		}
	}

	/// Like [`wait_idle`](Self::wait_idle) but aborts whatever is still running after
	/// `timeout`. Returns whether everything finished on its own.
	pub async fn drain(&self, timeout: Duration) -> bool {
		let mut tasks = std::mem::take(&mut *self.pool());
		let finished = tokio::time::timeout(timeout, async {
			while let Some(result) = tasks.join_next().await {
				log_join(result);
			}
		})
		.await
		.is_ok();

		if !finished {
			warn!(remaining = tasks.len(), "Aborting dispatched work");
			tasks.abort_all();
			// Aborted tasks release their slots once they are actually dropped
			while tasks.join_next().await.is_some() {}
		}
		finished
	}

	pub async fn abort_all(&self) {
		let mut tasks = std::mem::take(&mut *self.pool());
		tasks.abort_all();
		while tasks.join_next().await.is_some() {}
	}
}

fn log_join(result: Result<(), tokio::task::JoinError>) {
	if let Err(e) = result {
		if e.is_panic() {
			error!(error = %e, "💥 Dispatched task panicked");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;
	use tokio::sync::oneshot;

	struct FixedProbe(Option<f64>);

	impl MemoryProbe for FixedProbe {
		fn used_percent(&self) -> Result<f64, ProbeError> {
			self.0.ok_or_else(|| ProbeError("unavailable".to_string()))
		}
	}

	fn controller(max_workers: usize, memory: Option<f64>) -> AdmissionController {
		AdmissionController::new(AdmissionBudget::new(max_workers, 85.0), Arc::new(FixedProbe(memory)))
	}

	#[test]
	fn test_host_budget_is_capped() {
		let budget = AdmissionBudget::from_host();
		assert!(budget.max_workers >= 5 && budget.max_workers <= MAX_WORKER_CAP);
		assert!((budget.memory_ceiling_percent - 85.0).abs() < f64::EPSILON);
	}

	#[tokio::test]
	async fn test_denies_when_pool_is_full() {
		let admission = controller(2, Some(10.0));
		let (release, gate) = oneshot::channel::<()>();
		let gate = Arc::new(tokio::sync::Mutex::new(Some(gate)));

		for _ in 0..2 {
			let gate = gate.clone();
			let dispatched = admission.try_dispatch(async move {
				if let Some(rx) = gate.lock().await.take() {
					let _ = rx.await;
				}
			});
			assert!(dispatched.is_ok());
		}

		assert!(admission.try_dispatch(async {}).is_err());
		drop(release);
		admission.wait_idle().await;
		assert_eq!(admission.active_tasks(), 0);
	}

	#[tokio::test]
	async fn test_denies_above_memory_ceiling() {
		let admission = controller(8, Some(90.0));
		assert!(!admission.can_admit());
		assert!(admission.try_dispatch(async {}).is_err());
		assert_eq!(admission.active_tasks(), 0);
	}

	#[tokio::test]
	async fn test_probe_failure_halves_budget() {
		let admission = controller(4, None);
		let (_hold, gate) = oneshot::channel::<()>();
		let gate = Arc::new(tokio::sync::Mutex::new(gate));

		let mut admitted = 0;
		for _ in 0..4 {
			let gate = gate.clone();
			if admission
				.try_dispatch(async move {
					let _ = (&mut *gate.lock().await).await;
				})
				.is_ok()
			{
				admitted += 1;
			}
		}

		assert_eq!(admitted, 2);
		admission.abort_all().await;
		assert_eq!(admission.active_tasks(), 0);
	}

	#[tokio::test]
	async fn test_panicking_work_releases_slot() {
		let admission = controller(2, Some(10.0));
		assert!(admission.try_dispatch(async { panic!("handler blew up") }).is_ok());

		admission.wait_idle().await;
		assert_eq!(admission.active_tasks(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_drain_aborts_after_timeout() {
		let admission = controller(3, Some(10.0));
		assert!(admission.try_dispatch(tokio::time::sleep(Duration::from_secs(5))).is_ok());
		assert!(admission.try_dispatch(tokio::time::sleep(Duration::from_secs(3600))).is_ok());

		assert!(!admission.drain(Duration::from_secs(30)).await);
		assert_eq!(admission.active_tasks(), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn test_abort_releases_slots() {
		let admission = controller(3, Some(10.0));
		for _ in 0..3 {
			assert!(admission.try_dispatch(tokio::time::sleep(Duration::from_secs(3600))).is_ok());
		}
		assert_eq!(admission.active_tasks(), 3);

		admission.abort_all().await;
		assert_eq!(admission.active_tasks(), 0);
	}

	proptest! {
		#[test]
		fn prop_active_tasks_never_negative_and_drains(
			max_workers in 1usize..8,
			jobs in proptest::collection::vec((0u64..50, any::<bool>()), 0..40),
		) {
			let runtime = tokio::runtime::Builder::new_current_thread().enable_time().start_paused(true).build().unwrap();

			runtime.block_on(async {
				let admission = controller(max_workers, Some(10.0));

				for (millis, panics) in jobs {
					let work = async move {
						tokio::time::sleep(Duration::from_millis(millis)).await;
						assert!(!panics, "scripted panic");
					};
					if let Err(work) = admission.try_dispatch(work) {
						let _ = tokio::spawn(work).await;
					}
					prop_assert!(admission.active_tasks() <= max_workers);
				}

				admission.wait_idle().await;
				prop_assert_eq!(admission.active_tasks(), 0);
				Ok::<(), TestCaseError>(())
			})?;
		}
	}
}
