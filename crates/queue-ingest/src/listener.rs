use crate::admission::{AdmissionController, SysinfoProbe};
use crate::backend::QueueBackend;
use crate::config::ListenerConfig;
use crate::envelope::{LockToken, QueueEnvelope};
use crate::error::{IngestError, Result};
use crate::handler::{DegradedMode, HandlerError, MessageHandler, RateLimitedDisposition};
use crate::job::{AudioProcessingJob, JobError};
use crate::metrics::{self, HandlerTimer};
use crate::renewal::LockRenewalTask;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
	Complete,
	Abandon,
}

impl Disposition {
	const fn as_str(self) -> &'static str {
		match self {
			Self::Complete => "complete",
			Self::Abandon => "abandon",
		}
	}
}

impl From<RateLimitedDisposition> for Disposition {
	fn from(policy: RateLimitedDisposition) -> Self {
		match policy {
			RateLimitedDisposition::Complete => Self::Complete,
			RateLimitedDisposition::Abandon => Self::Abandon,
		}
	}
}

struct Shared {
	backend: Arc<dyn QueueBackend>,
	handler: Arc<dyn MessageHandler>,
	admission: AdmissionController,
	config: ListenerConfig,
}

struct Running {
	token: CancellationToken,
	task: JoinHandle<()>,
}

/// Receives audio jobs, dispatches them through admission control and settles each
/// message once its handler has finished.
pub struct QueueListener {
	shared: Arc<Shared>,
	running: Mutex<Option<Running>>,
}

impl QueueListener {
	pub fn new(backend: Arc<dyn QueueBackend>, handler: Arc<dyn MessageHandler>, admission: AdmissionController, config: ListenerConfig) -> Self {
		Self {
			shared: Arc::new(Shared {
				backend,
				handler,
				admission,
				config,
			}),
			running: Mutex::new(None),
		}
	}

	/// Listener gated by live system memory readings.
	pub fn from_config(backend: Arc<dyn QueueBackend>, handler: Arc<dyn MessageHandler>, config: ListenerConfig) -> Self {
		let admission = AdmissionController::new(config.admission_budget(), Arc::new(SysinfoProbe::new()));
		Self::new(backend, handler, admission, config)
	}

	pub async fn start(&self) -> Result<()> {
		let mut running = self.running.lock().await;
		if running.is_some() {
			return Err(IngestError::AlreadyStarted);
		}

		self.shared.backend.connect().await?;

		let token = CancellationToken::new();
		let task = tokio::spawn(self.shared.clone().receive_loop(token.clone()));
		*running = Some(Running { token, task });

		let budget = self.shared.admission.budget();
		info!(
			max_workers = budget.max_workers,
			memory_ceiling_percent = budget.memory_ceiling_percent,
			batch_size = self.shared.config.batch_size(),
			"🎧 Queue listener started"
		);
		Ok(())
	}

	pub async fn is_running(&self) -> bool {
		self.running.lock().await.is_some()
	}

	pub fn active_tasks(&self) -> usize {
		self.shared.admission.active_tasks()
	}

	/// Stops receiving, drains in-flight work and closes the backend.
	///
	/// Work still running after the drain timeout is aborted; its messages stay
	/// unsettled and are redelivered once their lease lapses.
	pub async fn stop(&self) {
		let Some(running) = self.running.lock().await.take() else {
			debug!("Queue listener not running");
			return;
		};

		info!("🛑 Stopping queue listener");
		running.token.cancel();
		if let Err(e) = running.task.await {
			error!(error = %e, "Receive loop ended abnormally");
		}

		let drain = self.shared.config.drain_timeout;
		if !self.shared.admission.drain(drain).await {
			warn!(drain_secs = drain.as_secs(), "In-flight work did not finish in time");
		}
		self.shared.admission.abort_all().await;

		if let Err(e) = self.shared.backend.close().await {
			warn!(error = %e, "Failed to close queue backend");
		}
		info!("Queue listener stopped");
	}
}

impl Shared {
	async fn receive_loop(self: Arc<Self>, token: CancellationToken) {
		let initial = self.config.initial_backoff();
		let max = self.config.max_backoff();
		let mut backoff = initial;

		loop {
			let received = tokio::select! {
				biased;
				() = token.cancelled() => break,
				received = self.backend.receive(self.config.batch_size(), self.config.max_wait) => received,
			};

			match received {
				Ok(batch) => {
					backoff = initial;
					if batch.is_empty() {
						continue;
					}

					debug!(count = batch.len(), "Received message batch");
					metrics::record_received(batch.len());
					self.dispatch_batch(batch, &token).await;
				}
				Err(e) => {
					error!(error = %e, backoff_secs = backoff.as_secs(), "❌ Queue receive failed, backing off");
					metrics::record_receive_error();

					tokio::select! {
						() = token.cancelled() => break,
						() = tokio::time::sleep(backoff) => {}
					}
					backoff = (backoff * 2).min(max);
				}
			}
		}

		debug!("Receive loop exited");
	}

	async fn dispatch_batch(self: &Arc<Self>, batch: Vec<QueueEnvelope>, token: &CancellationToken) {
		let mut pending = batch.into_iter();

		for envelope in pending.by_ref() {
			if token.is_cancelled() {
				self.settle(&envelope, Disposition::Abandon, "shutdown").await;
				break;
			}
			self.route(envelope).await;
		}

		// Hand undispatched messages back for immediate redelivery
		for envelope in pending {
			self.settle(&envelope, Disposition::Abandon, "shutdown").await;
		}
	}

	async fn route(self: &Arc<Self>, envelope: QueueEnvelope) {
		let job = match AudioProcessingJob::from_body(&envelope.body) {
			Ok(job) => job,
			Err(JobError::MissingCallId) => {
				warn!(message_id = envelope.display_id(), "Dropping message without callId");
				self.settle(&envelope, Disposition::Complete, "missing_call_id").await;
				return;
			}
			Err(e) => {
				warn!(message_id = envelope.display_id(), error = %e, "Dropping undecodable message");
				self.settle(&envelope, Disposition::Complete, "malformed").await;
				return;
			}
		};

		let lock = envelope.lock_token.clone();
		let unit = self.clone().process(envelope, job);

		let Err(unit) = self.admission.try_dispatch(unit) else {
			return;
		};

		match self.config.degraded_mode {
			DegradedMode::Inline => {
				warn!(lock = %lock, active = self.admission.active_tasks(), "⚠️ Admission denied, processing inline");
				metrics::record_degraded("inline");
				unit.await;
			}
			DegradedMode::Skip => {
				warn!(lock = %lock, active = self.admission.active_tasks(), "⚠️ Admission denied, skipping message");
				metrics::record_degraded("skip");
				drop(unit);
				self.settle_lock(&lock, Disposition::Complete, "skipped").await;
			}
		}
	}

	#[instrument(skip_all, fields(message_id = envelope.display_id(), call_id = %job.call_id))]
	async fn process(self: Arc<Self>, envelope: QueueEnvelope, job: AudioProcessingJob) {
		let renewal = LockRenewalTask::spawn(self.backend.clone(), envelope.lock_token.clone(), self.config.renewal());
		let timer = HandlerTimer::start();

		let outcome = AssertUnwindSafe(self.handler.handle(&job, &envelope.metadata)).catch_unwind().await;

		let renewals = renewal.cancel().await;
		debug!(renewals, "Lock renewal stopped");

		let (disposition, reason) = match outcome {
			Ok(Ok(())) => {
				timer.finish("success");
				(Disposition::Complete, "processed")
			}
			Ok(Err(HandlerError::RateLimited { retry_after })) => {
				timer.finish("rate_limited");
				let disposition = Disposition::from(self.config.rate_limited_disposition);
				warn!(retry_after, disposition = disposition.as_str(), "⏳ Rate limit active, job not attempted");
				(disposition, "rate_limited")
			}
			Ok(Err(HandlerError::Failed(reason))) => {
				timer.finish("failure");
				error!(%reason, "Handler failed");
				(Disposition::Abandon, "handler_failed")
			}
			Err(panic) => {
				timer.finish("panic");
				error!(panic = panic_message(panic.as_ref()), "💥 Handler panicked");
				(Disposition::Abandon, "handler_panicked")
			}
		};

		self.settle(&envelope, disposition, reason).await;
	}

	async fn settle(&self, envelope: &QueueEnvelope, disposition: Disposition, reason: &'static str) {
		self.settle_lock(&envelope.lock_token, disposition, reason).await;
	}

	async fn settle_lock(&self, lock: &LockToken, disposition: Disposition, reason: &'static str) {
		let result = match disposition {
			Disposition::Complete => self.backend.complete(lock).await,
			Disposition::Abandon => self.backend.abandon(lock).await,
		};

		match result {
			Ok(()) => {
				debug!(lock = %lock, disposition = disposition.as_str(), reason, "Message settled");
				metrics::record_settled(disposition.as_str(), reason);
			}
			Err(e) => warn!(lock = %lock, disposition = disposition.as_str(), error = %e, "Failed to settle message"),
		}
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
	payload
		.downcast_ref::<&str>()
		.copied()
		.or_else(|| payload.downcast_ref::<String>().map(String::as_str))
		.unwrap_or("non-string panic payload")
}
