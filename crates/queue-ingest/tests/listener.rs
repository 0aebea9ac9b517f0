use async_trait::async_trait;
use queue_ingest::{
	AdmissionBudget, AdmissionController, AudioProcessingJob, DegradedMode, EnvelopeMetadata, HandlerError, IngestError, InMemoryQueue, ListenerConfig, MemoryProbe,
	MessageHandler, ProbeError, QueueListener, RateLimitedDisposition,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy)]
enum Step {
	Succeed,
	Fail,
	RateLimited,
	Panic,
	Sleep(Duration),
}

/// Replays `script` one step per invocation, succeeding once it runs out.
struct ScriptedHandler {
	script: Mutex<Vec<Step>>,
	calls: AtomicU32,
	seen: Mutex<Vec<String>>,
}

impl ScriptedHandler {
	fn new(script: Vec<Step>) -> Arc<Self> {
		let mut script = script;
		script.reverse();
		Arc::new(Self {
			script: Mutex::new(script),
			calls: AtomicU32::new(0),
			seen: Mutex::new(Vec::new()),
		})
	}

	fn calls(&self) -> u32 {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
	async fn handle(&self, job: &AudioProcessingJob, _metadata: &EnvelopeMetadata) -> Result<(), HandlerError> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		self.seen.lock().unwrap().push(job.call_id.clone());

		let step = self.script.lock().unwrap().pop().unwrap_or(Step::Succeed);
		match step {
			Step::Succeed => Ok(()),
			Step::Fail => Err(HandlerError::Failed("transcription failed".to_string())),
			Step::RateLimited => Err(HandlerError::RateLimited { retry_after: 12.5 }),
			Step::Panic => panic!("handler exploded"),
			Step::Sleep(duration) => {
				tokio::time::sleep(duration).await;
				Ok(())
			}
		}
	}
}

struct FixedProbe(f64);

impl MemoryProbe for FixedProbe {
	fn used_percent(&self) -> Result<f64, ProbeError> {
		Ok(self.0)
	}
}

fn listener_with(queue: &Arc<InMemoryQueue>, handler: &Arc<ScriptedHandler>, config: ListenerConfig, memory_percent: f64) -> QueueListener {
	let admission = AdmissionController::new(AdmissionBudget::new(4, config.memory_ceiling_percent), Arc::new(FixedProbe(memory_percent)));
	QueueListener::new(queue.clone(), handler.clone(), admission, config)
}

fn listener(queue: &Arc<InMemoryQueue>, handler: &Arc<ScriptedHandler>, config: ListenerConfig) -> QueueListener {
	listener_with(queue, handler, config, 10.0)
}

async fn settle_for(duration: Duration) {
	tokio::time::sleep(duration).await;
}

#[tokio::test(start_paused = true)]
async fn test_missing_call_id_completed_without_handler() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![]);
	let listener = listener(&queue, &handler, ListenerConfig::default());

	let id = queue.push_json(&json!({"audioUrl": "https://example.com/a.mp3"}));
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(1)).await;
	listener.stop().await;

	assert_eq!(queue.completed(), vec![id]);
	assert!(queue.abandoned().is_empty());
	assert_eq!(handler.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_body_completed() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![]);
	let listener = listener(&queue, &handler, ListenerConfig::default());

	let id = queue.push("definitely not json");
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(1)).await;
	listener.stop().await;

	assert_eq!(queue.completed(), vec![id]);
	assert_eq!(handler.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_success_completes_and_failure_abandons() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![Step::Fail]);
	let listener = listener(&queue, &handler, ListenerConfig::default());

	let id = queue.push_json(&json!({"callId": "c-1"}));
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(10)).await;
	listener.stop().await;

	// First delivery fails and is abandoned, the redelivery succeeds
	assert_eq!(queue.abandoned(), vec![id.clone()]);
	assert_eq!(queue.completed(), vec![id]);
	assert_eq!(handler.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_panic_is_treated_as_failure() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![Step::Panic]);
	let listener = listener(&queue, &handler, ListenerConfig::default());

	let id = queue.push_json(&json!({"callId": "c-1"}));
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(10)).await;
	listener.stop().await;

	assert_eq!(queue.abandoned(), vec![id.clone()]);
	assert_eq!(queue.completed(), vec![id]);
	assert_eq!(listener.active_tasks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_completed_by_default() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![Step::RateLimited]);
	let listener = listener(&queue, &handler, ListenerConfig::default());

	let id = queue.push_json(&json!({"callId": "c-1"}));
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(10)).await;
	listener.stop().await;

	assert_eq!(queue.completed(), vec![id]);
	assert!(queue.abandoned().is_empty());
	assert_eq!(handler.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_abandoned_when_configured() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![Step::RateLimited]);
	let config = ListenerConfig {
		rate_limited_disposition: RateLimitedDisposition::Abandon,
		..ListenerConfig::default()
	};
	let listener = listener(&queue, &handler, config);

	let id = queue.push_json(&json!({"callId": "c-1"}));
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(10)).await;
	listener.stop().await;

	assert_eq!(queue.abandoned(), vec![id.clone()]);
	assert_eq!(queue.completed(), vec![id]);
}

#[tokio::test(start_paused = true)]
async fn test_second_start_is_rejected() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![]);
	let listener = listener(&queue, &handler, ListenerConfig::default());

	listener.start().await.unwrap();
	assert!(matches!(listener.start().await, Err(IngestError::AlreadyStarted)));
	assert_eq!(queue.connects(), 1);

	listener.stop().await;
	listener.stop().await;
	assert_eq!(queue.closes(), 1);
	assert!(!listener.is_running().await);
}

#[tokio::test(start_paused = true)]
async fn test_receive_errors_back_off_exponentially() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![]);
	let listener = listener(&queue, &handler, ListenerConfig::default());

	queue.fail_next_receives(3);
	listener.start().await.unwrap();

	// Failures at 0s, 5s and 15s, then the first successful receive at 35s
	settle_for(Duration::from_secs(34)).await;
	assert_eq!(queue.receive_calls(), 3);

	settle_for(Duration::from_secs(2)).await;
	assert_eq!(queue.receive_calls(), 4);

	// Backoff reset: the next message is picked up without delay
	let id = queue.push_json(&json!({"callId": "late"}));
	settle_for(Duration::from_millis(10)).await;
	assert_eq!(queue.completed(), vec![id]);

	listener.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_lock_renewed_while_handler_runs() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![Step::Sleep(Duration::from_secs(25))]);
	let listener = listener(&queue, &handler, ListenerConfig::default());

	let id = queue.push_json(&json!({"callId": "slow"}));
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(60)).await;

	let renewals = queue.renewals();
	assert_eq!(renewals.len(), 2);
	assert!(renewals.iter().all(|(renewed, _)| *renewed == id));
	assert_eq!(queue.completed(), vec![id]);

	listener.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_degraded_skip_completes_without_processing() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![]);
	let config = ListenerConfig {
		degraded_mode: DegradedMode::Skip,
		..ListenerConfig::default()
	};
	let listener = listener_with(&queue, &handler, config, 99.0);

	let id = queue.push_json(&json!({"callId": "c-1"}));
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(1)).await;
	listener.stop().await;

	assert_eq!(queue.completed(), vec![id]);
	assert_eq!(handler.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_degraded_inline_still_processes() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![]);
	let listener = listener_with(&queue, &handler, ListenerConfig::default(), 99.0);

	let first = queue.push_json(&json!({"callId": "a"}));
	let second = queue.push_json(&json!({"callId": "b"}));
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(1)).await;
	listener.stop().await;

	assert_eq!(queue.completed(), vec![first, second]);
	assert_eq!(*handler.seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_undispatched_messages() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![Step::Sleep(Duration::from_secs(10))]);
	let listener = Arc::new(listener_with(&queue, &handler, ListenerConfig::default(), 99.0));

	let first = queue.push_json(&json!({"callId": "a"}));
	let second = queue.push_json(&json!({"callId": "b"}));
	let third = queue.push_json(&json!({"callId": "c"}));
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(1)).await;

	// The first message is being processed inline; stop while it runs
	let start = Instant::now();
	listener.stop().await;

	assert!(start.elapsed() >= Duration::from_secs(8));
	assert_eq!(queue.completed(), vec![first]);
	assert_eq!(queue.abandoned(), vec![second, third]);
	assert_eq!(handler.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_drains_in_flight_work() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![Step::Sleep(Duration::from_secs(20))]);
	let listener = listener(&queue, &handler, ListenerConfig::default());

	let id = queue.push_json(&json!({"callId": "c-1"}));
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(1)).await;
	assert_eq!(listener.active_tasks(), 1);

	listener.stop().await;

	assert_eq!(queue.completed(), vec![id]);
	assert_eq!(listener.active_tasks(), 0);
	assert_eq!(queue.closes(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_aborts_work_past_drain_timeout() {
	let queue = Arc::new(InMemoryQueue::new());
	let handler = ScriptedHandler::new(vec![Step::Sleep(Duration::from_secs(3600))]);
	let listener = listener(&queue, &handler, ListenerConfig::default());

	queue.push_json(&json!({"callId": "stuck"}));
	listener.start().await.unwrap();
	settle_for(Duration::from_secs(1)).await;

	let start = Instant::now();
	listener.stop().await;
	assert!(start.elapsed() >= Duration::from_secs(30) && start.elapsed() < Duration::from_secs(60));

	assert_eq!(listener.active_tasks(), 0);
	assert!(queue.completed().is_empty());
	assert_eq!(queue.locked_len(), 1);

	let renewals = queue.renewals().len();
	settle_for(Duration::from_secs(60)).await;
	assert_eq!(queue.renewals().len(), renewals);
}
