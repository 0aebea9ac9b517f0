//! Process-local queue with peek-lock semantics, used for local runs and tests.

use crate::backend::{QueueBackend, QueueSender};
use crate::envelope::{EnvelopeMetadata, LockToken, QueueEnvelope};
use crate::error::{IngestError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Stored {
	body: Bytes,
	metadata: EnvelopeMetadata,
}

#[derive(Debug, Default)]
struct State {
	connected: bool,
	ready: VecDeque<Stored>,
	locked: HashMap<LockToken, Stored>,
	next_id: u64,
	scripted_receive_failures: u32,
	fail_renewals: bool,
	receive_calls: u32,
	connects: u32,
	closes: u32,
	completed: Vec<String>,
	abandoned: Vec<String>,
	renewals: Vec<(String, Instant)>,
	sent: Vec<(Bytes, HashMap<String, String>)>,
}

#[derive(Debug, Default)]
pub struct InMemoryQueue {
	state: Mutex<State>,
	arrivals: Notify,
}

impl InMemoryQueue {
	pub fn new() -> Self {
		Self::default()
	}

	fn state(&self) -> MutexGuard<'_, State> {
		self.state.lock().unwrap_or_else(PoisonError::into_inner)
	}

	/// Enqueues a body and returns its message id.
	pub fn push(&self, body: impl Into<Bytes>) -> String {
		self.push_with(body, EnvelopeMetadata::default())
	}

	pub fn push_json(&self, value: &serde_json::Value) -> String {
		self.push(value.to_string())
	}

	pub fn push_with(&self, body: impl Into<Bytes>, mut metadata: EnvelopeMetadata) -> String {
		let id = {
			let mut state = self.state();
			state.next_id += 1;
			let id = metadata.message_id.clone().unwrap_or_else(|| format!("msg-{}", state.next_id));
			metadata.message_id = Some(id.clone());
			metadata.enqueued_time.get_or_insert_with(Utc::now);
			state.ready.push_back(Stored { body: body.into(), metadata });
			id
		};
		self.arrivals.notify_waiters();
		id
	}

	/// The next `count` receive calls fail with a backend error.
	pub fn fail_next_receives(&self, count: u32) {
		self.state().scripted_receive_failures = count;
	}

	pub fn fail_renewals(&self, fail: bool) {
		self.state().fail_renewals = fail;
	}

	pub fn completed(&self) -> Vec<String> {
		self.state().completed.clone()
	}

	pub fn abandoned(&self) -> Vec<String> {
		self.state().abandoned.clone()
	}

	pub fn renewals(&self) -> Vec<(String, Instant)> {
		self.state().renewals.clone()
	}

	pub fn sent(&self) -> Vec<(Bytes, HashMap<String, String>)> {
		self.state().sent.clone()
	}

	pub fn receive_calls(&self) -> u32 {
		self.state().receive_calls
	}

	pub fn connects(&self) -> u32 {
		self.state().connects
	}

	pub fn closes(&self) -> u32 {
		self.state().closes
	}

	/// Messages waiting for delivery, excluding locked ones.
	pub fn ready_len(&self) -> usize {
		self.state().ready.len()
	}

	pub fn locked_len(&self) -> usize {
		self.state().locked.len()
	}

	fn take_batch(&self, max_messages: usize) -> Vec<QueueEnvelope> {
		let mut state = self.state();
		let mut batch = Vec::new();

		while batch.len() < max_messages {
			let Some(mut stored) = state.ready.pop_front() else {
				break;
			};
			stored.metadata.delivery_count += 1;
			state.next_id += 1;
			let lock = LockToken::new(format!("lock-{}", state.next_id));
			state.locked.insert(lock.clone(), stored.clone());

			batch.push(QueueEnvelope {
				body: stored.body,
				metadata: stored.metadata,
				lock_token: lock,
			});
		}
		batch
	}

	fn settle(&self, lock: &LockToken) -> Result<Stored> {
		self.state().locked.remove(lock).ok_or_else(|| IngestError::AlreadySettled(lock.to_string()))
	}
}

fn message_id(stored: &Stored) -> String {
	stored.metadata.message_id.clone().unwrap_or_default()
}

#[async_trait]
impl QueueBackend for InMemoryQueue {
	async fn connect(&self) -> Result<()> {
		let mut state = self.state();
		state.connected = true;
		state.connects += 1;
		Ok(())
	}

	async fn receive(&self, max_messages: usize, max_wait: Duration) -> Result<Vec<QueueEnvelope>> {
		{
			let mut state = self.state();
			state.receive_calls += 1;
			if !state.connected {
				return Err(IngestError::NotConnected);
			}
			if state.scripted_receive_failures > 0 {
				state.scripted_receive_failures -= 1;
				return Err(IngestError::Backend("scripted receive failure".to_string()));
			}
		}

		let deadline = Instant::now() + max_wait;
		loop {
			let arrival = self.arrivals.notified();
			let batch = self.take_batch(max_messages.max(1));
			if !batch.is_empty() {
				return Ok(batch);
			}
			if tokio::time::timeout_at(deadline, arrival).await.is_err() {
				return Ok(Vec::new());
			}
		}
	}

	async fn complete(&self, lock: &LockToken) -> Result<()> {
		let stored = self.settle(lock)?;
		self.state().completed.push(message_id(&stored));
		Ok(())
	}

	async fn abandon(&self, lock: &LockToken) -> Result<()> {
		let stored = self.settle(lock)?;
		{
			let mut state = self.state();
			state.abandoned.push(message_id(&stored));
			state.ready.push_back(stored);
		}
		self.arrivals.notify_waiters();
		Ok(())
	}

	async fn renew_lock(&self, lock: &LockToken) -> Result<()> {
		let mut state = self.state();
		if state.fail_renewals {
			return Err(IngestError::Backend("scripted renewal failure".to_string()));
		}

		let id = state.locked.get(lock).map(message_id).ok_or_else(|| IngestError::AlreadySettled(lock.to_string()))?;
		state.renewals.push((id, Instant::now()));
		Ok(())
	}

	async fn close(&self) -> Result<()> {
		let mut state = self.state();
		state.connected = false;
		state.closes += 1;
		Ok(())
	}
}

#[async_trait]
impl QueueSender for InMemoryQueue {
	async fn send(&self, body: Bytes, properties: HashMap<String, String>) -> Result<()> {
		self.state().sent.push((body, properties));
		Ok(())
	}
}
