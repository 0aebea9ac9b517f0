use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::{global, KeyValue};
use std::sync::OnceLock;
use std::time::Instant;

struct Metrics {
	received: Counter<u64>,
	settled: Counter<u64>,
	degraded: Counter<u64>,
	receive_errors: Counter<u64>,
	handler_duration: Histogram<f64>,
}

impl Metrics {
	fn get() -> &'static Self {
		static INSTANCE: OnceLock<Metrics> = OnceLock::new();
		INSTANCE.get_or_init(|| {
			let meter = global::meter("queue_ingest");
			Self {
				received: meter.u64_counter("queue.messages.received").with_description("Messages received from the queue").build(),
				settled: meter
					.u64_counter("queue.messages.settled")
					.with_description("Messages completed or abandoned, by reason")
					.build(),
				degraded: meter
					.u64_counter("queue.dispatch.degraded")
					.with_description("Messages refused by admission control")
					.build(),
				receive_errors: meter.u64_counter("queue.receive.errors").with_description("Failed receive calls").build(),
				handler_duration: meter
					.f64_histogram("queue.handler.duration")
					.with_description("Handler run time in seconds")
					.with_unit("s")
					.build(),
			}
		})
	}
}

pub fn record_received(count: usize) {
	Metrics::get().received.add(count as u64, &[]);
}

/// `disposition` is `complete` or `abandon`; `reason` says why.
pub fn record_settled(disposition: &'static str, reason: &'static str) {
	Metrics::get()
		.settled
		.add(1, &[KeyValue::new("disposition", disposition), KeyValue::new("reason", reason)]);
}

pub fn record_degraded(mode: &'static str) {
	Metrics::get().degraded.add(1, &[KeyValue::new("mode", mode)]);
}

pub fn record_receive_error() {
	Metrics::get().receive_errors.add(1, &[]);
}

pub struct HandlerTimer {
	start: Instant,
}

impl HandlerTimer {
	pub fn start() -> Self {
		Self { start: Instant::now() }
	}

	pub fn finish(self, outcome: &'static str) {
		Metrics::get()
			.handler_duration
			.record(self.start.elapsed().as_secs_f64(), &[KeyValue::new("outcome", outcome)]);
	}
}
