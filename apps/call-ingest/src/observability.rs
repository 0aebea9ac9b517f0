use opentelemetry::{global, trace::TracerProvider as _, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
	metrics::{PeriodicReader, SdkMeterProvider},
	trace::{RandomIdGenerator, Sampler, SdkTracerProvider},
	Resource,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Error, Debug)]
pub enum ObservabilityError {
	#[error("Failed to initialize OTLP exporter: {0}")]
	ExporterInit(#[from] opentelemetry_otlp::ExporterBuildError),

	#[error("OpenTelemetry error: {0}")]
	OpenTelemetry(String),
}

pub struct OtelGuard {
	tracer_provider: SdkTracerProvider,
	meter_provider: SdkMeterProvider,
}

impl OtelGuard {
	/// Install OTLP trace and metric export plus the tracing subscriber.
	pub fn new(service_name: &str) -> Result<Self, ObservabilityError> {
		let config = OtelConfig::from_env(service_name);

		let resource = Resource::builder()
			.with_service_name(config.service_name.clone())
			.with_attributes(vec![
				KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
				KeyValue::new("service.environment", config.environment.clone()),
			])
			.build();

		// === Tracing ===
		let trace_exporter = opentelemetry_otlp::SpanExporter::builder()
			.with_tonic()
			.with_endpoint(&config.otlp_endpoint)
			.with_timeout(Duration::from_secs(3))
			.build()?;

		let tracer_provider = SdkTracerProvider::builder()
			.with_resource(resource.clone())
			.with_sampler(config.sampler.clone())
			.with_id_generator(RandomIdGenerator::default())
			.with_batch_exporter(trace_exporter)
			.build();

		// === Metrics ===
		let metrics_exporter = opentelemetry_otlp::MetricExporter::builder()
			.with_tonic()
			.with_endpoint(&config.otlp_endpoint)
			.with_timeout(Duration::from_secs(config.metrics_export_timeout_secs))
			.build()?;

		let reader = PeriodicReader::builder(metrics_exporter)
			.with_interval(Duration::from_secs(config.metrics_export_interval_secs))
			.build();

		let meter_provider = SdkMeterProvider::builder().with_resource(resource).with_reader(reader).build();

		let tracer = tracer_provider.tracer(config.service_name.clone());
		global::set_tracer_provider(tracer_provider.clone());
		global::set_meter_provider(meter_provider.clone());

		// === Tracing subscriber ===
		let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

		tracing_subscriber::registry()
			.with(env_filter())
			.with(telemetry_layer)
			.with(tracing_subscriber::fmt::layer().with_target(true))
			.init();

		info!(
			service_name = %config.service_name,
			otlp_endpoint = %config.otlp_endpoint,
			sampler = ?config.sampler,
			metrics_export_interval_secs = %config.metrics_export_interval_secs,
			"OpenTelemetry initialized"
		);

		Ok(Self { tracer_provider, meter_provider })
	}

	/// Flush and shut down both providers.
	pub fn shutdown(self) -> Result<(), ObservabilityError> {
		self.tracer_provider.shutdown().map_err(|e| ObservabilityError::OpenTelemetry(e.to_string()))?;
		self.meter_provider.shutdown().map_err(|e| ObservabilityError::OpenTelemetry(e.to_string()))?;
		Ok(())
	}
}

/// Try OTLP export once; on failure keep running with local log output only.
///
/// Instruments recorded through `global::meter` become no-ops in the fallback case.
pub fn init_observability_with_fallback(service_name: &str) -> Option<OtelGuard> {
	match OtelGuard::new(service_name) {
		Ok(guard) => {
			info!("✅ Observability initialized with OTLP export");
			Some(guard)
		}
		Err(e) => {
			tracing_subscriber::registry()
				.with(env_filter())
				.with(tracing_subscriber::fmt::layer().with_target(true))
				.init();

			warn!(error = %e, "⚠️ OTLP observability failed to initialize, falling back to local logging only");
			None
		}
	}
}

fn env_filter() -> EnvFilter {
	EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

struct OtelConfig {
	service_name: String,
	otlp_endpoint: String,
	sampler: Sampler,
	environment: String,
	metrics_export_interval_secs: u64,
	metrics_export_timeout_secs: u64,
}

impl OtelConfig {
	fn from_env(service_name: &str) -> Self {
		Self {
			service_name: service_name.to_string(),
			otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").unwrap_or_else(|_| "http://localhost:4317".to_string()),
			sampler: Self::sampler_from_env(),
			environment: std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
			metrics_export_interval_secs: std::env::var("OTEL_METRIC_EXPORT_INTERVAL").ok().and_then(|s| s.parse().ok()).unwrap_or(60),
			metrics_export_timeout_secs: std::env::var("OTEL_METRIC_EXPORT_TIMEOUT").ok().and_then(|s| s.parse().ok()).unwrap_or(30),
		}
	}

	fn sampler_from_env() -> Sampler {
		match std::env::var("OTEL_TRACES_SAMPLER").as_deref() {
			Ok("always_on") => Sampler::AlwaysOn,
			Ok("always_off") => Sampler::AlwaysOff,
			_ => {
				let ratio = std::env::var("OTEL_TRACES_SAMPLER_ARG").ok().and_then(|s| s.parse::<f64>().ok()).unwrap_or(1.0);
				Sampler::TraceIdRatioBased(ratio)
			}
		}
	}
}
