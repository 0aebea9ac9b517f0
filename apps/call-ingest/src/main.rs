use anyhow::Result;
use call_ingest::{build_listener, observability, Config};
use clap::Parser;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
	dotenvy::dotenv().ok();

	let config = Config::parse();
	config.validate().map_err(anyhow::Error::msg)?;

	let otel = observability::init_observability_with_fallback(&config.service_name);

	info!(
		service = %config.service_name,
		queue = %config.queue_name,
		consumer = %config.consumer_name(),
		"🎯 Starting call ingest service"
	);

	let listener = build_listener(&config).await?;
	listener.start().await?;

	wait_for_shutdown_signal().await;
	info!("🛑 Shutdown signal received (SIGTERM/SIGINT)");

	listener.stop().await;

	if let Some(guard) = otel {
		if let Err(e) = guard.shutdown() {
			error!(error = %e, "Failed to flush telemetry");
		}
	}

	info!("✅ Shutdown complete");
	Ok(())
}

async fn wait_for_shutdown_signal() {
	let ctrl_c = async {
		signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
	};

	#[cfg(unix)]
	let terminate = async {
		signal::unix::signal(signal::unix::SignalKind::terminate())
			.expect("failed to install SIGTERM handler")
			.recv()
			.await;
	};

	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
}
