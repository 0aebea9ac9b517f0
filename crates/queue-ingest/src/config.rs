use crate::admission::{AdmissionBudget, DEFAULT_MEMORY_CEILING_PERCENT, MAX_WORKER_CAP};
use crate::handler::{DegradedMode, RateLimitedDisposition};
use crate::renewal::RenewalConfig;
use clap::Args;
use std::time::Duration;

const MIN_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Args, Clone, Debug)]
pub struct ListenerConfig {
	#[arg(long, env = "QUEUE_MAX_MESSAGE_COUNT", default_value = "5", help = "Messages requested per receive call")]
	pub max_message_count: usize,

	#[arg(
        long = "queue-max-wait-secs",
        env = "QUEUE_MAX_WAIT_SECS",
        default_value = "5",
        value_parser = parse_duration,
        help = "Longest a receive call waits for the first message"
    )]
	pub max_wait: Duration,

	#[arg(
        long = "queue-reconnect-backoff-secs",
        env = "QUEUE_RECONNECT_BACKOFF_SECS",
        default_value = "5",
        value_parser = parse_duration,
        help = "Initial pause after a backend error"
    )]
	pub reconnect_backoff: Duration,

	#[arg(
        long = "queue-backoff-max-secs",
        env = "QUEUE_BACKOFF_MAX_SECS",
        default_value = "60",
        value_parser = parse_duration,
        help = "Upper bound for the backend error backoff"
    )]
	pub backoff_max: Duration,

	#[arg(
        long = "lock-renewal-interval-secs",
        env = "LOCK_RENEWAL_INTERVAL_SECS",
        default_value = "10",
        value_parser = parse_duration,
        help = "How often a message lease is renewed while its handler runs"
    )]
	pub lock_renewal_interval: Duration,

	#[arg(
        long = "lock-renewal-timeout-secs",
        env = "LOCK_RENEWAL_TIMEOUT_SECS",
        default_value = "600",
        value_parser = parse_duration,
        help = "Stop renewing a lease after this long"
    )]
	pub lock_renewal_timeout: Duration,

	#[arg(long, env = "RATE_LIMITED_DISPOSITION", value_enum, default_value_t = RateLimitedDisposition::Complete, help = "Disposition for messages hit by an active rate limit")]
	pub rate_limited_disposition: RateLimitedDisposition,

	#[arg(long, env = "DEGRADED_MODE", value_enum, default_value_t = DegradedMode::Inline, help = "Handling of messages refused by admission control")]
	pub degraded_mode: DegradedMode,

	#[arg(long, env = "MAX_WORKERS", help = "Override the worker budget (defaults to min(32, cpus + 4))")]
	pub max_workers: Option<usize>,

	#[arg(long, env = "MEMORY_CEILING_PERCENT", default_value_t = DEFAULT_MEMORY_CEILING_PERCENT, help = "Refuse dispatch above this memory utilisation")]
	pub memory_ceiling_percent: f64,

	#[arg(
        long = "shutdown-drain-secs",
        env = "SHUTDOWN_DRAIN_SECS",
        default_value = "30",
        value_parser = parse_duration,
        help = "Time in-flight work gets to finish on shutdown"
    )]
	pub drain_timeout: Duration,
}

impl Default for ListenerConfig {
	fn default() -> Self {
		Self {
			max_message_count: 5,
			max_wait: Duration::from_secs(5),
			reconnect_backoff: Duration::from_secs(5),
			backoff_max: Duration::from_secs(60),
			lock_renewal_interval: Duration::from_secs(10),
			lock_renewal_timeout: Duration::from_secs(600),
			rate_limited_disposition: RateLimitedDisposition::default(),
			degraded_mode: DegradedMode::default(),
			max_workers: None,
			memory_ceiling_percent: DEFAULT_MEMORY_CEILING_PERCENT,
			drain_timeout: Duration::from_secs(30),
		}
	}
}

impl ListenerConfig {
	pub fn batch_size(&self) -> usize {
		self.max_message_count.max(1)
	}

	pub fn initial_backoff(&self) -> Duration {
		self.reconnect_backoff.max(MIN_RECONNECT_BACKOFF)
	}

	pub fn max_backoff(&self) -> Duration {
		self.backoff_max.max(self.initial_backoff())
	}

	pub const fn renewal(&self) -> RenewalConfig {
		RenewalConfig {
			interval: self.lock_renewal_interval,
			hard_timeout: self.lock_renewal_timeout,
		}
	}

	pub fn admission_budget(&self) -> AdmissionBudget {
		let host = AdmissionBudget::from_host();
		let max_workers = self.max_workers.map_or(host.max_workers, |n| n.min(MAX_WORKER_CAP));
		AdmissionBudget::new(max_workers, self.memory_ceiling_percent)
	}

	/// Validate configuration values
	pub fn validate(&self) -> Result<(), String> {
		if self.lock_renewal_interval.is_zero() {
			return Err("lock_renewal_interval_secs must be greater than 0".to_string());
		}

		if !(0.0..=100.0).contains(&self.memory_ceiling_percent) {
			return Err("memory_ceiling_percent must be between 0 and 100".to_string());
		}

		Ok(())
	}
}

fn parse_duration(s: &str) -> Result<Duration, std::num::ParseIntError> {
	s.parse::<u64>().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
	use super::*;
	use clap::Parser;

	#[derive(Parser, Debug)]
	struct Cli {
		#[command(flatten)]
		listener: ListenerConfig,
	}

	#[test]
	fn test_defaults_match_parser() {
		let parsed = Cli::try_parse_from(vec!["program"]).unwrap().listener;
		let default = ListenerConfig::default();

		assert_eq!(parsed.max_message_count, default.max_message_count);
		assert_eq!(parsed.max_wait, default.max_wait);
		assert_eq!(parsed.backoff_max, default.backoff_max);
		assert_eq!(parsed.renewal(), RenewalConfig::default());
		assert_eq!(parsed.rate_limited_disposition, RateLimitedDisposition::Complete);
		assert_eq!(parsed.degraded_mode, DegradedMode::Inline);
		assert_eq!(parsed.drain_timeout, Duration::from_secs(30));
	}

	#[test]
	fn test_config_parser() {
		let args = vec![
			"program",
			"--max-message-count",
			"0",
			"--queue-reconnect-backoff-secs",
			"0",
			"--queue-backoff-max-secs",
			"0",
			"--rate-limited-disposition",
			"abandon",
			"--degraded-mode",
			"skip",
			"--max-workers",
			"100",
		];

		let config = Cli::try_parse_from(args).unwrap().listener;
		assert_eq!(config.batch_size(), 1);
		assert_eq!(config.initial_backoff(), Duration::from_secs(1));
		assert_eq!(config.max_backoff(), Duration::from_secs(1));
		assert_eq!(config.rate_limited_disposition, RateLimitedDisposition::Abandon);
		assert_eq!(config.degraded_mode, DegradedMode::Skip);
		assert_eq!(config.admission_budget().max_workers, MAX_WORKER_CAP);
	}

	#[test]
	fn test_parse_duration() {
		assert_eq!(parse_duration("60").unwrap(), Duration::from_secs(60));
		assert!(parse_duration("invalid").is_err());
	}

	#[test]
	fn test_validate_rejects_bad_ceiling() {
		let config = ListenerConfig {
			memory_ceiling_percent: 150.0,
			..ListenerConfig::default()
		};
		assert!(config.validate().is_err());
	}
}
