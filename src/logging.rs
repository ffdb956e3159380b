//! Logging and tracing initialization.
//!
//! Structured logging through the `tracing` ecosystem, as compact console
//! lines or as flattened JSON for log aggregation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    pub json: bool,
    /// Default level DEBUG instead of INFO.
    pub verbose: bool,
}

impl From<&AppConfig> for LogConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            json: config.json_logs,
            verbose: config.verbose,
        }
    }
}

impl LogConfig {
    /// Filter used when `RUST_LOG` is unset. Dependencies only speak up on warnings.
    pub fn default_directives(&self) -> String {
        let ours = if self.verbose { "debug" } else { "info" };
        format!("warn,{}={ours}", env!("CARGO_CRATE_NAME"))
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.default_directives()))
    }
}

/// Install the global subscriber. Call once, after config is loaded.
pub fn init(config: LogConfig) -> anyhow::Result<()> {
    // Exactly one of the two output layers is present.
    let json = config.json.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
    });
    let console = (!config.json).then(|| fmt::layer().compact().with_target(false));

    tracing_subscriber::registry()
        .with(config.filter())
        .with(json)
        .with(console)
        .try_init()
        .context("Failed to install log subscriber")
}

/// Rate limiter for progress logging, which would otherwise log on every
/// engine notification.
#[derive(Debug)]
pub struct LogThrottle {
    interval_ms: u64,
    /// Milliseconds since `origin` of the last accepted log, or `UNSET`.
    last_ms: AtomicU64,
    origin: Instant,
}

const UNSET: u64 = u64::MAX;

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_ms: interval.as_millis() as u64,
            last_ms: AtomicU64::new(UNSET),
            origin: Instant::now(),
        }
    }

    /// Whether a log line may be written now. Lock-free; if two callers race,
    /// only the one that wins the exchange logs.
    pub fn should_log(&self) -> bool {
        let now_ms = self.origin.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);

        let due = last == UNSET || now_ms.saturating_sub(last) >= self.interval_ms;
        due && self
            .last_ms
            .compare_exchange(last, now_ms, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// Let the next call through immediately, e.g. at the start of a new run.
    pub fn reset(&self) {
        self.last_ms.store(UNSET, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttle_lets_first_call_through_then_holds() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        assert!(!throttle.should_log());
    }

    #[test]
    fn throttle_reset_reopens() {
        let throttle = LogThrottle::new(Duration::from_secs(60));
        assert!(throttle.should_log());
        throttle.reset();
        assert!(throttle.should_log());
    }

    #[test]
    fn zero_interval_never_throttles() {
        let throttle = LogThrottle::new(Duration::ZERO);
        assert!(throttle.should_log());
        assert!(throttle.should_log());
    }

    #[test]
    fn default_directives_quiet_dependencies() {
        let quiet = LogConfig::default();
        assert_eq!(quiet.default_directives(), "warn,docport=info");

        let verbose = LogConfig {
            verbose: true,
            ..Default::default()
        };
        assert_eq!(verbose.default_directives(), "warn,docport=debug");
    }

    #[test]
    fn log_config_follows_app_config() {
        let config = AppConfig {
            verbose: true,
            json_logs: true,
            ..Default::default()
        };
        let log = LogConfig::from(&config);
        assert!(log.verbose);
        assert!(log.json);
    }
}
