//! Layered configuration.
//!
//! Sources, lowest priority first: built-in defaults, a TOML file, `DOCPORT_*`
//! environment variables, then command-line arguments.

use std::path::Path;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "docport.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Retention window for throughput samples.
    pub eta_window_secs: u64,
    pub max_samples: usize,
    pub progress_log_interval_ms: u64,
    /// Refuse a second running job on the same connection.
    pub single_flight: bool,
    pub event_buffer: usize,
    pub verbose: bool,
    pub json_logs: bool,
    pub simulation: SimulationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub docs_per_tick: u64,
    pub tick_ms: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            eta_window_secs: 10,
            max_samples: 256,
            progress_log_interval_ms: 500,
            single_flight: true,
            event_buffer: 256,
            verbose: false,
            json_logs: false,
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            docs_per_tick: 250,
            tick_ms: 20,
        }
    }
}

impl AppConfig {
    /// Load the configuration, letting `overrides` win over every other source.
    pub fn new<T: Serialize>(config_file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let file = config_file.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));

        let mut figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("DOCPORT_").split("__"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment.extract().context("Failed to load configuration")
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
        #[serde(skip_serializing_if = "Option::is_none")]
        eta_window_secs: Option<u64>,
    }

    #[test]
    fn test_defaults_when_file_missing() {
        let dir = TempDir::new().unwrap();
        let config = AppConfig::new(Some(&dir.path().join("missing.toml")), None::<&Overrides>)
            .unwrap();
        assert_eq!(config.eta_window_secs, 10);
        assert!(config.single_flight);
        assert_eq!(config.simulation.tick_ms, 20);
    }

    #[test]
    fn test_file_then_overrides() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("docport.toml");
        fs::write(
            &path,
            "eta_window_secs = 30\nsingle_flight = false\n\n[simulation]\ndocs_per_tick = 10\n",
        )
        .unwrap();

        let overrides = Overrides {
            verbose: Some(true),
            eta_window_secs: None,
        };
        let config = AppConfig::new(Some(&path), Some(&overrides)).unwrap();

        assert_eq!(config.eta_window_secs, 30);
        assert!(!config.single_flight);
        assert!(config.verbose);
        assert_eq!(config.simulation.docs_per_tick, 10);
        assert_eq!(config.simulation.tick_ms, 20);
    }

    #[test]
    fn test_round_trips_through_toml() {
        let config = AppConfig::default();
        let rendered = config.to_toml().unwrap();
        assert!(rendered.contains("eta_window_secs = 10"));
        let parsed: AppConfig = toml::from_str(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
