//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Shared primitives and utilities for the controller runtime."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::{debug, warn};

use crate::logging::LogFormat;

/// Environment variable holding a default deadline override in milliseconds.
pub const MAX_EXECUTION_TIME_ENV: &str = "MAX_EXECUTION_TIME";

fn default_warmup_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_max_execution_time() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_bus_host() -> String {
    "message-bus".to_owned()
}

fn default_experiment_uri_namespace() -> String {
    "urn:xlab:experiment:".to_owned()
}

fn default_queue_path() -> PathBuf {
    PathBuf::from("target/queue/experiments.journal")
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::StructuredJson
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_true() -> bool {
    true
}

/// Primary configuration object for the controller runtime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    /// Per-benchmark deadline overrides keyed by benchmark reference.
    #[serde(default)]
    pub timeouts: IndexMap<String, TimeoutConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Metadata describing where an [`AppConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedAppConfig {
    pub config: AppConfig,
    pub source: PathBuf,
}

impl AppConfig {
    pub const ENV_CONFIG_PATH: &str = "XLAB_CONFIG";

    /// Load configuration from disk, respecting the `XLAB_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedAppConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(LoadedAppConfig {
                    config,
                    source: path,
                });
            }
        }

        Err(anyhow!(
            "no configuration files found. inspected: {}",
            candidates
                .iter()
                .map(|p| p.as_ref().display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        Self::parse_with_env(&contents, |key| std::env::var(key).ok())
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    /// Parse a TOML document, apply environment overrides read through `env`, then validate.
    pub fn parse_with_env<F>(content: &str, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: AppConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.controller.apply_overrides_from(env);
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.controller.validate()?;
        self.queue.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for AppConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse_with_env(content, |key| std::env::var(key).ok())
    }
}

/// Settings of the lifecycle controller and its poll scheduler.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Delay before the first admission attempt.
    #[serde(default = "default_warmup_delay")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub warmup_delay: Duration,
    #[serde(default = "default_poll_interval")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub poll_interval: Duration,
    /// Deadline used when no benchmark or challenge specific timeout is known.
    #[serde(default = "default_max_execution_time")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_max_execution_time: Duration,
    /// Message bus host forwarded to every provisioned container.
    #[serde(default = "default_bus_host")]
    pub bus_host: String,
    #[serde(default = "default_experiment_uri_namespace")]
    pub experiment_uri_namespace: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            warmup_delay: default_warmup_delay(),
            poll_interval: default_poll_interval(),
            default_max_execution_time: default_max_execution_time(),
            bus_host: default_bus_host(),
            experiment_uri_namespace: default_experiment_uri_namespace(),
        }
    }
}

impl ControllerConfig {
    /// Apply `MAX_EXECUTION_TIME` (milliseconds) when `env` yields a parseable value.
    pub fn apply_overrides_from<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(raw) = env(MAX_EXECUTION_TIME_ENV) else {
            return;
        };
        match raw.trim().parse::<u64>() {
            Ok(millis) if millis > 0 => {
                self.default_max_execution_time = Duration::from_millis(millis);
            }
            _ => {
                warn!(value = %raw, "ignoring unparseable {}", MAX_EXECUTION_TIME_ENV);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(anyhow!("controller.poll_interval must be greater than zero"));
        }
        if self.default_max_execution_time.is_zero() {
            return Err(anyhow!(
                "controller.default_max_execution_time must be greater than zero"
            ));
        }
        Ok(())
    }
}

/// Storage backend holding the experiment queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    #[default]
    Memory,
    Journal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default)]
    pub backend: QueueBackend,
    #[serde(default = "default_queue_path")]
    pub path: PathBuf,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::default(),
            path: default_queue_path(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> Result<()> {
        if self.backend == QueueBackend::Journal && self.path.as_os_str().is_empty() {
            return Err(anyhow!("queue.path is required for the journal backend"));
        }
        Ok(())
    }
}

/// Benchmark specific deadlines in milliseconds. Negative values mean unset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct TimeoutConfig {
    #[serde(default)]
    pub benchmark_timeout_ms: Option<i64>,
    #[serde(default)]
    pub challenge_timeout_ms: Option<i64>,
}

impl TimeoutConfig {
    pub fn benchmark_timeout(&self) -> Option<Duration> {
        positive_millis(self.benchmark_timeout_ms)
    }

    pub fn challenge_timeout(&self) -> Option<Duration> {
        positive_millis(self.challenge_timeout_ms)
    }
}

fn positive_millis(value: Option<i64>) -> Option<Duration> {
    value
        .filter(|millis| *millis >= 0)
        .map(|millis| Duration::from_millis(millis as u64))
}

/// The `[logging]` section consumed by `init_tracing`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// When false the service leaves subscriber setup to the embedding process.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Filter used when neither `XLAB_LOG` nor `RUST_LOG` is set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    /// Also write a daily rolling JSON file under `directory`.
    #[serde(default = "default_true")]
    pub file: bool,
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: default_log_format(),
            file: true,
            directory: default_logging_directory(),
            file_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn empty_document_uses_defaults() {
        let config = AppConfig::from_str("").unwrap();
        assert_eq!(config.controller.warmup_delay, Duration::from_secs(30));
        assert_eq!(config.controller.poll_interval, Duration::from_secs(10));
        assert_eq!(
            config.controller.default_max_execution_time,
            Duration::from_secs(1200)
        );
        assert_eq!(config.queue.backend, QueueBackend::Memory);
        assert!(config.metrics.enabled);
        assert!(config.logging.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn parses_logging_section() {
        let config = AppConfig::parse_with_env(
            "[logging]\nlevel = \"xlab_core=debug\"\nformat = \"pretty\"\nfile = false\n",
            |_| None,
        )
        .unwrap();
        assert_eq!(config.logging.level, "xlab_core=debug");
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert!(!config.logging.file);
    }

    #[test]
    fn parses_sections_and_timeouts() {
        let config = AppConfig::from_str(
            r#"
[controller]
warmup_delay = 5
poll_interval = 1
default_max_execution_time = 60000
bus_host = "rabbit"

[queue]
backend = "journal"
path = "/tmp/xlab.journal"

[timeouts."urn:bench:a"]
benchmark_timeout_ms = 1000
challenge_timeout_ms = -1
"#,
        )
        .unwrap();
        assert_eq!(config.controller.warmup_delay, Duration::from_secs(5));
        assert_eq!(
            config.controller.default_max_execution_time,
            Duration::from_secs(60)
        );
        assert_eq!(config.controller.bus_host, "rabbit");
        assert_eq!(config.queue.backend, QueueBackend::Journal);
        let timeouts = config.timeouts.get("urn:bench:a").unwrap();
        assert_eq!(timeouts.benchmark_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(timeouts.challenge_timeout(), None);
    }

    fn max_execution_time(value: &'static str) -> impl Fn(&str) -> Option<String> {
        move |key: &str| (key == MAX_EXECUTION_TIME_ENV).then(|| value.to_owned())
    }

    #[test]
    fn env_override_applies_to_parsed_documents() {
        let config = AppConfig::parse_with_env(
            "[controller]\ndefault_max_execution_time = 60000\n",
            max_execution_time("5000"),
        )
        .unwrap();
        assert_eq!(
            config.controller.default_max_execution_time,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn unparseable_env_override_is_ignored() {
        let config = AppConfig::parse_with_env("", max_execution_time("soon")).unwrap();
        assert_eq!(
            config.controller.default_max_execution_time,
            Duration::from_secs(1200)
        );
        let config = AppConfig::parse_with_env("", max_execution_time("0")).unwrap();
        assert_eq!(
            config.controller.default_max_execution_time,
            Duration::from_secs(1200)
        );
    }

    #[test]
    fn rejects_zero_poll_interval() {
        let err = AppConfig::from_str("[controller]\npoll_interval = 0\n").unwrap_err();
        assert!(err.to_string().contains("poll_interval"));
    }

    #[test]
    fn load_prefers_first_existing_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("xlab.toml");
        std::fs::write(&path, "[controller]\nbus_host = \"bus-a\"\n").unwrap();
        let missing = dir.path().join("missing.toml");
        let loaded = AppConfig::load_with_source(&[missing, path.clone()]).unwrap();
        assert_eq!(loaded.source, path);
        assert_eq!(loaded.config.controller.bus_host, "bus-a");
    }
}
