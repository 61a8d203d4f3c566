//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Shared primitives and utilities for the controller runtime."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use anyhow::Result;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

/// Filter override read before `RUST_LOG`.
const LOG_ENV: &str = "XLAB_LOG";

static GUARDS: OnceCell<Vec<WorkerGuard>> = OnceCell::new();

/// Output format of the stdout layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    StructuredJson,
    Pretty,
}

/// Pick the filter directive: `XLAB_LOG`, then `RUST_LOG`, then `[logging] level`.
///
/// Unparseable candidates are skipped so a typo in the environment never
/// silences the controller.
fn filter_directive(
    config: &LoggingConfig,
    xlab_log: Option<String>,
    rust_log: Option<String>,
) -> String {
    [xlab_log, rust_log]
        .into_iter()
        .flatten()
        .find(|directive| {
            let valid = EnvFilter::try_new(directive).is_ok();
            if !valid {
                eprintln!("ignoring invalid log directive {directive:?}");
            }
            valid
        })
        .unwrap_or_else(|| config.level.clone())
}

/// Install the process-wide subscriber for `service_name`.
///
/// Stdout gets the configured format. With `[logging] file` set, a daily rolling
/// JSON file `<prefix>.log` is also written under `directory`, one per
/// controller process, so finished experiments can be traced afterwards by
/// their `experiment_id` field. Returns `false` when logging is disabled or a
/// subscriber was already installed.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<bool> {
    if !config.enabled {
        return Ok(false);
    }

    let directive = filter_directive(
        config,
        std::env::var(LOG_ENV).ok(),
        std::env::var(EnvFilter::DEFAULT_ENV).ok(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let mut guards = Vec::with_capacity(2);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
    guards.push(stdout_guard);
    let stdout_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(stdout_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(stdout_writer)
            .boxed(),
    };

    let file_layer = if config.file {
        std::fs::create_dir_all(&config.directory)?;
        let prefix = config.file_prefix.as_deref().unwrap_or(service_name);
        let (file_writer, file_guard) =
            tracing_appender::non_blocking(daily(&config.directory, format!("{prefix}.log")));
        guards.push(file_guard);
        Some(
            fmt::layer()
                .with_target(true)
                .with_timer(fmt::time::UtcTime::rfc_3339())
                .json()
                .with_writer(file_writer)
                .boxed(),
        )
    } else {
        None
    };

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .is_ok();
    if installed {
        let _ = GUARDS.set(guards);
        info!(
            service = %service_name,
            filter = %directive,
            log_dir = %config.directory.display(),
            file = config.file,
            "tracing initialised"
        );
    }
    Ok(installed)
}
