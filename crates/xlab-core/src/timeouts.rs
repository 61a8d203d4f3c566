//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Runtime deadline lookup per benchmark."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::time::Duration;

use indexmap::IndexMap;
use tracing::{debug, warn};
use xlab_common::{AppConfig, TimeoutConfig};

/// Benchmark specific runtime deadlines.
pub trait TimeoutResolver: Send + Sync {
    /// Deadline for the benchmark, or `None` when only the global default applies.
    fn lookup(&self, benchmark: &str, is_challenge: bool) -> Option<Duration>;
}

/// Timeouts read from the `[timeouts.<benchmark>]` configuration tables.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredTimeouts {
    entries: IndexMap<String, TimeoutConfig>,
}

impl ConfiguredTimeouts {
    pub fn new(entries: IndexMap<String, TimeoutConfig>) -> Self {
        Self { entries }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.timeouts.clone())
    }
}

impl TimeoutResolver for ConfiguredTimeouts {
    fn lookup(&self, benchmark: &str, is_challenge: bool) -> Option<Duration> {
        let Some(entry) = self.entries.get(benchmark) else {
            debug!(benchmark, "no timeouts configured for benchmark");
            return None;
        };
        if is_challenge {
            if let Some(timeout) = entry.challenge_timeout() {
                return Some(timeout);
            }
            warn!(benchmark, "challenge timeout not set, falling back");
        }
        entry.benchmark_timeout()
    }
}

/// Apply the global default when the resolver has nothing specific.
pub fn resolve_deadline(
    resolver: &dyn TimeoutResolver,
    benchmark: &str,
    is_challenge: bool,
    default: Duration,
) -> Duration {
    resolver.lookup(benchmark, is_challenge).unwrap_or(default)
}
