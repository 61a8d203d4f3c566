//! ---
//! xlab_section: "03-observability"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Metrics collection and export utilities."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::sync::Arc;

use anyhow::{Context, Result};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use tracing::error;

/// Shared registry type used across the workspace.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Render the registry in the Prometheus text exposition format.
pub fn encode_text(registry: &Registry) -> Result<String> {
    let families = registry.gather();
    TextEncoder::new()
        .encode_to_string(&families)
        .map_err(|err| {
            error!(error = %err, "failed to encode metrics");
            err
        })
        .context("metrics encoding error")
}

/// Metrics recorded by the experiment lifecycle controller.
#[derive(Clone, Debug)]
pub struct ControllerMetrics {
    registry: SharedRegistry,
    admissions: IntCounter,
    rejections: IntCounterVec,
    finalizations: IntCounterVec,
    errors: IntCounterVec,
    forced_terminations: IntCounterVec,
    queue_depth: IntGauge,
    slot_occupied: IntGauge,
    experiment_seconds: Histogram,
}

impl ControllerMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let admissions = IntCounter::with_opts(Opts::new(
            "xlab_admissions_total",
            "Experiments admitted into the slot",
        ))?;
        registry.register(Box::new(admissions.clone()))?;

        let rejections = IntCounterVec::new(
            Opts::new(
                "xlab_admission_rejections_total",
                "Admission attempts resolved by finalizing the candidate immediately",
            ),
            &["code"],
        )?;
        registry.register(Box::new(rejections.clone()))?;

        let finalizations = IntCounterVec::new(
            Opts::new(
                "xlab_finalizations_total",
                "Finalized experiments by result graph",
            ),
            &["graph"],
        )?;
        registry.register(Box::new(finalizations.clone()))?;

        let errors = IntCounterVec::new(
            Opts::new(
                "xlab_experiment_errors_total",
                "Error codes attached to finalized experiments",
            ),
            &["code"],
        )?;
        registry.register(Box::new(errors.clone()))?;

        let forced_terminations = IntCounterVec::new(
            Opts::new(
                "xlab_forced_terminations_total",
                "Forced terminations by triggering error code",
            ),
            &["code"],
        )?;
        registry.register(Box::new(forced_terminations.clone()))?;

        let queue_depth = IntGauge::with_opts(Opts::new(
            "xlab_queue_depth",
            "Configurations waiting in the experiment queue",
        ))?;
        registry.register(Box::new(queue_depth.clone()))?;

        let slot_occupied = IntGauge::with_opts(Opts::new(
            "xlab_slot_occupied",
            "Indicator (0/1) whether an experiment currently occupies the slot",
        ))?;
        registry.register(Box::new(slot_occupied.clone()))?;

        let buckets = prometheus::exponential_buckets(1.0, 2.0, 14)
            .context("failed to construct histogram buckets")?;
        let experiment_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "xlab_experiment_duration_seconds",
                "Wall-clock time from admission to finalize",
            )
            .buckets(buckets),
        )?;
        registry.register(Box::new(experiment_seconds.clone()))?;

        Ok(Self {
            registry,
            admissions,
            rejections,
            finalizations,
            errors,
            forced_terminations,
            queue_depth,
            slot_occupied,
            experiment_seconds,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn record_admission(&self) {
        self.admissions.inc();
        self.slot_occupied.set(1);
    }

    pub fn record_rejection(&self, code: &str) {
        self.rejections.with_label_values(&[code]).inc();
    }

    /// Count a finalize together with every error code of the record.
    pub fn record_finalization<'a>(
        &self,
        graph: &str,
        codes: impl IntoIterator<Item = &'a str>,
        elapsed_seconds: Option<f64>,
    ) {
        self.finalizations.with_label_values(&[graph]).inc();
        for code in codes {
            self.errors.with_label_values(&[code]).inc();
        }
        if let Some(seconds) = elapsed_seconds {
            self.experiment_seconds.observe(seconds);
        }
        self.slot_occupied.set(0);
    }

    pub fn record_forced_termination(&self, code: &str) {
        self.forced_terminations.with_label_values(&[code]).inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as i64);
    }
}

pub use prometheus;
