//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Shared primitives and utilities for the controller runtime."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
//! Core shared primitives for the XLab controller workspace.
//! This crate exposes configuration loading, logging, the experiment
//! configuration model, and time/id utilities consumed across the workspace.

pub mod config;
pub mod experiment;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, ControllerConfig, LoggingConfig, MetricsConfig, QueueBackend, QueueConfig,
    TimeoutConfig,
};
pub use experiment::{ExperimentConfig, ExperimentId};
pub use logging::{init_tracing, LogFormat};
pub use time::{epoch_millis, ExperimentIdGenerator};
