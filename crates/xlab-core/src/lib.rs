//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Experiment lifecycle controller crate."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
//! Lifecycle controller for single-slot experiment execution: admission,
//! readiness handshake, forced termination, finalization, and the timers
//! that drive them.

pub mod collaborators;
pub mod controller;
pub mod dispatch;
pub mod error;
pub mod params;
pub mod record;
pub mod scheduler;
pub mod service;
pub mod status;
pub mod timeouts;
pub mod watchdog;

pub use collaborators::{
    AnalysisSink, BenchmarkMeta, ClusterBackend, ClusterHealth, ClusterManager, ClusterSpec,
    Collaborators, CommandBus, ContainerExit, ContainerRole, ContainerRuntime, ContainerSpec,
    ElasticCluster, MetadataResolver, ParameterDecl, ResultGraph, ResultStore, SystemMeta,
    BROADCAST_SESSION,
};
pub use controller::{Admission, ControllerSettings, ExperimentController};
pub use dispatch::{encode_container_terminated, CommandCode, CommandDispatcher, InboundCommand};
pub use error::{ControllerError, Result};
pub use params::{
    DeclaredParameterResolver, ParameterResolver, ParameterSource, ResolvedParameter,
    ResolvedParameters,
};
pub use record::{ErrorCode, ExperimentRecord, ExperimentState, RecordSnapshot, RecordToken};
pub use scheduler::PollScheduler;
pub use service::{ControllerService, ServiceHandle, SERVICE_NAME};
pub use status::{ControllerStatus, QueuedExperiment, RunningExperiment};
pub use timeouts::{resolve_deadline, ConfiguredTimeouts, TimeoutResolver};
pub use watchdog::AbortWatchdog;
