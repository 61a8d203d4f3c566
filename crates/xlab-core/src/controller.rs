//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Single-slot experiment lifecycle controller."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::anyhow;
use chrono::Utc;
use indexmap::IndexSet;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use xlab_common::{ControllerConfig, ExperimentConfig, ExperimentId};
use xlab_metrics::ControllerMetrics;
use xlab_queue::ExperimentQueue;

use crate::collaborators::{
    Collaborators, ContainerExit, ContainerRole, ContainerSpec, ResultGraph, BROADCAST_SESSION,
};
use crate::dispatch::{encode_container_terminated, CommandCode};
use crate::error::{ControllerError, Result};
use crate::record::{ErrorCode, ExperimentRecord, ExperimentState, RecordSnapshot, RecordToken};
use crate::status::{ControllerStatus, QueuedExperiment, RunningExperiment};
use crate::timeouts::resolve_deadline;
use crate::watchdog::AbortWatchdog;

pub const ENV_BUS_HOST: &str = "BUS_HOST";
pub const ENV_SESSION_ID: &str = "SESSION_ID";
pub const ENV_EXPERIMENT_URI: &str = "EXPERIMENT_URI";
pub const ENV_BENCHMARK_PARAMETERS: &str = "BENCHMARK_PARAMETERS";
pub const ENV_SYSTEM_PARAMETERS: &str = "SYSTEM_PARAMETERS";
pub const ENV_SYSTEM_URI: &str = "SYSTEM_URI";

/// Mount point of the experiment-scoped volume inside the system container.
pub const SHARED_VOLUME_MOUNT: &str = "/share";

/// Runtime settings of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerSettings {
    pub bus_host: String,
    pub experiment_uri_namespace: String,
    pub default_max_execution_time: Duration,
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(config: &ControllerConfig) -> Self {
        Self {
            bus_host: config.bus_host.clone(),
            experiment_uri_namespace: config.experiment_uri_namespace.clone(),
            default_max_execution_time: config.default_max_execution_time,
        }
    }
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from(&ControllerConfig::default())
    }
}

/// Outcome of one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// An experiment already occupies the slot.
    Busy,
    /// Nothing in the queue is eligible yet.
    NoCandidate,
    /// The fixed cluster reported itself unhealthy.
    ClusterUnhealthy,
    Admitted(ExperimentId),
    /// Admission failed; the record was finalized and dequeued.
    Rejected(ExperimentId),
}

#[derive(Default)]
struct Slot {
    record: Option<ExperimentRecord>,
    watchdog: Option<AbortWatchdog>,
}

struct ControllerInner {
    queue: ExperimentQueue,
    collaborators: Collaborators,
    settings: ControllerSettings,
    slot: Mutex<Slot>,
    /// Last published view of the slot, readable without the slot lock.
    published: RwLock<Option<Arc<RecordSnapshot>>>,
    next_token: AtomicU64,
    metrics: Option<ControllerMetrics>,
}

/// Owns the single experiment slot.
///
/// Every mutating entry point takes the slot lock for its full duration and
/// calls collaborators while holding it. Collaborators therefore must never
/// call back into the controller synchronously; container exits arrive
/// through [`ExperimentController::spawn_exit_listener`] instead.
#[derive(Clone)]
pub struct ExperimentController {
    inner: Arc<ControllerInner>,
}

impl ExperimentController {
    pub fn new(
        queue: ExperimentQueue,
        collaborators: Collaborators,
        settings: ControllerSettings,
        metrics: Option<ControllerMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                queue,
                collaborators,
                settings,
                slot: Mutex::new(Slot::default()),
                published: RwLock::new(None),
                next_token: AtomicU64::new(1),
                metrics,
            }),
        }
    }

    pub fn queue(&self) -> &ExperimentQueue {
        &self.inner.queue
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.inner.settings
    }

    /// Snapshot of the experiment occupying the slot, if any.
    pub fn current(&self) -> Option<Arc<RecordSnapshot>> {
        self.inner.published.read().clone()
    }

    fn publish(&self, record: Option<&ExperimentRecord>) {
        *self.inner.published.write() = record.map(|record| Arc::new(record.snapshot()));
    }

    fn experiment_uri(&self, id: &ExperimentId) -> String {
        format!("{}{}", self.inner.settings.experiment_uri_namespace, id)
    }

    /// Try to move the next eligible queued experiment into the slot.
    pub async fn try_admit_next(&self) -> Result<Admission> {
        let mut guard = self.inner.slot.lock().await;
        if guard.record.is_some() {
            return Ok(Admission::Busy);
        }
        let collaborators = &self.inner.collaborators;

        let depth = self.inner.queue.len()?;
        if let Some(metrics) = &self.inner.metrics {
            metrics.set_queue_depth(depth);
        }
        if let Some(elastic) = collaborators.cluster.elastic_extension() {
            if let Err(err) = elastic.react_to_queue_depth(depth).await {
                warn!(depth, error = %err, "elastic cluster failed to react to queue depth");
            }
        }
        if depth == 0 {
            return Ok(Admission::NoCandidate);
        }
        let Some(config) = self.inner.queue.next(Utc::now())? else {
            return Ok(Admission::NoCandidate);
        };

        if collaborators.cluster.elastic_extension().is_none() {
            match collaborators.cluster.manager().health().await {
                Ok(health) if health.healthy => {}
                Ok(health) => {
                    warn!(
                        expected_nodes = health.expected_nodes,
                        current_nodes = health.current_nodes,
                        "cluster is not healthy, postponing admission"
                    );
                    return Ok(Admission::ClusterUnhealthy);
                }
                Err(err) => {
                    warn!(error = %err, "cluster health unavailable, postponing admission");
                    return Ok(Admission::ClusterUnhealthy);
                }
            }
        }

        let id = config.id.clone();
        let token = RecordToken(self.inner.next_token.fetch_add(1, Ordering::Relaxed));
        let uri = self.experiment_uri(&id);
        info!(experiment_id = %id, benchmark = %config.benchmark, system = %config.system, "admitting experiment");
        let slot = &mut *guard;
        let record = slot
            .record
            .insert(ExperimentRecord::new(token, config, uri, Utc::now()));
        self.publish(Some(record));
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_admission();
        }

        match self.provision(record, &mut slot.watchdog).await {
            Ok(()) => Ok(Admission::Admitted(id)),
            Err(err) => {
                error!(experiment_id = %id, error = %err, "admission failed");
                if record.errors().is_empty() {
                    record.add_error(ErrorCode::UnexpectedError);
                }
                if let Some(metrics) = &self.inner.metrics {
                    let code = record
                        .errors()
                        .iter()
                        .next()
                        .unwrap_or(ErrorCode::UnexpectedError);
                    metrics.record_rejection(code.name());
                }
                self.finalize_locked(slot).await;
                Ok(Admission::Rejected(id))
            }
        }
    }

    async fn provision(
        &self,
        record: &mut ExperimentRecord,
        watchdog: &mut Option<AbortWatchdog>,
    ) -> Result<()> {
        let collaborators = &self.inner.collaborators;
        let settings = &self.inner.settings;
        let config = record.config().clone();

        if let Some(elastic) = collaborators.cluster.elastic_extension() {
            record.set_state(ExperimentState::CloudPrep);
            self.publish(Some(record));
            let spec = collaborators.parameters.cluster_spec(&config)?;
            info!(experiment_id = %config.id, cluster_spec = %spec.0, "provisioning cluster");
            elastic.provision_cluster(&spec).await?;
            record.set_state(ExperimentState::Prep);
            self.publish(Some(record));
        }

        let benchmark = collaborators.metadata.benchmark(&config.benchmark).await?;
        let Some((benchmark, benchmark_image)) = benchmark
            .and_then(|meta| meta.main_image.clone().map(|image| (meta, image)))
        else {
            record.add_error(ErrorCode::BenchmarkImageMissing);
            return Err(ControllerError::MissingImage {
                role: ContainerRole::Benchmark,
                uri: config.benchmark.clone(),
            });
        };
        let system = collaborators.metadata.system(&config.system).await?;
        let Some((system, system_image)) =
            system.and_then(|meta| meta.main_image.clone().map(|image| (meta, image)))
        else {
            record.add_error(ErrorCode::SystemImageMissing);
            return Err(ControllerError::MissingImage {
                role: ContainerRole::System,
                uri: config.system.clone(),
            });
        };

        let mut images = IndexSet::new();
        images.insert(benchmark_image.clone());
        images.extend(benchmark.used_images.iter().cloned());
        images.insert(system_image.clone());
        for image in &images {
            if let Err(err) = collaborators.runtime.pull_image(image).await {
                warn!(image = %image, error = %err, "failed to prefetch image");
            }
        }

        let deadline = resolve_deadline(
            collaborators.timeouts.as_ref(),
            &config.benchmark,
            config.is_challenge(),
            settings.default_max_execution_time,
        );
        let benchmark_parameters = collaborators
            .parameters
            .benchmark_parameters(&config, &benchmark)?
            .to_payload();
        let system_parameters = collaborators
            .parameters
            .system_parameters(&config, &benchmark, &system)?
            .to_payload();

        *watchdog = Some(self.arm_watchdog(record.token(), deadline));
        record.set_abortion_deadline(Utc::now(), deadline);
        record.set_state(ExperimentState::Init);
        self.publish(Some(record));
        debug!(experiment_id = %config.id, deadline_secs = deadline.as_secs(), "abort watchdog armed");

        let benchmark_spec = ContainerSpec {
            image: benchmark_image,
            role: ContainerRole::Benchmark,
            parent: None,
            env: vec![
                format!("{ENV_BUS_HOST}={}", settings.bus_host),
                format!("{ENV_SESSION_ID}={}", config.id),
                format!("{ENV_EXPERIMENT_URI}={}", record.experiment_uri()),
                format!("{ENV_BENCHMARK_PARAMETERS}={benchmark_parameters}"),
                format!("{ENV_SYSTEM_URI}={}", config.system),
            ],
            command: Vec::new(),
            session_id: config.id.to_string(),
            volumes: Vec::new(),
        };
        let benchmark_id = match collaborators.runtime.start_container(benchmark_spec).await {
            Ok(container_id) => container_id,
            Err(err) => {
                record.add_error(ErrorCode::BenchmarkCreationError);
                return Err(ControllerError::ContainerStart {
                    role: ContainerRole::Benchmark,
                    reason: err.to_string(),
                });
            }
        };
        record.set_container(ContainerRole::Benchmark, benchmark_id.clone());
        self.publish(Some(record));
        info!(experiment_id = %config.id, container = %benchmark_id, "benchmark container started");

        let volume = match collaborators.runtime.create_volume().await {
            Ok(volume) => volume,
            Err(err) => {
                self.force_terminate_locked(record, ErrorCode::SystemCreationError)
                    .await;
                return Err(ControllerError::ContainerStart {
                    role: ContainerRole::System,
                    reason: format!("shared volume: {err}"),
                });
            }
        };
        record.set_volume(volume.clone());

        let system_spec = ContainerSpec {
            image: system_image,
            role: ContainerRole::System,
            parent: Some(benchmark_id),
            env: vec![
                format!("{ENV_BUS_HOST}={}", settings.bus_host),
                format!("{ENV_SESSION_ID}={}", config.id),
                format!("{ENV_SYSTEM_PARAMETERS}={system_parameters}"),
            ],
            command: Vec::new(),
            session_id: config.id.to_string(),
            volumes: vec![format!("{volume}:{SHARED_VOLUME_MOUNT}")],
        };
        match collaborators.runtime.start_container(system_spec).await {
            Ok(container_id) => {
                info!(experiment_id = %config.id, container = %container_id, "system container started");
                record.set_container(ContainerRole::System, container_id);
                self.publish(Some(record));
                Ok(())
            }
            Err(err) => {
                self.force_terminate_locked(record, ErrorCode::SystemCreationError)
                    .await;
                Err(ControllerError::ContainerStart {
                    role: ContainerRole::System,
                    reason: err.to_string(),
                })
            }
        }
    }

    fn arm_watchdog(&self, token: RecordToken, after: Duration) -> AbortWatchdog {
        let inner: Weak<ControllerInner> = Arc::downgrade(&self.inner);
        AbortWatchdog::arm(token, after, move |token| async move {
            if let Some(inner) = inner.upgrade() {
                ExperimentController { inner }.on_abort_deadline(token).await;
            }
        })
    }

    /// Tear down the benchmark container tree and record `code`.
    async fn force_terminate_locked(&self, record: &mut ExperimentRecord, code: ErrorCode) {
        let runtime = &self.inner.collaborators.runtime;
        warn!(experiment_id = %record.id(), error = %code, "forcing experiment termination");
        if let Some(parent) = record.benchmark_container().map(str::to_owned) {
            if let Err(err) = runtime.remove_parent_and_children(&parent).await {
                error!(container = %parent, error = %err, "failed to remove container tree, removing benchmark directly");
                if let Err(err) = runtime.stop_container(&parent).await {
                    warn!(container = %parent, error = %err, "failed to stop benchmark container");
                }
                if let Err(err) = runtime.remove_container(&parent).await {
                    warn!(container = %parent, error = %err, "failed to remove benchmark container");
                }
            }
        }
        record.add_error(code);
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_forced_termination(code.name());
        }
        self.publish(Some(record));
    }

    /// Mark a container as ready; sends the start signal once both are.
    pub async fn report_ready(&self, role: ContainerRole) {
        let mut guard = self.inner.slot.lock().await;
        let Some(record) = guard.record.as_mut() else {
            debug!(%role, "readiness reported while the slot is empty");
            return;
        };
        let both_ready = record.set_ready(role);
        debug!(experiment_id = %record.id(), %role, both_ready, "container ready");
        if both_ready && record.state() == ExperimentState::Init {
            if let Err(first) = self.send_start_signal(record).await {
                warn!(experiment_id = %record.id(), error = %first, "start signal failed, retrying once");
                if let Err(second) = self.send_start_signal(record).await {
                    error!(experiment_id = %record.id(), error = %second, "start signal failed twice");
                    self.force_terminate_locked(record, ErrorCode::UnexpectedError)
                        .await;
                }
            }
        }
        self.publish(Some(record));
    }

    async fn send_start_signal(&self, record: &mut ExperimentRecord) -> anyhow::Result<()> {
        let collaborators = &self.inner.collaborators;
        let system = record
            .system_container()
            .ok_or_else(|| anyhow!("system container was never started"))?
            .to_owned();
        let name = collaborators
            .runtime
            .container_name(&system)
            .await?
            .ok_or_else(|| anyhow!("no name known for system container {system}"))?;
        collaborators
            .bus
            .send_command(
                record.id().as_str(),
                CommandCode::StartBenchmark,
                name.into_bytes(),
            )
            .await?;
        record.set_state(ExperimentState::Started);
        info!(experiment_id = %record.id(), "benchmark start signal sent");
        Ok(())
    }

    pub async fn report_task_generation_done(&self) {
        let mut guard = self.inner.slot.lock().await;
        let Some(record) = guard.record.as_mut() else {
            debug!("task generation finished while the slot is empty");
            return;
        };
        let previous = record.state();
        if previous != ExperimentState::Started {
            warn!(experiment_id = %record.id(), state = ?previous, "task generation finished outside the started state");
        }
        record.set_state(ExperimentState::Evaluation);
        self.publish(Some(record));
    }

    pub async fn report_benchmark_finished(&self, result: Value) {
        let mut guard = self.inner.slot.lock().await;
        match guard.record.as_mut() {
            Some(record) => {
                debug!(experiment_id = %record.id(), "benchmark result received");
                record.merge_result(result);
            }
            None => error!("benchmark result received while the slot is empty, dropping it"),
        }
    }

    /// Handle a container exit reported by the runtime.
    pub async fn report_container_exit(&self, container_id: &str, exit_code: i32) {
        let consumed = {
            let mut guard = self.inner.slot.lock().await;
            let slot = &mut *guard;
            match slot.record.as_mut() {
                Some(record) if record.benchmark_container() == Some(container_id) => {
                    info!(experiment_id = %record.id(), exit_code, "benchmark container exited");
                    record.set_state(ExperimentState::Stopped);
                    if exit_code != 0 {
                        record.add_error(ErrorCode::BenchmarkCrashed);
                    }
                    self.finalize_locked(slot).await;
                    true
                }
                Some(record)
                    if record.system_container() == Some(container_id)
                        && record.state() == ExperimentState::Init =>
                {
                    warn!(experiment_id = %record.id(), exit_code, "system container exited during initialization");
                    self.force_terminate_locked(record, ErrorCode::SystemCrashed)
                        .await;
                    true
                }
                _ => false,
            }
        };
        if !consumed {
            self.broadcast_termination(container_id, exit_code).await;
        }
    }

    async fn broadcast_termination(&self, container_id: &str, exit_code: i32) {
        let collaborators = &self.inner.collaborators;
        match collaborators.runtime.container_name(container_id).await {
            Ok(Some(name)) => {
                debug!(container = %name, exit_code, "broadcasting container termination");
                if let Err(err) = collaborators
                    .bus
                    .send_command(
                        BROADCAST_SESSION,
                        CommandCode::ContainerTerminated,
                        encode_container_terminated(&name, exit_code),
                    )
                    .await
                {
                    error!(container = %name, error = %err, "failed to broadcast container termination");
                }
            }
            Ok(None) => info!(container = container_id, exit_code, "unknown container stopped"),
            Err(err) => {
                warn!(container = container_id, error = %err, "failed to resolve container name")
            }
        }
    }

    /// Watchdog callback; acts only if `token` still occupies the slot.
    pub async fn on_abort_deadline(&self, token: RecordToken) {
        let mut guard = self.inner.slot.lock().await;
        match guard.record.as_mut() {
            Some(record) if record.token() == token => {
                if record.state().is_terminal() {
                    debug!(experiment_id = %record.id(), "abort deadline reached after the experiment stopped");
                    return;
                }
                error!(experiment_id = %record.id(), "experiment exceeded its runtime deadline");
                self.force_terminate_locked(record, ErrorCode::ExperimentTookTooMuchTime)
                    .await;
            }
            _ => warn!(token = token.0, "ignoring stale abort deadline"),
        }
    }

    /// Stop the running experiment if it has the given id.
    pub async fn stop_if_matching(&self, id: &ExperimentId) -> bool {
        let mut guard = self.inner.slot.lock().await;
        let slot = &mut *guard;
        let Some(record) = slot.record.as_mut() else {
            return false;
        };
        if record.id() != id || record.state().is_terminal() {
            return false;
        }
        info!(experiment_id = %id, "experiment stopped by user");
        self.force_terminate_locked(record, ErrorCode::TerminatedByUser)
            .await;
        self.finalize_locked(slot).await;
        true
    }

    /// Finalize whatever occupies the slot.
    pub async fn finalize_current(&self) {
        let mut guard = self.inner.slot.lock().await;
        self.finalize_locked(&mut guard).await;
    }

    async fn finalize_locked(&self, slot: &mut Slot) {
        let Some(mut record) = slot.record.take() else {
            debug!("finalize requested while the slot is empty");
            return;
        };
        if let Some(watchdog) = slot.watchdog.take() {
            watchdog.close();
        }
        let collaborators = &self.inner.collaborators;
        info!(experiment_id = %record.id(), "finalizing experiment");
        record.set_state(ExperimentState::Stopped);

        match collaborators.cluster.manager().health().await {
            Ok(health) if !health.healthy => {
                error!(
                    experiment_id = %record.id(),
                    expected_nodes = health.expected_nodes,
                    current_nodes = health.current_nodes,
                    "cluster became unhealthy during the experiment"
                );
                record.add_error(ErrorCode::ClusterNotHealthy);
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "cluster health unavailable during finalize"),
        }

        record.ensure_result();
        let graph = self.result_graph(record.config()).await;
        let ended_at = Utc::now();
        let result = record.enriched_result(ended_at);
        match collaborators.results.insert(&result, graph).await {
            Ok(true) => debug!(experiment_id = %record.id(), %graph, "result stored"),
            Ok(false) => {
                error!(experiment_id = %record.id(), %graph, payload = %result, "result store rejected the result")
            }
            Err(err) => {
                error!(experiment_id = %record.id(), %graph, error = %err, payload = %result, "failed to store result")
            }
        }

        if let Err(err) = self.inner.queue.remove(record.id()) {
            error!(experiment_id = %record.id(), error = %err, "failed to remove experiment from the queue");
        }
        if let Some(volume) = record.volume() {
            if let Err(err) = collaborators.runtime.remove_volume(volume).await {
                warn!(volume, error = %err, "failed to remove shared volume");
            }
        }
        self.publish(None);

        if let Some(metrics) = &self.inner.metrics {
            let elapsed = (ended_at - record.started_at())
                .to_std()
                .ok()
                .map(|elapsed| elapsed.as_secs_f64());
            metrics.record_finalization(
                graph.as_ref(),
                record.errors().iter().map(ErrorCode::name),
                elapsed,
            );
            if let Ok(depth) = self.inner.queue.len() {
                metrics.set_queue_depth(depth);
            }
        }

        if graph == ResultGraph::Public {
            if let Err(err) = collaborators.analysis.analyze(record.experiment_uri()).await {
                error!(experiment_id = %record.id(), error = %err, "analysis request failed");
            }
        }
        info!(experiment_id = %record.id(), errors = record.errors().len(), "experiment finalized");
    }

    async fn result_graph(&self, config: &ExperimentConfig) -> ResultGraph {
        let Some(challenge) = config.challenge.as_deref() else {
            return ResultGraph::Public;
        };
        match self
            .inner
            .collaborators
            .metadata
            .challenge_is_repeatable(challenge)
            .await
        {
            Ok(true) => ResultGraph::Public,
            Ok(false) => ResultGraph::Private,
            Err(err) => {
                warn!(challenge, error = %err, "challenge repeatability unknown, keeping result private");
                ResultGraph::Private
            }
        }
    }

    /// Status view for `caller`; does not take the slot lock.
    pub fn status(&self, caller: Option<&str>) -> Result<ControllerStatus> {
        let current = self.current();
        let running = current.as_ref().map(|snapshot| snapshot.config.id.clone());
        let queue = self
            .inner
            .queue
            .list_all()?
            .into_iter()
            .filter(|config| Some(&config.id) != running.as_ref())
            .map(QueuedExperiment::from)
            .collect();
        Ok(ControllerStatus {
            current: current.map(|snapshot| RunningExperiment::from_snapshot(&snapshot, caller)),
            queue,
        })
    }

    /// Forward runtime exit notifications into the controller until shutdown.
    pub fn spawn_exit_listener(
        &self,
        mut exits: mpsc::Receiver<ContainerExit>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let controller = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("exit listener shutdown");
                        break;
                    }
                    exit = exits.recv() => match exit {
                        Some(exit) => {
                            controller
                                .report_container_exit(&exit.container_id, exit.exit_code)
                                .await;
                        }
                        None => {
                            debug!("exit channel closed");
                            break;
                        }
                    }
                }
            }
        })
    }
}
