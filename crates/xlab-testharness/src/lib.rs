//! ---
//! xlab_section: "04-test-harness"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Collaborator fakes and controller wiring for scenario tests."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
//! In-process stand-ins for every service the lifecycle controller drives.
//!
//! Each fake records the calls it receives and exposes a few switches to
//! inject failures, so scenario tests can assert on the exact side effects of
//! an experiment run without a container runtime or message bus.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;
use xlab_common::{ExperimentConfig, TimeoutConfig};
use xlab_core::{
    AnalysisSink, BenchmarkMeta, ClusterBackend, ClusterHealth, ClusterManager, ClusterSpec,
    Collaborators, CommandBus, CommandCode, ConfiguredTimeouts, ContainerExit, ContainerRole,
    ContainerRuntime, ContainerSpec, ControllerSettings, DeclaredParameterResolver,
    ElasticCluster, ExperimentController, MetadataResolver, ParameterDecl, ResultGraph,
    ResultStore, SystemMeta,
};
use xlab_metrics::ControllerMetrics;
use xlab_queue::ExperimentQueue;

pub const BENCHMARK_URI: &str = "urn:bench";
pub const SYSTEM_URI: &str = "urn:sys";
pub const BENCHMARK_IMAGE: &str = "registry.local/bench:latest";
pub const DATA_GENERATOR_IMAGE: &str = "registry.local/bench-datagen:latest";
pub const SYSTEM_IMAGE: &str = "registry.local/sys:latest";

/// Exit code reported for containers removed by a teardown.
pub const KILLED_EXIT_CODE: i32 = 137;

/// Ad-hoc experiment against the default benchmark and system.
pub fn adhoc_config(id: &str) -> ExperimentConfig {
    ExperimentConfig::new(id, BENCHMARK_URI, SYSTEM_URI, json!({ "tasks": 10 }))
}

#[derive(Default)]
struct RuntimeState {
    next_id: u64,
    containers: HashMap<String, ContainerSpec>,
    started: Vec<ContainerSpec>,
    pulled: Vec<String>,
    removed_trees: Vec<String>,
    stopped: Vec<String>,
    removed: Vec<String>,
    volumes_created: Vec<String>,
    volumes_removed: Vec<String>,
    fail_start: HashSet<ContainerRole>,
    fail_volume: bool,
    fail_tree_removal: bool,
    panic_on_pull: bool,
    name_lookup_failures: usize,
}

/// Container runtime that only bookkeeps.
///
/// Removing a container tree reports the parent as exited with
/// [`KILLED_EXIT_CODE`], the way a real runtime reports a killed container.
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
    exits: mpsc::Sender<ContainerExit>,
}

impl FakeRuntime {
    pub fn new(exits: mpsc::Sender<ContainerExit>) -> Self {
        Self {
            state: Mutex::new(RuntimeState::default()),
            exits,
        }
    }

    pub fn fail_start(&self, role: ContainerRole) {
        self.state.lock().fail_start.insert(role);
    }

    pub fn fail_volume_creation(&self) {
        self.state.lock().fail_volume = true;
    }

    pub fn fail_tree_removal(&self) {
        self.state.lock().fail_tree_removal = true;
    }

    /// Panic inside the next image pull, simulating a bug in the gateway.
    pub fn panic_on_pull(&self) {
        self.state.lock().panic_on_pull = true;
    }

    /// Make the next `count` name lookups fail.
    pub fn fail_name_lookups(&self, count: usize) {
        self.state.lock().name_lookup_failures = count;
    }

    pub fn started(&self) -> Vec<ContainerSpec> {
        self.state.lock().started.clone()
    }

    pub fn started_with_role(&self, role: ContainerRole) -> Vec<ContainerSpec> {
        self.started()
            .into_iter()
            .filter(|spec| spec.role == role)
            .collect()
    }

    pub fn pulled(&self) -> Vec<String> {
        self.state.lock().pulled.clone()
    }

    pub fn removed_trees(&self) -> Vec<String> {
        self.state.lock().removed_trees.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().stopped.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().removed.clone()
    }

    pub fn volumes_created(&self) -> Vec<String> {
        self.state.lock().volumes_created.clone()
    }

    pub fn volumes_removed(&self) -> Vec<String> {
        self.state.lock().volumes_removed.clone()
    }

    /// Name the runtime reports for `container_id`.
    pub fn name_of(container_id: &str) -> String {
        format!("{container_id}-name")
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start_container(&self, spec: ContainerSpec) -> Result<String> {
        let mut state = self.state.lock();
        if state.fail_start.contains(&spec.role) {
            return Err(anyhow!("{} image could not be started", spec.role));
        }
        state.next_id += 1;
        let id = format!("{}-{}", spec.role, state.next_id);
        state.started.push(spec.clone());
        state.containers.insert(id.clone(), spec);
        Ok(id)
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let panic = std::mem::take(&mut self.state.lock().panic_on_pull);
        if panic {
            panic!("image pull of {image} crashed");
        }
        self.state.lock().pulled.push(image.to_owned());
        Ok(())
    }

    async fn remove_parent_and_children(&self, parent_id: &str) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.fail_tree_removal {
                return Err(anyhow!("container tree of {parent_id} could not be removed"));
            }
            state.removed_trees.push(parent_id.to_owned());
        }
        let exit = ContainerExit {
            container_id: parent_id.to_owned(),
            exit_code: KILLED_EXIT_CODE,
        };
        if self.exits.try_send(exit).is_err() {
            debug!(container = parent_id, "exit notice dropped");
        }
        Ok(())
    }

    async fn stop_container(&self, container_id: &str) -> Result<()> {
        self.state.lock().stopped.push(container_id.to_owned());
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        self.state.lock().removed.push(container_id.to_owned());
        Ok(())
    }

    async fn container_name(&self, container_id: &str) -> Result<Option<String>> {
        let mut state = self.state.lock();
        if state.name_lookup_failures > 0 {
            state.name_lookup_failures -= 1;
            return Err(anyhow!("runtime did not answer the name lookup"));
        }
        Ok(state
            .containers
            .contains_key(container_id)
            .then(|| Self::name_of(container_id)))
    }

    async fn container_id(&self, container_name: &str) -> Result<Option<String>> {
        let state = self.state.lock();
        Ok(container_name
            .strip_suffix("-name")
            .filter(|id| state.containers.contains_key(*id))
            .map(str::to_owned))
    }

    async fn create_volume(&self) -> Result<String> {
        let mut state = self.state.lock();
        if state.fail_volume {
            return Err(anyhow!("volume driver unavailable"));
        }
        state.next_id += 1;
        let volume = format!("volume-{}", state.next_id);
        state.volumes_created.push(volume.clone());
        Ok(volume)
    }

    async fn remove_volume(&self, volume: &str) -> Result<()> {
        self.state.lock().volumes_removed.push(volume.to_owned());
        Ok(())
    }
}

/// Cluster usable both as a fixed and as an elastic backend.
#[derive(Default)]
pub struct FakeCluster {
    unhealthy: AtomicBool,
    fail_provision: AtomicBool,
    provisioned: Mutex<Vec<ClusterSpec>>,
    depths: Mutex<Vec<usize>>,
}

impl FakeCluster {
    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::SeqCst);
    }

    pub fn fail_provision(&self) {
        self.fail_provision.store(true, Ordering::SeqCst);
    }

    pub fn provisioned(&self) -> Vec<ClusterSpec> {
        self.provisioned.lock().clone()
    }

    pub fn reported_depths(&self) -> Vec<usize> {
        self.depths.lock().clone()
    }
}

#[async_trait]
impl ClusterManager for FakeCluster {
    async fn health(&self) -> Result<ClusterHealth> {
        let healthy = !self.unhealthy.load(Ordering::SeqCst);
        Ok(ClusterHealth {
            healthy,
            expected_nodes: 3,
            current_nodes: if healthy { 3 } else { 2 },
        })
    }
}

#[async_trait]
impl ElasticCluster for FakeCluster {
    async fn react_to_queue_depth(&self, depth: usize) -> Result<()> {
        self.depths.lock().push(depth);
        Ok(())
    }

    async fn provision_cluster(&self, spec: &ClusterSpec) -> Result<()> {
        if self.fail_provision.load(Ordering::SeqCst) {
            return Err(anyhow!("cluster capacity exhausted"));
        }
        self.provisioned.lock().push(spec.clone());
        Ok(())
    }
}

/// Command sent through [`FakeBus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentCommand {
    pub session_id: String,
    pub command: CommandCode,
    pub payload: Vec<u8>,
}

#[derive(Default)]
pub struct FakeBus {
    sent: Mutex<Vec<SentCommand>>,
    failures: AtomicUsize,
}

impl FakeBus {
    /// Make the next `count` sends fail.
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentCommand> {
        self.sent.lock().clone()
    }

    pub fn sent_with(&self, command: CommandCode) -> Vec<SentCommand> {
        self.sent()
            .into_iter()
            .filter(|sent| sent.command == command)
            .collect()
    }
}

#[async_trait]
impl CommandBus for FakeBus {
    async fn send_command(
        &self,
        session_id: &str,
        command: CommandCode,
        payload: Vec<u8>,
    ) -> Result<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow!("bus connection reset"));
        }
        self.sent.lock().push(SentCommand {
            session_id: session_id.to_owned(),
            command,
            payload,
        });
        Ok(())
    }
}

/// Metadata store preloaded with one benchmark and one system.
pub struct FakeMetadata {
    benchmarks: Mutex<HashMap<String, BenchmarkMeta>>,
    systems: Mutex<HashMap<String, SystemMeta>>,
    repeatable: Mutex<HashMap<String, bool>>,
}

impl Default for FakeMetadata {
    fn default() -> Self {
        let benchmark = BenchmarkMeta {
            uri: BENCHMARK_URI.into(),
            main_image: Some(BENCHMARK_IMAGE.into()),
            used_images: vec![DATA_GENERATOR_IMAGE.into(), BENCHMARK_IMAGE.into()],
            parameters: vec![
                ParameterDecl {
                    key: "tasks".into(),
                    default: Some(json!(100)),
                    forwarded: true,
                },
                ParameterDecl {
                    key: "seed".into(),
                    default: Some(json!(42)),
                    forwarded: false,
                },
            ],
        };
        let system = SystemMeta {
            uri: SYSTEM_URI.into(),
            main_image: Some(SYSTEM_IMAGE.into()),
            parameters: vec![ParameterDecl {
                key: "threads".into(),
                default: Some(json!(4)),
                forwarded: false,
            }],
        };
        Self {
            benchmarks: Mutex::new(HashMap::from([(BENCHMARK_URI.to_string(), benchmark)])),
            systems: Mutex::new(HashMap::from([(SYSTEM_URI.to_string(), system)])),
            repeatable: Mutex::new(HashMap::new()),
        }
    }
}

impl FakeMetadata {
    pub fn insert_benchmark(&self, meta: BenchmarkMeta) {
        self.benchmarks.lock().insert(meta.uri.clone(), meta);
    }

    pub fn insert_system(&self, meta: SystemMeta) {
        self.systems.lock().insert(meta.uri.clone(), meta);
    }

    pub fn set_repeatable(&self, challenge: &str, repeatable: bool) {
        self.repeatable
            .lock()
            .insert(challenge.to_owned(), repeatable);
    }
}

#[async_trait]
impl MetadataResolver for FakeMetadata {
    async fn benchmark(&self, uri: &str) -> Result<Option<BenchmarkMeta>> {
        Ok(self.benchmarks.lock().get(uri).cloned())
    }

    async fn system(&self, uri: &str) -> Result<Option<SystemMeta>> {
        Ok(self.systems.lock().get(uri).cloned())
    }

    async fn challenge_is_repeatable(&self, challenge: &str) -> Result<bool> {
        self.repeatable
            .lock()
            .get(challenge)
            .copied()
            .ok_or_else(|| anyhow!("unknown challenge {challenge}"))
    }
}

pub struct FakeResultStore {
    inserted: Mutex<Vec<(Value, ResultGraph)>>,
    accept: AtomicBool,
}

impl Default for FakeResultStore {
    fn default() -> Self {
        Self {
            inserted: Mutex::new(Vec::new()),
            accept: AtomicBool::new(true),
        }
    }
}

impl FakeResultStore {
    pub fn reject_writes(&self) {
        self.accept.store(false, Ordering::SeqCst);
    }

    pub fn inserted(&self) -> Vec<(Value, ResultGraph)> {
        self.inserted.lock().clone()
    }
}

#[async_trait]
impl ResultStore for FakeResultStore {
    async fn insert(&self, result: &Value, graph: ResultGraph) -> Result<bool> {
        self.inserted.lock().push((result.clone(), graph));
        Ok(self.accept.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct FakeAnalysis {
    analyzed: Mutex<Vec<String>>,
}

impl FakeAnalysis {
    pub fn analyzed(&self) -> Vec<String> {
        self.analyzed.lock().clone()
    }
}

#[async_trait]
impl AnalysisSink for FakeAnalysis {
    async fn analyze(&self, experiment_uri: &str) -> Result<()> {
        self.analyzed.lock().push(experiment_uri.to_owned());
        Ok(())
    }
}

/// Builder for a controller wired to fresh fakes.
pub struct HarnessBuilder {
    elastic: bool,
    default_deadline: Duration,
    timeouts: IndexMap<String, TimeoutConfig>,
    queue: Option<ExperimentQueue>,
    metrics: Option<ControllerMetrics>,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            elastic: false,
            default_deadline: Duration::from_secs(20 * 60),
            timeouts: IndexMap::new(),
            queue: None,
            metrics: None,
        }
    }
}

impl HarnessBuilder {
    /// Use the fake cluster as an elastic backend.
    pub fn elastic(mut self) -> Self {
        self.elastic = true;
        self
    }

    pub fn default_deadline(mut self, deadline: Duration) -> Self {
        self.default_deadline = deadline;
        self
    }

    pub fn timeout(mut self, benchmark: &str, timeouts: TimeoutConfig) -> Self {
        self.timeouts.insert(benchmark.to_owned(), timeouts);
        self
    }

    pub fn queue(mut self, queue: ExperimentQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn metrics(mut self, metrics: ControllerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> Harness {
        let (exit_tx, exit_rx) = mpsc::channel(64);
        let runtime = Arc::new(FakeRuntime::new(exit_tx));
        let cluster = Arc::new(FakeCluster::default());
        let bus = Arc::new(FakeBus::default());
        let metadata = Arc::new(FakeMetadata::default());
        let results = Arc::new(FakeResultStore::default());
        let analysis = Arc::new(FakeAnalysis::default());

        let cluster_backend = if self.elastic {
            ClusterBackend::elastic(cluster.clone())
        } else {
            ClusterBackend::fixed(cluster.clone())
        };
        let collaborators = Collaborators {
            runtime: runtime.clone(),
            cluster: cluster_backend,
            bus: bus.clone(),
            metadata: metadata.clone(),
            parameters: Arc::new(DeclaredParameterResolver),
            timeouts: Arc::new(ConfiguredTimeouts::new(self.timeouts)),
            results: results.clone(),
            analysis: analysis.clone(),
        };
        let settings = ControllerSettings {
            default_max_execution_time: self.default_deadline,
            ..ControllerSettings::default()
        };
        let queue = self.queue.unwrap_or_else(ExperimentQueue::in_memory);
        let controller =
            ExperimentController::new(queue, collaborators.clone(), settings, self.metrics);

        Harness {
            controller,
            collaborators,
            runtime,
            cluster,
            bus,
            metadata,
            results,
            analysis,
            exits: Some(exit_rx),
        }
    }
}

/// Controller plus handles to every fake it talks to.
pub struct Harness {
    pub controller: ExperimentController,
    /// The fakes bundled for wiring another controller or service.
    pub collaborators: Collaborators,
    pub runtime: Arc<FakeRuntime>,
    pub cluster: Arc<FakeCluster>,
    pub bus: Arc<FakeBus>,
    pub metadata: Arc<FakeMetadata>,
    pub results: Arc<FakeResultStore>,
    pub analysis: Arc<FakeAnalysis>,
    exits: Option<mpsc::Receiver<ContainerExit>>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Receiver of the exits the fake runtime reports.
    pub fn take_exits(&mut self) -> Result<mpsc::Receiver<ContainerExit>> {
        self.exits
            .take()
            .ok_or_else(|| anyhow!("exit receiver already taken"))
    }

    /// Route teardown exits back into the controller, as the runtime would.
    pub fn spawn_exit_listener(
        &mut self,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<JoinHandle<()>> {
        let exits = self.take_exits()?;
        Ok(self.controller.spawn_exit_listener(exits, shutdown))
    }

    pub fn enqueue(&self, config: ExperimentConfig) -> Result<()> {
        self.controller.queue().add(config)?;
        Ok(())
    }

    /// Wait until the slot is empty; false if `limit` passed first.
    pub async fn wait_for_idle(&self, limit: Duration) -> bool {
        let idle = async {
            while self.controller.current().is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(limit, idle).await.is_ok()
    }

    /// Most recently started benchmark container.
    pub fn benchmark_container(&self) -> Option<String> {
        self.container_of(ContainerRole::Benchmark)
    }

    pub fn system_container(&self) -> Option<String> {
        self.container_of(ContainerRole::System)
    }

    fn container_of(&self, role: ContainerRole) -> Option<String> {
        let state = self.runtime.state.lock();
        state
            .containers
            .iter()
            .filter(|(_, spec)| spec.role == role)
            .max_by_key(|(id, _)| container_ordinal(id))
            .map(|(id, _)| id.clone())
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

fn container_ordinal(id: &str) -> u64 {
    id.rsplit('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or_default()
}
