//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Contracts of the services the lifecycle controller drives."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, Display};

use crate::dispatch::CommandCode;
use crate::params::ParameterResolver;
use crate::timeouts::TimeoutResolver;

/// Session id addressing every listener on the command bus.
pub const BROADCAST_SESSION: &str = "broadcast";

/// Role a workload container plays in an experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ContainerRole {
    /// Drives the workload and reports results.
    Benchmark,
    /// Subject under test.
    System,
}

/// Everything the runtime needs to launch one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub role: ContainerRole,
    /// Container this one is a child of; torn down together with it.
    pub parent: Option<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub command: Vec<String>,
    pub session_id: String,
    /// `volume:mountpoint` pairs.
    pub volumes: Vec<String>,
}

impl ContainerSpec {
    /// Value of an environment entry, if present.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env.iter().find_map(|entry| {
            entry
                .split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }
}

/// Termination notice delivered by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerExit {
    pub container_id: String,
    pub exit_code: i32,
}

/// Gateway to the container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch a container and return its id.
    async fn start_container(&self, spec: ContainerSpec) -> anyhow::Result<String>;

    async fn pull_image(&self, image: &str) -> anyhow::Result<()>;

    /// Stop and remove a container together with every child it spawned.
    async fn remove_parent_and_children(&self, parent_id: &str) -> anyhow::Result<()>;

    async fn stop_container(&self, container_id: &str) -> anyhow::Result<()>;

    async fn remove_container(&self, container_id: &str) -> anyhow::Result<()>;

    async fn container_name(&self, container_id: &str) -> anyhow::Result<Option<String>>;

    async fn container_id(&self, container_name: &str) -> anyhow::Result<Option<String>>;

    /// Create a volume shared between the containers of one experiment.
    async fn create_volume(&self) -> anyhow::Result<String>;

    async fn remove_volume(&self, volume: &str) -> anyhow::Result<()>;
}

/// Node counts reported by a cluster health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterHealth {
    pub healthy: bool,
    pub expected_nodes: usize,
    pub current_nodes: usize,
}

#[async_trait]
pub trait ClusterManager: Send + Sync {
    async fn health(&self) -> anyhow::Result<ClusterHealth>;
}

/// Opaque cluster descriptor handed to elastic backends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterSpec(pub String);

/// Extension implemented by clusters that are provisioned on demand.
#[async_trait]
pub trait ElasticCluster: Send + Sync {
    /// Let the backend scale for the given number of waiting experiments.
    async fn react_to_queue_depth(&self, depth: usize) -> anyhow::Result<()>;

    async fn provision_cluster(&self, spec: &ClusterSpec) -> anyhow::Result<()>;
}

/// Cluster capability chosen once at construction.
#[derive(Clone)]
pub struct ClusterBackend {
    manager: Arc<dyn ClusterManager>,
    elastic: Option<Arc<dyn ElasticCluster>>,
}

impl ClusterBackend {
    /// Fixed-size cluster; admissions are gated on its health.
    pub fn fixed(manager: Arc<dyn ClusterManager>) -> Self {
        Self {
            manager,
            elastic: None,
        }
    }

    /// Elastic cluster; provisioned per experiment instead of health gated.
    pub fn elastic<C>(cluster: Arc<C>) -> Self
    where
        C: ClusterManager + ElasticCluster + 'static,
    {
        Self {
            manager: cluster.clone(),
            elastic: Some(cluster as Arc<dyn ElasticCluster>),
        }
    }

    pub fn manager(&self) -> &dyn ClusterManager {
        self.manager.as_ref()
    }

    pub fn elastic_extension(&self) -> Option<&dyn ElasticCluster> {
        self.elastic.as_deref()
    }
}

/// Outbound side of the command bus.
#[async_trait]
pub trait CommandBus: Send + Sync {
    async fn send_command(
        &self,
        session_id: &str,
        command: CommandCode,
        payload: Vec<u8>,
    ) -> anyhow::Result<()>;
}

/// A parameter declared by a benchmark or system description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDecl {
    pub key: String,
    #[serde(default)]
    pub default: Option<Value>,
    /// Benchmark parameters flagged here are copied to the system.
    #[serde(default)]
    pub forwarded: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMeta {
    pub uri: String,
    pub main_image: Option<String>,
    #[serde(default)]
    pub used_images: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDecl>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMeta {
    pub uri: String,
    pub main_image: Option<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterDecl>,
}

/// Lookup of benchmark, system, and challenge descriptions.
#[async_trait]
pub trait MetadataResolver: Send + Sync {
    async fn benchmark(&self, uri: &str) -> anyhow::Result<Option<BenchmarkMeta>>;

    async fn system(&self, uri: &str) -> anyhow::Result<Option<SystemMeta>>;

    /// Whether results of the challenge may be published immediately.
    async fn challenge_is_repeatable(&self, challenge: &str) -> anyhow::Result<bool>;
}

/// Graph a result payload is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum ResultGraph {
    Public,
    Private,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist a result payload; `false` means the store rejected it.
    async fn insert(&self, result: &Value, graph: ResultGraph) -> anyhow::Result<bool>;
}

/// Downstream consumer notified about publicly stored results.
#[async_trait]
pub trait AnalysisSink: Send + Sync {
    async fn analyze(&self, experiment_uri: &str) -> anyhow::Result<()>;
}

/// Every collaborator the controller calls out to.
#[derive(Clone)]
pub struct Collaborators {
    pub runtime: Arc<dyn ContainerRuntime>,
    pub cluster: ClusterBackend,
    pub bus: Arc<dyn CommandBus>,
    pub metadata: Arc<dyn MetadataResolver>,
    pub parameters: Arc<dyn ParameterResolver>,
    pub timeouts: Arc<dyn TimeoutResolver>,
    pub results: Arc<dyn ResultStore>,
    pub analysis: Arc<dyn AnalysisSink>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_value_finds_exact_key() {
        let spec = ContainerSpec {
            image: "img".into(),
            role: ContainerRole::System,
            parent: None,
            env: vec!["SESSION_ID=1".into(), "SESSION=2".into(), "URL=a=b".into()],
            command: Vec::new(),
            session_id: "1".into(),
            volumes: Vec::new(),
        };
        assert_eq!(spec.env_value("SESSION"), Some("2"));
        assert_eq!(spec.env_value("URL"), Some("a=b"));
        assert_eq!(spec.env_value("MISSING"), None);
    }

    #[test]
    fn role_and_graph_labels() {
        assert_eq!(ContainerRole::Benchmark.to_string(), "benchmark");
        assert_eq!(ResultGraph::Private.as_ref(), "private");
    }
}
