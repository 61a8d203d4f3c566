//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Resolution of benchmark, system, and cluster parameters."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use anyhow::{anyhow, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use xlab_common::ExperimentConfig;

use crate::collaborators::{BenchmarkMeta, ClusterSpec, SystemMeta};

/// Parameter key holding the cluster descriptor for elastic backends.
pub const CLUSTER_CONFIG_KEY: &str = "clusterConfig";

/// Where a resolved parameter value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterSource {
    /// Supplied by the submitter.
    Direct,
    /// Filled from a declared default.
    Default,
    /// Copied from a forwarded benchmark parameter.
    Forwarded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedParameter {
    pub key: String,
    pub value: Value,
    pub source: ParameterSource,
}

/// Ordered parameter set handed to a container.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResolvedParameters {
    entries: Vec<ResolvedParameter>,
}

impl ResolvedParameters {
    /// Add a parameter unless the key is already resolved.
    pub fn push(&mut self, key: impl Into<String>, value: Value, source: ParameterSource) -> bool {
        let key = key.into();
        if self.get(&key).is_some() {
            return false;
        }
        self.entries.push(ResolvedParameter { key, value, source });
        true
    }

    pub fn get(&self, key: &str) -> Option<&ResolvedParameter> {
        self.entries.iter().find(|entry| entry.key == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResolvedParameter> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Opaque payload consumed by the container: a flat JSON object.
    pub fn to_payload(&self) -> Value {
        Value::Object(
            self.entries
                .iter()
                .map(|entry| (entry.key.clone(), entry.value.clone()))
                .collect(),
        )
    }
}

/// Fills in the parameter payloads of an admitted experiment.
pub trait ParameterResolver: Send + Sync {
    /// Submitted benchmark parameters, with unset declared parameters filled
    /// from their defaults.
    fn benchmark_parameters(
        &self,
        config: &ExperimentConfig,
        benchmark: &BenchmarkMeta,
    ) -> Result<ResolvedParameters>;

    /// Forwarded benchmark parameters followed by system-declared defaults.
    fn system_parameters(
        &self,
        config: &ExperimentConfig,
        benchmark: &BenchmarkMeta,
        system: &SystemMeta,
    ) -> Result<ResolvedParameters>;

    /// Cluster descriptor requested by the experiment; empty when unset.
    fn cluster_spec(&self, config: &ExperimentConfig) -> Result<ClusterSpec>;
}

/// Resolver working on JSON object payloads and declared parameter lists.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclaredParameterResolver;

fn submitted(config: &ExperimentConfig) -> Result<Map<String, Value>> {
    match &config.parameters {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map.clone()),
        other => Err(anyhow!(
            "parameters of experiment {} must be a JSON object, got {}",
            config.id,
            kind(other)
        )),
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

impl ParameterResolver for DeclaredParameterResolver {
    fn benchmark_parameters(
        &self,
        config: &ExperimentConfig,
        benchmark: &BenchmarkMeta,
    ) -> Result<ResolvedParameters> {
        let mut resolved = ResolvedParameters::default();
        for (key, value) in submitted(config)? {
            resolved.push(key, value, ParameterSource::Direct);
        }
        for decl in &benchmark.parameters {
            if let Some(default) = &decl.default {
                resolved.push(decl.key.clone(), default.clone(), ParameterSource::Default);
            }
        }
        Ok(resolved)
    }

    fn system_parameters(
        &self,
        config: &ExperimentConfig,
        benchmark: &BenchmarkMeta,
        system: &SystemMeta,
    ) -> Result<ResolvedParameters> {
        let submitted = submitted(config)?;
        let mut resolved = ResolvedParameters::default();
        for decl in benchmark.parameters.iter().filter(|decl| decl.forwarded) {
            if let Some(value) = submitted.get(&decl.key) {
                resolved.push(decl.key.clone(), value.clone(), ParameterSource::Forwarded);
            }
        }
        for decl in &system.parameters {
            if let Some(default) = &decl.default {
                resolved.push(decl.key.clone(), default.clone(), ParameterSource::Default);
            }
        }
        Ok(resolved)
    }

    fn cluster_spec(&self, config: &ExperimentConfig) -> Result<ClusterSpec> {
        let submitted = submitted(config)?;
        match submitted.get(CLUSTER_CONFIG_KEY) {
            None | Some(Value::Null) => Ok(ClusterSpec::default()),
            Some(Value::String(spec)) => Ok(ClusterSpec(spec.clone())),
            Some(other) => Ok(ClusterSpec(other.to_string())),
        }
    }
}
