//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Runtime record of the experiment occupying the controller slot."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use strum::{AsRefStr, Display, EnumString, IntoStaticStr};
use tracing::warn;
use xlab_common::{ExperimentConfig, ExperimentId};

use crate::collaborators::ContainerRole;

/// Lifecycle states of an admitted experiment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExperimentState {
    /// Elastic backends only: the cluster is being provisioned.
    CloudPrep,
    Prep,
    Init,
    Started,
    Evaluation,
    /// Terminal.
    Stopped,
}

impl ExperimentState {
    /// Human readable label reported by the status surface.
    pub fn label(self) -> &'static str {
        match self {
            ExperimentState::CloudPrep => "Preparing cloud resources",
            ExperimentState::Prep => "Preparing",
            ExperimentState::Init => "Initializing",
            ExperimentState::Started => "Started",
            ExperimentState::Evaluation => "Evaluating",
            ExperimentState::Stopped => "Stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == ExperimentState::Stopped
    }
}

/// Symbolic error codes attached to an experiment.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumString,
    IntoStaticStr,
)]
pub enum ErrorCode {
    BenchmarkImageMissing,
    SystemImageMissing,
    BenchmarkCreationError,
    SystemCreationError,
    BenchmarkCrashed,
    SystemCrashed,
    ClusterNotHealthy,
    ExperimentTookTooMuchTime,
    TerminatedByUser,
    UnexpectedError,
}

impl ErrorCode {
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// Insertion-ordered, duplicate-free set of error codes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorSet(IndexSet<ErrorCode>);

impl ErrorSet {
    /// Add a code unless already present; returns whether it was new.
    pub fn add(&mut self, code: ErrorCode) -> bool {
        self.0.insert(code)
    }

    pub fn contains(&self, code: ErrorCode) -> bool {
        self.0.contains(&code)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = ErrorCode> + '_ {
        self.0.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<ErrorCode> {
        self.iter().collect()
    }
}

/// Generation token identifying one admission of an experiment.
///
/// Tokens are never reused within a process, so a timer armed for an earlier
/// admission can never match a later occupant of the slot, even one that runs
/// the same configuration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordToken(pub u64);

/// Runtime state of the experiment occupying the slot.
#[derive(Debug, Clone)]
pub struct ExperimentRecord {
    token: RecordToken,
    config: ExperimentConfig,
    experiment_uri: String,
    state: ExperimentState,
    benchmark_container: Option<String>,
    system_container: Option<String>,
    benchmark_ready: bool,
    system_ready: bool,
    errors: ErrorSet,
    result: Option<Value>,
    started_at: DateTime<Utc>,
    abortion_deadline: Option<DateTime<Utc>>,
    volume: Option<String>,
}

impl ExperimentRecord {
    pub fn new(
        token: RecordToken,
        config: ExperimentConfig,
        experiment_uri: String,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            token,
            config,
            experiment_uri,
            state: ExperimentState::Prep,
            benchmark_container: None,
            system_container: None,
            benchmark_ready: false,
            system_ready: false,
            errors: ErrorSet::default(),
            result: None,
            started_at,
            abortion_deadline: None,
            volume: None,
        }
    }

    pub fn token(&self) -> RecordToken {
        self.token
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn id(&self) -> &ExperimentId {
        &self.config.id
    }

    pub fn experiment_uri(&self) -> &str {
        &self.experiment_uri
    }

    pub fn state(&self) -> ExperimentState {
        self.state
    }

    pub fn set_state(&mut self, state: ExperimentState) {
        self.state = state;
    }

    pub fn benchmark_container(&self) -> Option<&str> {
        self.benchmark_container.as_deref()
    }

    pub fn system_container(&self) -> Option<&str> {
        self.system_container.as_deref()
    }

    /// Record the container id for a role. Ids are write-once; a second
    /// assignment is ignored and returns `false`.
    pub fn set_container(&mut self, role: ContainerRole, container_id: String) -> bool {
        let slot = match role {
            ContainerRole::Benchmark => &mut self.benchmark_container,
            ContainerRole::System => &mut self.system_container,
        };
        if slot.is_some() {
            warn!(experiment_id = %self.config.id, role = %role, "container id already assigned");
            return false;
        }
        *slot = Some(container_id);
        true
    }

    /// Mark a role ready and report whether both sides are ready now.
    pub fn set_ready(&mut self, role: ContainerRole) -> bool {
        match role {
            ContainerRole::Benchmark => self.benchmark_ready = true,
            ContainerRole::System => self.system_ready = true,
        }
        self.benchmark_ready && self.system_ready
    }

    pub fn add_error(&mut self, code: ErrorCode) -> bool {
        self.errors.add(code)
    }

    pub fn errors(&self) -> &ErrorSet {
        &self.errors
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    /// Merge a result payload: object keys merge, anything else replaces.
    pub fn merge_result(&mut self, payload: Value) {
        match (&mut self.result, payload) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                existing.extend(incoming);
            }
            (current, payload) => *current = Some(payload),
        }
    }

    /// Guarantee a result payload exists, tagging a synthesized one with
    /// `UnexpectedError`.
    pub fn ensure_result(&mut self) {
        if self.result.is_none() {
            self.errors.add(ErrorCode::UnexpectedError);
            self.result = Some(Value::Object(Map::new()));
        }
    }

    /// Result payload enriched with the experiment metadata.
    pub fn enriched_result(&self, ended_at: DateTime<Utc>) -> Value {
        let mut object = match self.result.clone() {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = Map::new();
                map.insert("result".into(), other);
                map
            }
            None => Map::new(),
        };
        object.insert("experimentUri".into(), json!(self.experiment_uri));
        object.insert("experimentId".into(), json!(self.config.id));
        object.insert("benchmark".into(), json!(self.config.benchmark));
        object.insert("system".into(), json!(self.config.system));
        if let Some(challenge) = &self.config.challenge {
            object.insert("challenge".into(), json!(challenge));
        }
        if let Some(task) = &self.config.challenge_task {
            object.insert("challengeTask".into(), json!(task));
        }
        object.insert("startTime".into(), json!(self.started_at.to_rfc3339()));
        object.insert("endTime".into(), json!(ended_at.to_rfc3339()));
        object.insert(
            "errors".into(),
            Value::Array(self.errors.iter().map(|code| json!(code.name())).collect()),
        );
        Value::Object(object)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Note when the abort watchdog will fire.
    pub fn set_abortion_deadline(&mut self, armed_at: DateTime<Utc>, after: Duration) {
        let after = chrono::Duration::from_std(after)
            .unwrap_or_else(|_| chrono::Duration::weeks(52 * 100));
        self.abortion_deadline = armed_at.checked_add_signed(after);
    }

    pub fn abortion_deadline(&self) -> Option<DateTime<Utc>> {
        self.abortion_deadline
    }

    pub fn volume(&self) -> Option<&str> {
        self.volume.as_deref()
    }

    pub fn set_volume(&mut self, volume: String) {
        self.volume = Some(volume);
    }

    pub fn snapshot(&self) -> RecordSnapshot {
        RecordSnapshot {
            token: self.token,
            config: self.config.clone(),
            experiment_uri: self.experiment_uri.clone(),
            state: self.state,
            errors: self.errors.to_vec(),
            started_at: self.started_at,
            abortion_deadline: self.abortion_deadline,
        }
    }
}

/// Immutable copy of a record published for lock-free status reads.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordSnapshot {
    pub token: RecordToken,
    pub config: ExperimentConfig,
    pub experiment_uri: String,
    pub state: ExperimentState,
    pub errors: Vec<ErrorCode>,
    pub started_at: DateTime<Utc>,
    pub abortion_deadline: Option<DateTime<Utc>>,
}
