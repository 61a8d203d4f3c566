//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Shared primitives and utilities for the controller runtime."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Unique identifier of a queued experiment configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(String);

impl ExperimentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExperimentId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Workload configuration waiting in (or admitted from) the experiment queue.
///
/// A configuration is never mutated once enqueued. The queue may persist a
/// stamped copy (see `ExperimentQueue::next`) but the controller only ever
/// reads the value it was handed at admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub id: ExperimentId,
    pub benchmark: String,
    pub system: String,
    /// Opaque benchmark parameter payload supplied by the submitter.
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub challenge_task: Option<String>,
    #[serde(default)]
    pub execution_date: Option<DateTime<Utc>>,
}

impl ExperimentConfig {
    pub fn new(
        id: impl Into<ExperimentId>,
        benchmark: impl Into<String>,
        system: impl Into<String>,
        parameters: Value,
    ) -> Self {
        Self {
            id: id.into(),
            benchmark: benchmark.into(),
            system: system.into(),
            parameters,
            user_name: None,
            challenge: None,
            challenge_task: None,
            execution_date: None,
        }
    }

    pub fn with_user(mut self, user_name: impl Into<String>) -> Self {
        self.user_name = Some(user_name.into());
        self
    }

    /// Attach challenge scheduling attributes.
    pub fn with_challenge(
        mut self,
        challenge: impl Into<String>,
        task: impl Into<String>,
        execution_date: Option<DateTime<Utc>>,
    ) -> Self {
        self.challenge = Some(challenge.into());
        self.challenge_task = Some(task.into());
        self.execution_date = execution_date;
        self
    }

    pub fn with_execution_date(mut self, execution_date: DateTime<Utc>) -> Self {
        self.execution_date = Some(execution_date);
        self
    }

    /// True when the experiment belongs to a challenge at all.
    pub fn is_challenge(&self) -> bool {
        self.challenge.is_some()
    }

    /// True when both challenge and task references are set, which routes the
    /// configuration into the scheduled lane.
    pub fn is_challenge_task(&self) -> bool {
        self.challenge.is_some() && self.challenge_task.is_some()
    }
}

impl From<String> for ExperimentId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn challenge_task_requires_both_references() {
        let mut config = ExperimentConfig::new("1", "bench", "sys", json!({}));
        assert!(!config.is_challenge_task());
        config.challenge = Some("challenge".into());
        assert!(config.is_challenge());
        assert!(!config.is_challenge_task());
        config.challenge_task = Some("task".into());
        assert!(config.is_challenge_task());
    }

    #[test]
    fn deserializes_with_missing_optional_fields() {
        let config: ExperimentConfig = serde_json::from_value(json!({
            "id": "42",
            "benchmark": "urn:bench",
            "system": "urn:sys",
        }))
        .unwrap();
        assert_eq!(config.id.as_str(), "42");
        assert!(config.parameters.is_null());
        assert!(config.execution_date.is_none());
    }
}
