//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Status report of the running experiment and the queue."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use serde::Serialize;
use xlab_common::{ExperimentConfig, ExperimentId};

use crate::record::{ErrorCode, RecordSnapshot};

/// Report returned by `ExperimentController::status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub current: Option<RunningExperiment>,
    pub queue: Vec<QueuedExperiment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningExperiment {
    pub experiment_id: ExperimentId,
    pub benchmark: String,
    pub system: String,
    pub challenge: Option<String>,
    pub challenge_task: Option<String>,
    pub execution_date: Option<DateTime<Utc>>,
    pub start_time: DateTime<Utc>,
    pub abortion_time: Option<DateTime<Utc>>,
    pub state: String,
    pub errors: Vec<ErrorCode>,
    /// True when the caller submitted the experiment.
    pub cancelable_by_caller: bool,
}

impl RunningExperiment {
    pub fn from_snapshot(snapshot: &RecordSnapshot, caller: Option<&str>) -> Self {
        let config = &snapshot.config;
        let cancelable_by_caller = matches!(
            (caller, config.user_name.as_deref()),
            (Some(caller), Some(owner)) if caller == owner
        );
        Self {
            experiment_id: config.id.clone(),
            benchmark: config.benchmark.clone(),
            system: config.system.clone(),
            challenge: config.challenge.clone(),
            challenge_task: config.challenge_task.clone(),
            execution_date: config.execution_date,
            start_time: snapshot.started_at,
            abortion_time: snapshot.abortion_deadline,
            state: snapshot.state.label().to_owned(),
            errors: snapshot.errors.clone(),
            cancelable_by_caller,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedExperiment {
    pub experiment_id: ExperimentId,
    pub benchmark: String,
    pub system: String,
    pub user_name: Option<String>,
    pub execution_date: Option<DateTime<Utc>>,
}

impl From<ExperimentConfig> for QueuedExperiment {
    fn from(config: ExperimentConfig) -> Self {
        Self {
            experiment_id: config.id,
            benchmark: config.benchmark,
            system: config.system,
            user_name: config.user_name,
            execution_date: config.execution_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ExperimentRecord, ExperimentState, RecordToken};
    use serde_json::json;

    fn snapshot(user: Option<&str>) -> RecordSnapshot {
        let mut config = ExperimentConfig::new("5", "urn:bench", "urn:sys", json!({}));
        config.user_name = user.map(str::to_owned);
        let mut record =
            ExperimentRecord::new(RecordToken(3), config, "urn:xlab:experiment:5".into(), Utc::now());
        record.set_state(ExperimentState::Started);
        record.snapshot()
    }

    #[test]
    fn only_the_submitter_may_cancel() {
        let owned = snapshot(Some("alice"));
        assert!(RunningExperiment::from_snapshot(&owned, Some("alice")).cancelable_by_caller);
        assert!(!RunningExperiment::from_snapshot(&owned, Some("bob")).cancelable_by_caller);
        assert!(!RunningExperiment::from_snapshot(&owned, None).cancelable_by_caller);
        let anonymous = snapshot(None);
        assert!(!RunningExperiment::from_snapshot(&anonymous, None).cancelable_by_caller);
    }

    #[test]
    fn serializes_human_readable_state() {
        let running = RunningExperiment::from_snapshot(&snapshot(None), None);
        let value = serde_json::to_value(&running).unwrap();
        assert_eq!(value["state"], json!("Started"));
        assert_eq!(value["experimentId"], json!("5"));
        assert_eq!(value["cancelableByCaller"], json!(false));
    }
}
