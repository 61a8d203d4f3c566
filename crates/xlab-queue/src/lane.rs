//! ---
//! xlab_section: "02-experiment-queue"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Two-lane experiment queue and its storage backends."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter};
use xlab_common::{epoch_millis, ExperimentConfig};

/// Partition of the queue a configuration waits in.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Lane {
    /// One-off user submissions without a fixed schedule.
    AdHoc,
    /// Challenge tasks carrying an execution date.
    Scheduled,
}

impl Lane {
    /// Lane a configuration is routed to.
    pub fn for_config(config: &ExperimentConfig) -> Self {
        if config.is_challenge_task() {
            Lane::Scheduled
        } else {
            Lane::AdHoc
        }
    }
}

/// Score of a configuration: its execution date in epoch millis, or zero.
pub fn score_for(config: &ExperimentConfig) -> i64 {
    config.execution_date.map(epoch_millis).unwrap_or(0)
}

/// A configuration together with the score it is ordered by.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Stored configuration.
    pub config: ExperimentConfig,
    /// Ordering key; lower scores are served first.
    pub score: i64,
}

impl QueueEntry {
    /// Build an entry scored from the configuration's execution date.
    pub fn new(config: ExperimentConfig) -> Self {
        let score = score_for(&config);
        Self { config, score }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[test]
    fn routes_only_complete_challenge_tasks_to_scheduled_lane() {
        let adhoc = ExperimentConfig::new("1", "b", "s", json!({}));
        assert_eq!(Lane::for_config(&adhoc), Lane::AdHoc);

        let mut half = adhoc.clone();
        half.challenge = Some("c".into());
        assert_eq!(Lane::for_config(&half), Lane::AdHoc);

        let task = adhoc.with_challenge("c", "t", None);
        assert_eq!(Lane::for_config(&task), Lane::Scheduled);
    }

    #[test]
    fn score_is_execution_date_or_zero() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let dated = ExperimentConfig::new("1", "b", "s", json!({})).with_execution_date(at);
        assert_eq!(QueueEntry::new(dated).score, at.timestamp_millis());

        let undated = ExperimentConfig::new("2", "b", "s", json!({}));
        assert_eq!(QueueEntry::new(undated).score, 0);
    }

    #[test]
    fn lane_labels() {
        assert_eq!(Lane::AdHoc.to_string(), "ad_hoc");
        assert_eq!(Lane::Scheduled.as_ref(), "scheduled");
    }
}
