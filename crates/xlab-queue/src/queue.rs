//! ---
//! xlab_section: "02-experiment-queue"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Two-lane experiment queue and its storage backends."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use strum::IntoEnumIterator;
use tracing::{debug, info};
use xlab_common::{
    epoch_millis, ExperimentConfig, ExperimentId, ExperimentIdGenerator, QueueBackend,
    QueueConfig,
};

use crate::journal::JournalQueueStore;
use crate::lane::{Lane, QueueEntry};
use crate::store::{MemoryQueueStore, QueueStore};
use crate::Result;

/// Challenge attributes of a submission destined for the scheduled lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeSchedule {
    /// Challenge the task belongs to.
    pub challenge: String,
    /// Task within the challenge.
    pub task: String,
    /// Earliest start; `None` means as soon as possible.
    pub execution_date: Option<DateTime<Utc>>,
}

/// Priority-aware queue of pending experiment configurations.
///
/// Scheduled challenge tasks preempt ad-hoc submissions as soon as their
/// execution date has passed. The queue holds configurations only; runtime
/// state of an admitted experiment lives with the controller.
#[derive(Clone)]
pub struct ExperimentQueue {
    store: Arc<dyn QueueStore>,
    ids: Arc<ExperimentIdGenerator>,
}

impl std::fmt::Debug for ExperimentQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExperimentQueue").finish_non_exhaustive()
    }
}

impl ExperimentQueue {
    /// Wrap an existing store.
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            ids: Arc::new(ExperimentIdGenerator::new()),
        }
    }

    /// Queue backed by a process-local store.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryQueueStore::new()))
    }

    /// Build the queue selected by the `[queue]` configuration section.
    pub fn from_config(config: &QueueConfig) -> Result<Self> {
        let store: Arc<dyn QueueStore> = match config.backend {
            QueueBackend::Memory => Arc::new(MemoryQueueStore::new()),
            QueueBackend::Journal => Arc::new(JournalQueueStore::open(&config.path)?),
        };
        info!(backend = ?config.backend, "experiment queue ready");
        Ok(Self::new(store))
    }

    /// Enqueue a configuration into the lane its scheduling attributes select.
    ///
    /// Re-adding an id replaces the stored configuration. If the id moved to
    /// the other lane, the stale copy is removed.
    pub fn add(&self, config: ExperimentConfig) -> Result<()> {
        let lane = Lane::for_config(&config);
        let other = match lane {
            Lane::AdHoc => Lane::Scheduled,
            Lane::Scheduled => Lane::AdHoc,
        };
        self.store.delete(other, &config.id)?;
        let entry = QueueEntry::new(config);
        debug!(experiment_id = %entry.config.id, lane = %lane, score = entry.score, "enqueued experiment");
        self.store.put(lane, entry)
    }

    /// Enqueue a new experiment under a freshly issued id and return that id.
    pub fn submit(
        &self,
        benchmark: &str,
        system: &str,
        parameters: Value,
        schedule: Option<ChallengeSchedule>,
    ) -> Result<ExperimentId> {
        let id = self.ids.next_id();
        let mut config = ExperimentConfig::new(id.clone(), benchmark, system, parameters);
        if let Some(schedule) = schedule {
            config = config.with_challenge(schedule.challenge, schedule.task, schedule.execution_date);
        }
        info!(experiment_id = %id, benchmark, system, "adding experiment to the queue");
        self.add(config)?;
        Ok(id)
    }

    /// Select the configuration that should run next at `now`.
    ///
    /// An eligible scheduled entry always wins over ad-hoc work. A scheduled
    /// entry lacking an execution date is stamped with `now`, and the stamp is
    /// persisted before the entry is returned.
    pub fn next(&self, now: DateTime<Utc>) -> Result<Option<ExperimentConfig>> {
        let now_score = epoch_millis(now);
        let adhoc = self.store.earliest(Lane::AdHoc, now_score)?;
        let scheduled = self.store.earliest(Lane::Scheduled, now_score)?;

        if let Some(entry) = scheduled {
            match entry.config.execution_date {
                None => {
                    let mut config = entry.config;
                    config.execution_date = Some(now);
                    debug!(experiment_id = %config.id, "stamping scheduled experiment without execution date");
                    self.store.put(Lane::Scheduled, QueueEntry::new(config.clone()))?;
                    return Ok(Some(config));
                }
                Some(execution_date) if execution_date <= now => {
                    return Ok(Some(entry.config));
                }
                Some(_) => {}
            }
        }

        Ok(adhoc.map(|entry| entry.config))
    }

    /// Remove a configuration from whichever lane holds it. Idempotent.
    pub fn remove(&self, id: &ExperimentId) -> Result<bool> {
        let mut removed = false;
        for lane in Lane::iter() {
            removed |= self.store.delete(lane, id)?;
        }
        if removed {
            debug!(experiment_id = %id, "removed experiment from queue");
        }
        Ok(removed)
    }

    /// Look up a configuration by id in either lane.
    pub fn get(&self, id: &ExperimentId) -> Result<Option<ExperimentConfig>> {
        for lane in Lane::iter() {
            if let Some(entry) = self.store.get(lane, id)? {
                return Ok(Some(entry.config));
            }
        }
        Ok(None)
    }

    /// Every waiting configuration, scheduled lane first. For reporting only.
    pub fn list_all(&self) -> Result<Vec<ExperimentConfig>> {
        let mut all = Vec::new();
        for lane in [Lane::Scheduled, Lane::AdHoc] {
            all.extend(self.store.entries(lane)?.into_iter().map(|e| e.config));
        }
        Ok(all)
    }

    /// Number of waiting configurations across both lanes.
    pub fn len(&self) -> Result<usize> {
        let mut total = 0;
        for lane in Lane::iter() {
            total += self.store.entries(lane)?.len();
        }
        Ok(total)
    }

    /// True when neither lane holds a configuration.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn adhoc(id: &str) -> ExperimentConfig {
        ExperimentConfig::new(id, "urn:bench", "urn:sys", json!({}))
    }

    fn scheduled(id: &str, at: Option<DateTime<Utc>>) -> ExperimentConfig {
        adhoc(id).with_challenge("urn:challenge", format!("urn:task:{id}"), at)
    }

    #[test]
    fn empty_queue_yields_nothing() {
        let queue = ExperimentQueue::in_memory();
        assert!(queue.next(Utc::now()).unwrap().is_none());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn overdue_scheduled_entry_preempts_adhoc() {
        let queue = ExperimentQueue::in_memory();
        let now = Utc::now();
        queue.add(adhoc("a")).unwrap();
        queue
            .add(scheduled("s", Some(now - Duration::seconds(1))))
            .unwrap();
        assert_eq!(queue.next(now).unwrap().unwrap().id.as_str(), "s");
    }

    #[test]
    fn future_scheduled_entry_yields_to_adhoc() {
        let queue = ExperimentQueue::in_memory();
        let now = Utc::now();
        queue.add(adhoc("a")).unwrap();
        queue
            .add(scheduled("s", Some(now + Duration::hours(1))))
            .unwrap();
        assert_eq!(queue.next(now).unwrap().unwrap().id.as_str(), "a");
    }

    #[test]
    fn undated_scheduled_entry_is_stamped_and_served() {
        let queue = ExperimentQueue::in_memory();
        let now = Utc::now();
        queue.add(adhoc("a")).unwrap();
        queue.add(scheduled("s", None)).unwrap();

        let picked = queue.next(now).unwrap().unwrap();
        assert_eq!(picked.id.as_str(), "s");
        assert_eq!(picked.execution_date, Some(now));

        let stored = queue.get(&"s".into()).unwrap().unwrap();
        assert_eq!(stored.execution_date, Some(now));
        assert_eq!(queue.next(now).unwrap().unwrap().id.as_str(), "s");
    }

    #[test]
    fn adhoc_entries_serve_in_insertion_order() {
        let queue = ExperimentQueue::in_memory();
        queue.add(adhoc("first")).unwrap();
        queue.add(adhoc("second")).unwrap();
        assert_eq!(queue.next(Utc::now()).unwrap().unwrap().id.as_str(), "first");
        queue.remove(&"first".into()).unwrap();
        assert_eq!(queue.next(Utc::now()).unwrap().unwrap().id.as_str(), "second");
    }

    #[test]
    fn submit_issues_distinct_increasing_ids() {
        let queue = ExperimentQueue::in_memory();
        let first = queue
            .submit("urn:bench", "urn:sys", json!({"tasks": 1}), None)
            .unwrap();
        let second = queue
            .submit(
                "urn:bench",
                "urn:sys",
                json!({}),
                Some(ChallengeSchedule {
                    challenge: "urn:challenge".into(),
                    task: "urn:task:1".into(),
                    execution_date: None,
                }),
            )
            .unwrap();

        let first_ms: i64 = first.as_str().parse().unwrap();
        let second_ms: i64 = second.as_str().parse().unwrap();
        assert!(second_ms > first_ms);

        let stored = queue.get(&first).unwrap().unwrap();
        assert_eq!(stored.benchmark, "urn:bench");
        assert_eq!(stored.parameters, json!({"tasks": 1}));
        assert!(!stored.is_challenge());
        assert!(queue.get(&second).unwrap().unwrap().is_challenge_task());
        assert_eq!(queue.len().unwrap(), 2);
    }

    #[test]
    fn clones_share_the_id_sequence() {
        let queue = ExperimentQueue::in_memory();
        let other = queue.clone();
        let a = queue.submit("urn:bench", "urn:sys", json!({}), None).unwrap();
        let b = other.submit("urn:bench", "urn:sys", json!({}), None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn remove_is_idempotent() {
        let queue = ExperimentQueue::in_memory();
        queue.add(adhoc("a")).unwrap();
        assert!(queue.remove(&"a".into()).unwrap());
        assert!(!queue.remove(&"a".into()).unwrap());
        assert!(queue.get(&"a".into()).unwrap().is_none());
    }

    #[test]
    fn list_all_reports_scheduled_lane_first() {
        let queue = ExperimentQueue::in_memory();
        let now = Utc::now();
        queue.add(adhoc("a1")).unwrap();
        queue.add(scheduled("s1", Some(now))).unwrap();
        queue.add(adhoc("a2")).unwrap();
        let ids: Vec<_> = queue
            .list_all()
            .unwrap()
            .into_iter()
            .map(|c| c.id.to_string())
            .collect();
        assert_eq!(ids, vec!["s1", "a1", "a2"]);
        assert_eq!(queue.len().unwrap(), 3);
    }

    #[test]
    fn re_adding_with_new_lane_moves_the_entry() {
        let queue = ExperimentQueue::in_memory();
        queue.add(adhoc("x")).unwrap();
        queue.add(scheduled("x", None)).unwrap();
        assert_eq!(queue.len().unwrap(), 1);
        assert!(queue.get(&"x".into()).unwrap().unwrap().is_challenge_task());
    }
}
