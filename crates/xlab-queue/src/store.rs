//! ---
//! xlab_section: "02-experiment-queue"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Two-lane experiment queue and its storage backends."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use xlab_common::ExperimentId;

use crate::lane::{Lane, QueueEntry};
use crate::Result;

/// Storage contract backing the experiment queue.
///
/// Implementations synchronise internally: every call is atomic with respect
/// to a single lane, and entries of a lane are ordered by `(score, insertion)`.
/// Replacing an entry keeps its original insertion position among equal scores.
pub trait QueueStore: Send + Sync {
    /// Insert or replace the entry stored under the configuration id.
    fn put(&self, lane: Lane, entry: QueueEntry) -> Result<()>;

    /// Delete an entry; returns whether the lane held it.
    fn delete(&self, lane: Lane, id: &ExperimentId) -> Result<bool>;

    /// Fetch a single entry.
    fn get(&self, lane: Lane, id: &ExperimentId) -> Result<Option<QueueEntry>>;

    /// Lowest-ordered entry whose score does not exceed `max_score`.
    fn earliest(&self, lane: Lane, max_score: i64) -> Result<Option<QueueEntry>>;

    /// All entries of a lane in serving order.
    fn entries(&self, lane: Lane) -> Result<Vec<QueueEntry>>;
}

/// Ordered in-memory table for one lane.
#[derive(Debug, Default)]
pub(crate) struct LaneTable {
    entries: HashMap<ExperimentId, (QueueEntry, u64)>,
    order: BTreeSet<(i64, u64, ExperimentId)>,
    next_seq: u64,
}

impl LaneTable {
    pub(crate) fn put(&mut self, entry: QueueEntry) {
        let id = entry.config.id.clone();
        let seq = match self.entries.remove(&id) {
            Some((previous, seq)) => {
                self.order.remove(&(previous.score, seq, id.clone()));
                seq
            }
            None => {
                self.next_seq += 1;
                self.next_seq
            }
        };
        self.order.insert((entry.score, seq, id.clone()));
        self.entries.insert(id, (entry, seq));
    }

    pub(crate) fn delete(&mut self, id: &ExperimentId) -> bool {
        match self.entries.remove(id) {
            Some((entry, seq)) => {
                self.order.remove(&(entry.score, seq, id.clone()));
                true
            }
            None => false,
        }
    }

    pub(crate) fn get(&self, id: &ExperimentId) -> Option<QueueEntry> {
        self.entries.get(id).map(|(entry, _)| entry.clone())
    }

    pub(crate) fn earliest(&self, max_score: i64) -> Option<QueueEntry> {
        let (score, _, id) = self.order.iter().next()?;
        if *score > max_score {
            return None;
        }
        self.get(id)
    }

    pub(crate) fn entries(&self) -> Vec<QueueEntry> {
        self.order
            .iter()
            .filter_map(|(_, _, id)| self.get(id))
            .collect()
    }
}

/// Both lanes of a store.
#[derive(Debug, Default)]
pub(crate) struct Lanes {
    adhoc: LaneTable,
    scheduled: LaneTable,
}

impl Lanes {
    pub(crate) fn lane(&self, lane: Lane) -> &LaneTable {
        match lane {
            Lane::AdHoc => &self.adhoc,
            Lane::Scheduled => &self.scheduled,
        }
    }

    pub(crate) fn lane_mut(&mut self, lane: Lane) -> &mut LaneTable {
        match lane {
            Lane::AdHoc => &mut self.adhoc,
            Lane::Scheduled => &mut self.scheduled,
        }
    }
}

/// Process-local store; contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryQueueStore {
    lanes: Mutex<Lanes>,
}

impl MemoryQueueStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn put(&self, lane: Lane, entry: QueueEntry) -> Result<()> {
        self.lanes.lock().lane_mut(lane).put(entry);
        Ok(())
    }

    fn delete(&self, lane: Lane, id: &ExperimentId) -> Result<bool> {
        Ok(self.lanes.lock().lane_mut(lane).delete(id))
    }

    fn get(&self, lane: Lane, id: &ExperimentId) -> Result<Option<QueueEntry>> {
        Ok(self.lanes.lock().lane(lane).get(id))
    }

    fn earliest(&self, lane: Lane, max_score: i64) -> Result<Option<QueueEntry>> {
        Ok(self.lanes.lock().lane(lane).earliest(max_score))
    }

    fn entries(&self, lane: Lane) -> Result<Vec<QueueEntry>> {
        Ok(self.lanes.lock().lane(lane).entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use xlab_common::ExperimentConfig;

    fn entry(id: &str, score: i64) -> QueueEntry {
        QueueEntry {
            config: ExperimentConfig::new(id, "bench", "sys", json!({})),
            score,
        }
    }

    #[test]
    fn equal_scores_keep_insertion_order() {
        let store = MemoryQueueStore::new();
        store.put(Lane::AdHoc, entry("b", 0)).unwrap();
        store.put(Lane::AdHoc, entry("a", 0)).unwrap();
        store.put(Lane::AdHoc, entry("c", 0)).unwrap();
        let ids: Vec<_> = store
            .entries(Lane::AdHoc)
            .unwrap()
            .into_iter()
            .map(|e| e.config.id.to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn replace_keeps_position_and_updates_score() {
        let store = MemoryQueueStore::new();
        store.put(Lane::Scheduled, entry("x", 0)).unwrap();
        store.put(Lane::Scheduled, entry("y", 50)).unwrap();
        store.put(Lane::Scheduled, entry("x", 50)).unwrap();
        let ids: Vec<_> = store
            .entries(Lane::Scheduled)
            .unwrap()
            .into_iter()
            .map(|e| (e.config.id.to_string(), e.score))
            .collect();
        assert_eq!(ids, vec![("x".to_string(), 50), ("y".to_string(), 50)]);
    }

    #[test]
    fn earliest_respects_score_bound() {
        let store = MemoryQueueStore::new();
        store.put(Lane::Scheduled, entry("late", 1_000)).unwrap();
        assert!(store.earliest(Lane::Scheduled, 999).unwrap().is_none());
        let found = store.earliest(Lane::Scheduled, 1_000).unwrap().unwrap();
        assert_eq!(found.config.id.as_str(), "late");
    }

    #[test]
    fn delete_is_lane_scoped() {
        let store = MemoryQueueStore::new();
        store.put(Lane::AdHoc, entry("1", 0)).unwrap();
        assert!(!store.delete(Lane::Scheduled, &"1".into()).unwrap());
        assert!(store.delete(Lane::AdHoc, &"1".into()).unwrap());
        assert!(!store.delete(Lane::AdHoc, &"1".into()).unwrap());
    }
}
