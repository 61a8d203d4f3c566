//! ---
//! xlab_section: "01-core-functionality"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Shared primitives and utilities for the controller runtime."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::experiment::ExperimentId;

/// Milliseconds since the unix epoch.
pub fn epoch_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Issues strictly increasing, timestamp-derived experiment ids.
#[derive(Debug, Default)]
pub struct ExperimentIdGenerator {
    last: Mutex<i64>,
}

impl ExperimentIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> ExperimentId {
        self.next_at(Utc::now())
    }

    /// Id for the given wall-clock instant, bumped past the last issued id.
    pub fn next_at(&self, now: DateTime<Utc>) -> ExperimentId {
        let mut last = self.last.lock();
        let mut candidate = epoch_millis(now);
        if candidate <= *last {
            candidate = *last + 1;
        }
        *last = candidate;
        ExperimentId::new(candidate.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_strictly_increasing_for_identical_clock_reads() {
        let generator = ExperimentIdGenerator::new();
        let now = Utc::now();
        let first: i64 = generator.next_at(now).as_str().parse().unwrap();
        let second: i64 = generator.next_at(now).as_str().parse().unwrap();
        let third: i64 = generator
            .next_at(now - chrono::Duration::seconds(5))
            .as_str()
            .parse()
            .unwrap();
        assert_eq!(first, epoch_millis(now));
        assert_eq!(second, first + 1);
        assert_eq!(third, second + 1);
    }
}
