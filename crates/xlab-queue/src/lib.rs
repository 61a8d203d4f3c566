//! ---
//! xlab_section: "02-experiment-queue"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Two-lane experiment queue and its storage backends."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Experiment queue for the XLab controller.
//!
//! Configurations wait in one of two lanes. Ad-hoc submissions are always
//! eligible; challenge tasks carry an execution date and preempt ad-hoc work
//! once that date has passed. Storage is pluggable through [`QueueStore`].

/// Result alias used throughout the queue crate.
pub type Result<T> = std::result::Result<T, QueueError>;

/// Error type for queue operations and their storage backends.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Wrapper for IO errors encountered while reading/writing the journal.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reported when a journal was written by an incompatible version.
    #[error("unsupported journal version {found} (expected {expected})")]
    UnsupportedVersion {
        /// Version found in the journal header.
        found: u16,
        /// Version this build writes.
        expected: u16,
    },
    /// Reported when the journal header does not match its creation timestamp.
    #[error("journal header hash mismatch")]
    HeaderMismatch,
}

pub mod journal;
pub mod lane;
pub mod queue;
pub mod store;

pub use journal::{JournalQueueStore, JOURNAL_VERSION};
pub use lane::{score_for, Lane, QueueEntry};
pub use queue::{ChallengeSchedule, ExperimentQueue};
pub use store::{MemoryQueueStore, QueueStore};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_error_display() {
        let err = QueueError::UnsupportedVersion {
            found: 9,
            expected: 1,
        };
        assert_eq!(
            format!("{err}"),
            "unsupported journal version 9 (expected 1)"
        );
    }
}
