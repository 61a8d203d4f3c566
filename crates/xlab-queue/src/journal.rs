//! ---
//! xlab_section: "02-experiment-queue"
//! xlab_subsection: "module"
//! xlab_type: "source"
//! xlab_scope: "code"
//! xlab_description: "Two-lane experiment queue and its storage backends."
//! xlab_version: "v0.0.0-prealpha"
//! xlab_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tracing::{debug, info, warn};
use xlab_common::ExperimentId;

use crate::lane::{Lane, QueueEntry};
use crate::store::{Lanes, QueueStore};
use crate::{QueueError, Result};

/// Format version written into the journal header.
pub const JOURNAL_VERSION: u16 = 1;

/// Journal header stored as the first line of the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalHeader {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
}

impl JournalHeader {
    fn new() -> Self {
        let created_at = Utc::now();
        Self {
            version: JOURNAL_VERSION,
            created_at,
            hash: header_hash(created_at),
        }
    }

    fn verify(&self) -> Result<()> {
        if self.version != JOURNAL_VERSION {
            return Err(QueueError::UnsupportedVersion {
                found: self.version,
                expected: JOURNAL_VERSION,
            });
        }
        if self.hash != header_hash(self.created_at) {
            return Err(QueueError::HeaderMismatch);
        }
        Ok(())
    }
}

fn header_hash(created_at: DateTime<Utc>) -> String {
    format!(
        "{:x}",
        sha2::Sha256::digest(created_at.to_rfc3339().as_bytes())
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalOp {
    Put { lane: Lane, entry: QueueEntry },
    Delete { lane: Lane, id: ExperimentId },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct JournalRecord {
    sequence: u64,
    timestamp: DateTime<Utc>,
    op: JournalOp,
}

struct JournalState {
    lanes: Lanes,
    writer: BufWriter<File>,
    next_sequence: u64,
}

impl JournalState {
    fn append(&mut self, op: JournalOp) -> Result<u64> {
        self.next_sequence += 1;
        let record = JournalRecord {
            sequence: self.next_sequence,
            timestamp: Utc::now(),
            op,
        };
        let line = serde_json::to_string(&record)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(record.sequence)
    }
}

/// Append-only JSON-lines store whose contents survive process restarts.
///
/// Every mutation is written and flushed before the in-memory view changes,
/// so a crash never leaves the view ahead of the file. Opening an existing
/// journal replays all records in sequence order.
pub struct JournalQueueStore {
    path: PathBuf,
    state: Mutex<JournalState>,
}

impl std::fmt::Debug for JournalQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JournalQueueStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl JournalQueueStore {
    /// Open a journal, creating it with a fresh header if missing or empty.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            let dropped = truncate_torn_tail(path)?;
            if dropped > 0 {
                warn!(path = %path.display(), bytes = dropped, "discarded unterminated journal tail");
            }
        }

        let fresh = !path.exists() || fs::metadata(path)?.len() == 0;
        let mut lanes = Lanes::default();
        let mut next_sequence = 0;
        if !fresh {
            let replayed = replay(path, |record| {
                next_sequence = record.sequence;
                apply(&mut lanes, record.op);
            })?;
            info!(path = %path.display(), records = replayed, "replayed queue journal");
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::new(file);
        if fresh {
            write_header(&mut writer)?;
            debug!(path = %path.display(), "created queue journal");
        }

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(JournalState {
                lanes,
                writer,
                next_sequence,
            }),
        })
    }

    /// Location of the journal on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrite the journal so it holds one put per live entry.
    pub fn compact(&self) -> Result<()> {
        let mut state = self.state.lock();
        let tmp_path = self.path.with_extension("compact");
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        write_header(&mut writer)?;

        let mut sequence = 0u64;
        for lane in [Lane::Scheduled, Lane::AdHoc] {
            for entry in state.lanes.lane(lane).entries() {
                sequence += 1;
                let record = JournalRecord {
                    sequence,
                    timestamp: Utc::now(),
                    op: JournalOp::Put { lane, entry },
                };
                writer.write_all(serde_json::to_string(&record)?.as_bytes())?;
                writer.write_all(b"\n")?;
            }
        }
        writer.flush()?;
        drop(writer);
        fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().append(true).open(&self.path)?;
        state.writer = BufWriter::new(file);
        state.next_sequence = sequence;
        info!(path = %self.path.display(), records = sequence, "compacted queue journal");
        Ok(())
    }
}

impl QueueStore for JournalQueueStore {
    fn put(&self, lane: Lane, entry: QueueEntry) -> Result<()> {
        let mut state = self.state.lock();
        state.append(JournalOp::Put {
            lane,
            entry: entry.clone(),
        })?;
        state.lanes.lane_mut(lane).put(entry);
        Ok(())
    }

    fn delete(&self, lane: Lane, id: &ExperimentId) -> Result<bool> {
        let mut state = self.state.lock();
        if state.lanes.lane(lane).get(id).is_none() {
            return Ok(false);
        }
        state.append(JournalOp::Delete {
            lane,
            id: id.clone(),
        })?;
        Ok(state.lanes.lane_mut(lane).delete(id))
    }

    fn get(&self, lane: Lane, id: &ExperimentId) -> Result<Option<QueueEntry>> {
        Ok(self.state.lock().lanes.lane(lane).get(id))
    }

    fn earliest(&self, lane: Lane, max_score: i64) -> Result<Option<QueueEntry>> {
        Ok(self.state.lock().lanes.lane(lane).earliest(max_score))
    }

    fn entries(&self, lane: Lane) -> Result<Vec<QueueEntry>> {
        Ok(self.state.lock().lanes.lane(lane).entries())
    }
}

fn write_header(writer: &mut BufWriter<File>) -> Result<()> {
    let line = serde_json::to_string(&JournalHeader::new())?;
    writer.write_all(line.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Cut the file back to its last newline so the next append starts a fresh line.
///
/// A record only counts as written once its terminating newline is on disk, so
/// an unterminated tail is an interrupted append and is dropped even if it
/// happens to parse. Returns the number of bytes removed.
fn truncate_torn_tail(path: &Path) -> Result<u64> {
    let contents = fs::read(path)?;
    if contents.last().map_or(true, |byte| *byte == b'\n') {
        return Ok(0);
    }
    let keep = contents
        .iter()
        .rposition(|byte| *byte == b'\n')
        .map_or(0, |index| index + 1);
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()?;
    Ok((contents.len() - keep) as u64)
}

fn apply(lanes: &mut Lanes, op: JournalOp) {
    match op {
        JournalOp::Put { lane, entry } => lanes.lane_mut(lane).put(entry),
        JournalOp::Delete { lane, id } => {
            lanes.lane_mut(lane).delete(&id);
        }
    }
}

fn replay<F>(path: &Path, mut handler: F) -> Result<usize>
where
    F: FnMut(JournalRecord),
{
    let file = File::open(path)?;
    let mut lines = BufReader::new(file).lines();
    if let Some(first) = lines.next() {
        let header: JournalHeader = serde_json::from_str(&first?)?;
        header.verify()?;
    }

    let mut count = 0usize;
    let mut last_sequence = 0u64;
    for line in lines {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record: JournalRecord = match serde_json::from_str(&line) {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, after_sequence = last_sequence, "skipping unreadable journal line");
                continue;
            }
        };
        last_sequence = record.sequence;
        handler(record);
        count += 1;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;
    use xlab_common::ExperimentConfig;

    fn entry(id: &str, score: i64) -> QueueEntry {
        QueueEntry {
            config: ExperimentConfig::new(id, "bench", "sys", json!({"k": id})),
            score,
        }
    }

    #[test]
    fn writes_header_on_creation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("queue.journal");
        let _store = JournalQueueStore::open(&path).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        let header: JournalHeader =
            serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(header.version, JOURNAL_VERSION);
        header.verify().unwrap();
    }

    #[test]
    fn replays_puts_and_deletes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.journal");
        {
            let store = JournalQueueStore::open(&path).unwrap();
            store.put(Lane::AdHoc, entry("a", 0)).unwrap();
            store.put(Lane::AdHoc, entry("b", 0)).unwrap();
            store.put(Lane::Scheduled, entry("s", 10)).unwrap();
            assert!(store.delete(Lane::AdHoc, &"a".into()).unwrap());
            assert!(!store.delete(Lane::AdHoc, &"a".into()).unwrap());
        }

        let reopened = JournalQueueStore::open(&path).unwrap();
        let adhoc = reopened.entries(Lane::AdHoc).unwrap();
        assert_eq!(adhoc.len(), 1);
        assert_eq!(adhoc[0].config.id.as_str(), "b");
        assert_eq!(
            reopened.get(Lane::Scheduled, &"s".into()).unwrap(),
            Some(entry("s", 10))
        );

        reopened.put(Lane::AdHoc, entry("c", 0)).unwrap();
        assert_eq!(reopened.state.lock().next_sequence, 5);
    }

    #[test]
    fn compaction_preserves_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.journal");
        let store = JournalQueueStore::open(&path).unwrap();
        for id in ["1", "2", "3"] {
            store.put(Lane::AdHoc, entry(id, 0)).unwrap();
        }
        store.delete(Lane::AdHoc, &"2".into()).unwrap();
        store.compact().unwrap();
        store.put(Lane::AdHoc, entry("4", 0)).unwrap();
        drop(store);

        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 4);

        let reopened = JournalQueueStore::open(&path).unwrap();
        let ids: Vec<_> = reopened
            .entries(Lane::AdHoc)
            .unwrap()
            .into_iter()
            .map(|e| e.config.id.to_string())
            .collect();
        assert_eq!(ids, vec!["1", "3", "4"]);
    }

    #[test]
    fn appends_after_torn_tail_survive_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.journal");
        {
            let store = JournalQueueStore::open(&path).unwrap();
            store.put(Lane::AdHoc, entry("a", 0)).unwrap();
        }
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"sequence":2,"timestamp":"2024-"#).unwrap();
        drop(file);

        {
            let store = JournalQueueStore::open(&path).unwrap();
            assert_eq!(store.entries(Lane::AdHoc).unwrap().len(), 1);
            store.put(Lane::AdHoc, entry("b", 0)).unwrap();
        }
        assert!(fs::read_to_string(&path).unwrap().ends_with('\n'));

        let reopened = JournalQueueStore::open(&path).unwrap();
        let ids: Vec<_> = reopened
            .entries(Lane::AdHoc)
            .unwrap()
            .into_iter()
            .map(|e| e.config.id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(reopened.state.lock().next_sequence, 2);
    }

    #[test]
    fn torn_header_restarts_the_journal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.journal");
        fs::write(&path, br#"{"version":1,"crea"#).unwrap();

        let store = JournalQueueStore::open(&path).unwrap();
        store.put(Lane::AdHoc, entry("a", 0)).unwrap();
        drop(store);

        let reopened = JournalQueueStore::open(&path).unwrap();
        assert_eq!(reopened.entries(Lane::AdHoc).unwrap().len(), 1);
    }

    #[test]
    fn rejects_foreign_version() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.journal");
        let created_at = Utc::now();
        let header = JournalHeader {
            version: 99,
            created_at,
            hash: header_hash(created_at),
        };
        fs::write(&path, format!("{}\n", serde_json::to_string(&header).unwrap())).unwrap();
        let err = JournalQueueStore::open(&path).unwrap_err();
        assert!(matches!(err, QueueError::UnsupportedVersion { found: 99, .. }));
    }
}
