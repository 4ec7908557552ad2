//! Durable, crash-safe checkpoints for paginated collection runs.
//!
//! Each run gets two files under the checkpoint directory:
//! `{run_id}.json` (the checkpoint, written atomically via tmp + rename) and
//! `{run_id}.rows.jsonl` (the row spool, appended after every page). The
//! spool is what lets a resumed run reproduce an uninterrupted run exactly:
//! rows beyond what the checkpoint recorded belong to a page whose fetch was
//! not yet durable and are discarded on resume.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{self, Write as _};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::table::RankingRecord;

/// Where the paginated cursor stood when the checkpoint was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorState {
    /// Total item count the source reported at run start.
    pub total_items: u64,
    pub per_page: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionCheckpoint {
    pub run_id: String,
    pub last_completed_page: u32,
    pub cursor_state: CursorState,
    pub accumulated_row_count: u64,
    pub timestamp: DateTime<Utc>,
}

impl CollectionCheckpoint {
    /// A resumed cursor must still be reachable against the live source.
    /// Resuming from an inconsistent state would silently corrupt the table,
    /// so any mismatch is fatal.
    pub fn validate_cursor(&self, current_total: u64, per_page: u32) -> Result<(), CheckpointError> {
        if per_page != self.cursor_state.per_page {
            return Err(CheckpointError::Inconsistent {
                run_id: self.run_id.clone(),
                reason: format!(
                    "page size changed: checkpoint has {}, source now {}",
                    self.cursor_state.per_page, per_page
                ),
            });
        }
        if current_total < self.accumulated_row_count {
            return Err(CheckpointError::Inconsistent {
                run_id: self.run_id.clone(),
                reason: format!(
                    "source total shrank below collected rows: {} < {}",
                    current_total, self.accumulated_row_count
                ),
            });
        }
        Ok(())
    }
}

#[derive(Debug)]
pub enum CheckpointError {
    Io { path: PathBuf, source: io::Error },
    Corrupt { path: PathBuf, reason: String },
    Inconsistent { run_id: String, reason: String },
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "checkpoint io error at {}: {}", path.display(), source)
            }
            Self::Corrupt { path, reason } => {
                write!(f, "checkpoint corrupt at {}: {}", path.display(), reason)
            }
            Self::Inconsistent { run_id, reason } => {
                write!(f, "checkpoint for run '{}' inconsistent with source: {}", run_id, reason)
            }
        }
    }
}

impl std::error::Error for CheckpointError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Filesystem-backed checkpoint persistence. Writes are serialized behind a
/// single-writer lock; concurrent writers to one run's checkpoint would race.
pub struct CheckpointStore {
    dir: PathBuf,
    write_guard: Mutex<()>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| CheckpointError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self {
            dir,
            write_guard: Mutex::new(()),
        })
    }

    fn checkpoint_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.json"))
    }

    fn spool_path(&self, run_id: &str) -> PathBuf {
        self.dir.join(format!("{run_id}.rows.jsonl"))
    }

    /// Atomic save: write to a temporary path, then rename over the previous
    /// checkpoint. A crash mid-write cannot clobber the last known-good state.
    pub fn save(&self, checkpoint: &CollectionCheckpoint) -> Result<(), CheckpointError> {
        let _guard = self.write_guard.lock();
        let path = self.checkpoint_path(&checkpoint.run_id);
        let tmp = self.dir.join(format!("{}.json.tmp", checkpoint.run_id));

        let body = serde_json::to_vec_pretty(checkpoint).map_err(|e| CheckpointError::Corrupt {
            path: tmp.clone(),
            reason: format!("serialize failed: {e}"),
        })?;
        fs::write(&tmp, &body).map_err(|source| CheckpointError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &path).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;

        debug!(
            run_id = %checkpoint.run_id,
            page = checkpoint.last_completed_page,
            rows = checkpoint.accumulated_row_count,
            "checkpoint saved"
        );
        Ok(())
    }

    /// `Ok(None)` means no checkpoint exists and the run starts fresh. A file
    /// that exists but cannot be read back is `Corrupt`, never a silent
    /// fresh start.
    pub fn load(&self, run_id: &str) -> Result<Option<CollectionCheckpoint>, CheckpointError> {
        let path = self.checkpoint_path(run_id);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        let checkpoint: CollectionCheckpoint =
            serde_json::from_slice(&body).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                reason: format!("invalid JSON: {e}"),
            })?;
        if checkpoint.run_id != run_id {
            return Err(CheckpointError::Corrupt {
                path,
                reason: format!("run_id mismatch: file says '{}'", checkpoint.run_id),
            });
        }
        Ok(Some(checkpoint))
    }

    /// Append one page of rows to the run's spool. Called before the
    /// checkpoint save that makes those rows authoritative.
    pub fn append_rows(&self, run_id: &str, rows: &[RankingRecord]) -> Result<(), CheckpointError> {
        let _guard = self.write_guard.lock();
        let path = self.spool_path(run_id);
        let mut buf = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buf, row).map_err(|e| CheckpointError::Corrupt {
                path: path.clone(),
                reason: format!("serialize failed: {e}"),
            })?;
            buf.push(b'\n');
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| CheckpointError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(&buf).map_err(|source| CheckpointError::Io {
            path: path.clone(),
            source,
        })?;
        file.sync_data().map_err(|source| CheckpointError::Io { path, source })?;
        Ok(())
    }

    /// Reload spooled rows, truncated to what the checkpoint recorded.
    ///
    /// Rows past `expected` belong to a page fetched but never checkpointed;
    /// they are dropped here and that page is re-fetched on resume (the
    /// at-most-one re-fetch guarantee). Fewer rows than expected means the
    /// spool and checkpoint disagree, which is fatal.
    pub fn load_rows(&self, run_id: &str, expected: u64) -> Result<Vec<RankingRecord>, CheckpointError> {
        let path = self.spool_path(run_id);
        let body = match fs::read_to_string(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if expected == 0 {
                    return Ok(Vec::new());
                }
                return Err(CheckpointError::Inconsistent {
                    run_id: run_id.to_string(),
                    reason: format!("spool missing but checkpoint claims {expected} rows"),
                });
            }
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };

        let mut rows = Vec::with_capacity(expected as usize);
        for line in body.lines() {
            if rows.len() as u64 >= expected {
                break;
            }
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let row: RankingRecord =
                serde_json::from_str(line).map_err(|e| CheckpointError::Corrupt {
                    path: path.clone(),
                    reason: format!("invalid spool line {}: {e}", rows.len() + 1),
                })?;
            rows.push(row);
        }
        if (rows.len() as u64) < expected {
            return Err(CheckpointError::Inconsistent {
                run_id: run_id.to_string(),
                reason: format!("spool has {} rows, checkpoint claims {}", rows.len(), expected),
            });
        }
        Ok(rows)
    }

    /// Remove checkpoint and spool after a successful run.
    pub fn retire(&self, run_id: &str) -> Result<(), CheckpointError> {
        let _guard = self.write_guard.lock();
        for path in [self.checkpoint_path(run_id), self.spool_path(run_id)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(CheckpointError::Io { path, source }),
            }
        }
        info!(run_id, "checkpoint retired");
        Ok(())
    }

    /// Run ids with an outstanding checkpoint, sorted.
    pub fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| CheckpointError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let mut run_ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CheckpointError::Io {
                path: self.dir.clone(),
                source,
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(run_id) = name.strip_suffix(".json") {
                run_ids.push(run_id.to_string());
            }
        }
        run_ids.sort();
        Ok(run_ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::QualityTier;
    use chrono::NaiveDate;

    fn checkpoint(run_id: &str, page: u32, rows: u64) -> CollectionCheckpoint {
        CollectionCheckpoint {
            run_id: run_id.to_string(),
            last_completed_page: page,
            cursor_state: CursorState {
                total_items: 1000,
                per_page: 250,
            },
            accumulated_row_count: rows,
            timestamp: Utc::now(),
        }
    }

    fn row(coin_id: &str, rank: i64) -> RankingRecord {
        RankingRecord {
            date: NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            rank,
            coin_id: coin_id.to_string(),
            symbol: None,
            name: None,
            market_cap: 100.0,
            price: 1.0,
            volume_24h: 10.0,
            circulating_supply: None,
            source: "test".to_string(),
            quality_tier: QualityTier::Unverified,
        }
    }

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();

        let cp = checkpoint("run-1", 5, 1250);
        store.save(&cp).unwrap();

        let loaded = store.load("run-1").unwrap().unwrap();
        assert_eq!(loaded.last_completed_page, 5);
        assert_eq!(loaded.accumulated_row_count, 1250);
        assert_eq!(loaded.cursor_state, cp.cursor_state);
    }

    #[test]
    fn load_absent_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        assert!(store.load("no-such-run").unwrap().is_none());
    }

    #[test]
    fn corrupt_checkpoint_is_an_error_not_a_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("run-1.json"), b"{not json").unwrap();
        match store.load("run-1") {
            Err(CheckpointError::Corrupt { .. }) => {}
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn shrunken_source_total_is_inconsistent() {
        let cp = checkpoint("run-1", 5, 1250);
        match cp.validate_cursor(1000, 250) {
            Ok(()) => {}
            other => panic!("expected ok, got {other:?}"),
        }
        match cp.validate_cursor(900, 250) {
            Err(CheckpointError::Inconsistent { .. }) => {}
            other => panic!("expected Inconsistent, got {other:?}"),
        }
        match cp.validate_cursor(1000, 100) {
            Err(CheckpointError::Inconsistent { .. }) => {}
            other => panic!("expected Inconsistent, got {other:?}"),
        }
    }

    #[test]
    fn spool_truncates_to_checkpointed_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();

        // Two pages spooled, but only the first was checkpointed before the
        // simulated crash.
        store.append_rows("run-1", &[row("bitcoin", 1), row("ethereum", 2)]).unwrap();
        store.append_rows("run-1", &[row("tether", 3), row("solana", 4)]).unwrap();

        let rows = store.load_rows("run-1", 2).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].coin_id, "bitcoin");
        assert_eq!(rows[1].coin_id, "ethereum");
    }

    #[test]
    fn short_spool_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.append_rows("run-1", &[row("bitcoin", 1)]).unwrap();
        match store.load_rows("run-1", 5) {
            Err(CheckpointError::Inconsistent { .. }) => {}
            other => panic!("expected Inconsistent, got {other:?}"),
        }
    }

    #[test]
    fn retire_removes_checkpoint_and_spool() {
        let dir = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(dir.path()).unwrap();
        store.save(&checkpoint("run-1", 1, 1)).unwrap();
        store.append_rows("run-1", &[row("bitcoin", 1)]).unwrap();
        assert_eq!(store.list().unwrap(), vec!["run-1".to_string()]);

        store.retire("run-1").unwrap();
        assert!(store.load("run-1").unwrap().is_none());
        assert!(store.list().unwrap().is_empty());
        // Retiring twice is fine.
        store.retire("run-1").unwrap();
    }
}
