//! Rolling window of full knowledge snapshots.
//!
//! Each snapshot is its own immutable file, `snapshot-<index>.json`, under
//! the archive directory.  Indices grow monotonically and are never reused;
//! when the window is full the oldest file is deleted.  `state.json` keeps
//! the next index, the cycle counters and the list of retained snapshots.

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MemoryError, MemoryResult};
use crate::persist;
use crate::schema::AtomicChunk;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSnapshot {
    pub index: u64,
    pub created_at: DateTime<Utc>,
    pub chunks: Vec<AtomicChunk>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSummary {
    pub index: u64,
    pub created_at: DateTime<Utc>,
    pub chunk_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ArchiveState {
    next_index: u64,
    cycles_since_snapshot: usize,
    total_cycles: u64,
    retained: Vec<ArchiveSummary>,
}

pub struct ArchiveManager {
    dir: PathBuf,
    window: usize,
    threshold: usize,
    state: ArchiveState,
}

impl ArchiveManager {
    /// `threshold` is the number of consolidation cycles between snapshots;
    /// `0` disables cycle-driven snapshots.
    pub fn open(dir: impl Into<PathBuf>, window: usize, threshold: usize) -> Result<Self> {
        let dir = dir.into();
        let state = persist::read_json::<ArchiveState>(&dir.join("state.json"))?.unwrap_or_default();
        info!(
            dir = %dir.display(),
            retained = state.retained.len(),
            total_cycles = state.total_cycles,
            "archive loaded"
        );
        Ok(Self {
            dir,
            window: window.max(1),
            threshold,
            state,
        })
    }

    /// Retained snapshots, oldest first.
    pub fn list(&self) -> &[ArchiveSummary] {
        &self.state.retained
    }

    pub fn total_cycles(&self) -> u64 {
        self.state.total_cycles
    }

    pub fn cycles_since_snapshot(&self) -> usize {
        self.state.cycles_since_snapshot
    }

    fn snapshot_path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("snapshot-{index}.json"))
    }

    fn state_path(&self) -> PathBuf {
        self.dir.join("state.json")
    }

    /// Count one committed consolidation.  Returns `true` when a snapshot is due.
    pub async fn record_cycle(&mut self) -> Result<bool> {
        let mut next = self.state.clone();
        next.total_cycles += 1;
        next.cycles_since_snapshot += 1;
        persist::write_json_atomic(&self.state_path(), &next).await?;
        self.state = next;
        Ok(self.threshold > 0 && self.state.cycles_since_snapshot >= self.threshold)
    }

    /// Write a new snapshot of `chunks` and evict beyond the window.
    pub async fn snapshot(&mut self, chunks: Vec<AtomicChunk>) -> Result<ArchiveSummary> {
        let snapshot = ArchiveSnapshot {
            index: self.state.next_index,
            created_at: Utc::now(),
            chunks,
        };
        persist::write_json_atomic(&self.snapshot_path(snapshot.index), &snapshot).await?;

        let summary = ArchiveSummary {
            index: snapshot.index,
            created_at: snapshot.created_at,
            chunk_count: snapshot.chunks.len(),
        };

        let mut next = self.state.clone();
        next.next_index += 1;
        next.cycles_since_snapshot = 0;
        next.retained.push(summary.clone());
        let mut evicted = Vec::new();
        while next.retained.len() > self.window {
            evicted.push(next.retained.remove(0));
        }
        persist::write_json_atomic(&self.state_path(), &next).await?;
        self.state = next;

        for old in evicted {
            let path = self.snapshot_path(old.index);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(index = old.index, "evicted oldest archive snapshot"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!(index = old.index, %err, "failed to delete evicted snapshot file"),
            }
        }

        info!(
            index = summary.index,
            chunks = summary.chunk_count,
            retained = self.state.retained.len(),
            "archive snapshot written"
        );
        Ok(summary)
    }

    pub fn load(&self, index: u64) -> MemoryResult<ArchiveSnapshot> {
        if !self.state.retained.iter().any(|s| s.index == index) {
            return Err(MemoryError::NotFound(format!("archive snapshot {index}")));
        }
        persist::read_json::<ArchiveSnapshot>(&self.snapshot_path(index))
            .map_err(MemoryError::persistence)?
            .ok_or_else(|| MemoryError::NotFound(format!("archive snapshot file {index}")))
    }
}
