//! Append-only JSONL log of every conversation turn.
//!
//! The short-term buffer evicts and discards turns; this log is where they
//! survive.  Every non-empty line is one position; on startup the turns past
//! the consolidation watermark are read back into the buffer.

use std::fs;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::schema::Turn;

/// Turns read back from the log.
#[derive(Debug, Clone, Default)]
pub struct TranscriptTail {
    pub turns: Vec<Turn>,
    /// Position the next appended turn will take.
    pub end_position: u64,
}

#[derive(Debug, Clone)]
pub struct TranscriptLog {
    path: PathBuf,
}

impl TranscriptLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Append and fsync one turn.
    pub async fn append(&self, turn: &Turn) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("open transcript {}", self.path.display()))?;
        let mut line = serde_json::to_string(turn).context("serialize turn")?;
        line.push('\n');
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Turns at position `from` and later.
    ///
    /// Corrupt lines keep their position but are skipped.
    pub fn load_from(&self, from: u64) -> Result<TranscriptTail> {
        if !self.path.exists() {
            return Ok(TranscriptTail::default());
        }
        let file = fs::File::open(&self.path)
            .with_context(|| format!("open transcript {}", self.path.display()))?;
        let reader = BufReader::new(file);

        let mut position = 0u64;
        let mut turns = Vec::new();
        for (line_idx, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let current = position;
            position += 1;
            if current < from {
                continue;
            }
            match serde_json::from_str::<Turn>(trimmed) {
                Ok(turn) => turns.push(turn),
                Err(err) => warn!(line = line_idx + 1, %err, "skipping corrupt transcript line"),
            }
        }

        if from > position {
            warn!(watermark = from, lines = position, "transcript is shorter than the consolidation watermark");
        }
        Ok(TranscriptTail {
            turns,
            end_position: position,
        })
    }
}
