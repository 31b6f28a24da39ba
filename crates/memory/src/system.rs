//! The memory subsystem as one owned object.
//!
//! Locks, in acquisition order:
//!
//! 1. `cycle_lock`: one consolidation, resolution, restore, import, clear
//!    or holding review at a time.  Held across model calls.
//! 2. the buffer, archive and holding mutexes: short critical sections.
//!    The buffer lock also orders transcript appends.
//! 3. the knowledge lock inside [`KnowledgeBase`]: only for reads and the
//!    final commit.
//!
//! Chat traffic (`record_turn`, `relevant_chunks`) never waits on
//! `cycle_lock` unless it triggers a consolidation itself.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use mnemo_config::AppConfig;
use mnemo_llm::ModelClient;

use crate::archive::{ArchiveManager, ArchiveSummary};
use crate::buffer::{BufferState, ShortTermBuffer};
use crate::conflict::ConflictPair;
use crate::consolidation::{self, ConsolidationOptions, ConsolidationResult};
use crate::error::{MemoryError, MemoryResult};
use crate::export::{ExportFormat, export_chunks, parse_export};
use crate::holding::{HoldingArea, HoldingItem, ReviewAction};
use crate::knowledge::{KnowledgeBase, PreparedOp};
use crate::persist;
use crate::resolution::{self, ResolutionResult};
use crate::schema::{AtomicChunk, Category, Turn, content_hash};
use crate::transcript::TranscriptLog;

/// What happened to a recorded turn.
#[derive(Debug)]
pub enum RecordOutcome {
    Buffered,
    Consolidated(ConsolidationResult),
    /// The turn is recorded; the triggered consolidation failed and the
    /// buffer was left intact for a later retry.
    ConsolidationFailed(MemoryError),
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryStats {
    pub buffer_len: usize,
    pub buffer_capacity: usize,
    pub turns_since_consolidation: usize,
    pub consolidation_count: u64,
    pub cycles_since_snapshot: usize,
    pub chunk_count: usize,
    pub by_category: BTreeMap<Category, usize>,
    pub archive_count: usize,
    pub pending_holding: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportReport {
    pub imported: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone)]
pub struct HoldingReview {
    pub item: HoldingItem,
    /// Id of the chunk created by an approval.
    pub chunk_id: Option<String>,
}

pub struct MemorySystem {
    config: AppConfig,
    model: Arc<dyn ModelClient>,
    knowledge: KnowledgeBase,
    buffer: Mutex<ShortTermBuffer>,
    archive: Mutex<ArchiveManager>,
    holding: Mutex<HoldingArea>,
    transcript: TranscriptLog,
    buffer_state_path: PathBuf,
    cycle_lock: Mutex<()>,
}

impl MemorySystem {
    /// Open (or create) the data directory named by `config.memory.data_dir`.
    pub fn open(config: AppConfig, model: Arc<dyn ModelClient>) -> Result<Self> {
        let root = config.memory.data_path();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("create data directory {}", root.display()))?;

        let knowledge = KnowledgeBase::open(root.join("knowledge.json"))?;
        let archive = ArchiveManager::open(
            root.join("archive"),
            config.memory.archive_window,
            config.memory.archive_threshold,
        )?;
        let holding = HoldingArea::open(root.join("holding.json"))?;

        // Turns logged after the last consolidation go back into the buffer.
        let transcript = TranscriptLog::new(root.join("transcript.jsonl"));
        let buffer_state_path = root.join("buffer.json");
        let state = persist::read_json::<BufferState>(&buffer_state_path)?.unwrap_or_default();
        let tail = transcript.load_from(state.consumed_through)?;
        let buffer = ShortTermBuffer::resume(config.memory.stm_size, tail.end_position, tail.turns);

        info!(
            data_dir = %root.display(),
            stm_size = config.memory.stm_size,
            resumed_turns = buffer.len(),
            summary_threshold = config.memory.summary_threshold,
            holding = config.holding.enabled,
            "memory system ready"
        );

        Ok(Self {
            config,
            model,
            knowledge,
            buffer: Mutex::new(buffer),
            archive: Mutex::new(archive),
            holding: Mutex::new(holding),
            transcript,
            buffer_state_path,
            cycle_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn knowledge(&self) -> &KnowledgeBase {
        &self.knowledge
    }

    // ── Buffer ──────────────────────────────────────────────────────────────

    /// Log and buffer a turn; consolidate when the threshold is reached.
    pub async fn record_turn(&self, turn: Turn) -> MemoryResult<RecordOutcome> {
        self.record_turns(vec![turn]).await
    }

    /// Log and buffer several turns (one exchange), then check the
    /// threshold once so the exchange is never split across two runs.
    pub async fn record_turns(&self, turns: Vec<Turn>) -> MemoryResult<RecordOutcome> {
        let due = {
            let mut buffer = self.buffer.lock().await;
            for turn in turns {
                self.transcript
                    .append(&turn)
                    .await
                    .map_err(MemoryError::persistence)?;
                buffer.append(turn);
            }
            buffer.should_consolidate(self.config.memory.summary_threshold)
        };
        if !due {
            return Ok(RecordOutcome::Buffered);
        }

        match self.consolidate().await {
            Ok(result) => Ok(RecordOutcome::Consolidated(result)),
            Err(err) => {
                warn!(%err, retryable = err.is_retryable(), "automatic consolidation failed");
                Ok(RecordOutcome::ConsolidationFailed(err))
            }
        }
    }

    pub async fn recent_turns(&self) -> Vec<Turn> {
        self.buffer.lock().await.recent()
    }

    pub async fn turns_since_consolidation(&self) -> usize {
        self.buffer.lock().await.turns_since_consolidation()
    }

    // ── Consolidation ───────────────────────────────────────────────────────

    /// Consolidate everything currently buffered ("sleep").
    ///
    /// An empty buffer is a no-op.  On failure the buffer keeps its turns.
    #[instrument(skip(self))]
    pub async fn consolidate(&self) -> MemoryResult<ConsolidationResult> {
        let _cycle = self.cycle_lock.lock().await;

        let Some(snapshot) = self.buffer.lock().await.snapshot() else {
            info!("nothing to consolidate");
            return Ok(ConsolidationResult::default());
        };

        let opts = ConsolidationOptions::from_config(&self.config);
        let outcome = consolidation::consolidate(
            &self.knowledge,
            self.model.as_ref(),
            &snapshot.turns,
            &opts,
        )
        .await;
        let mut outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                self.buffer.lock().await.release(&snapshot);
                return Err(err);
            }
        };

        if !outcome.held.is_empty() {
            let held = std::mem::take(&mut outcome.held);
            if let Err(err) = self.holding.lock().await.hold(held).await {
                // Committed chunks dedupe by content on the retry.
                self.buffer.lock().await.release(&snapshot);
                return Err(err);
            }
        }

        self.buffer.lock().await.acknowledge(&snapshot);
        if let Err(err) = self.save_buffer_state(snapshot.consumed_through()).await {
            // The turns are replayed after a restart; dedup absorbs them.
            warn!(%err, "failed to persist consolidation watermark");
        }

        let mut result = outcome.result;
        let mut archive = self.archive.lock().await;
        match archive.record_cycle().await {
            Ok(true) => match archive.snapshot(self.knowledge.all().await).await {
                Ok(summary) => result.archived_snapshot = Some(summary.index),
                Err(err) => warn!(%err, "scheduled archive snapshot failed"),
            },
            Ok(false) => {}
            Err(err) => warn!(%err, "failed to record consolidation cycle"),
        }

        Ok(result)
    }

    async fn save_buffer_state(&self, consumed_through: u64) -> MemoryResult<()> {
        persist::write_json_atomic(&self.buffer_state_path, &BufferState { consumed_through })
            .await
            .map_err(MemoryError::persistence)
    }

    /// Delete every chunk and forget the buffered turns.  Archive snapshots
    /// and the transcript are kept, so a cleared store can still be restored.
    #[instrument(skip(self))]
    pub async fn clear(&self) -> MemoryResult<usize> {
        let _cycle = self.cycle_lock.lock().await;
        let removed = self.knowledge.len().await;
        self.knowledge.replace_all(Vec::new()).await?;
        let consumed_through = {
            let mut buffer = self.buffer.lock().await;
            buffer.clear();
            buffer.next_seq()
        };
        self.save_buffer_state(consumed_through).await?;
        info!(removed, "memory cleared");
        Ok(removed)
    }

    // ── Conflicts ───────────────────────────────────────────────────────────

    fn conflict_threshold(&self, threshold: Option<f32>) -> f32 {
        threshold.unwrap_or_else(|| {
            self.config
                .memory
                .conflict_threshold(&self.config.resolution)
        })
    }

    pub async fn scan_conflicts(&self, threshold: Option<f32>) -> Vec<ConflictPair> {
        let threshold = self.conflict_threshold(threshold);
        let pairs = self.knowledge.scan_conflicts(threshold).await;
        info!(threshold, conflicts = pairs.len(), "conflict scan complete");
        pairs
    }

    /// Scan, then resolve whatever the scan found.
    #[instrument(skip(self))]
    pub async fn resolve_conflicts(&self, threshold: Option<f32>) -> MemoryResult<ResolutionResult> {
        let _cycle = self.cycle_lock.lock().await;
        let threshold = self.conflict_threshold(threshold);
        let conflicts = self.scan_conflicts(Some(threshold)).await;
        self.resolve(&conflicts, threshold).await
    }

    /// Resolve a caller-supplied conflict set.  Pairs are re-measured against
    /// the configured conflict threshold; stale or dissimilar ones are dropped.
    pub async fn resolve_pairs(&self, conflicts: &[ConflictPair]) -> MemoryResult<ResolutionResult> {
        let _cycle = self.cycle_lock.lock().await;
        self.resolve(conflicts, self.conflict_threshold(None)).await
    }

    async fn resolve(&self, conflicts: &[ConflictPair], threshold: f32) -> MemoryResult<ResolutionResult> {
        resolution::resolve(
            &self.knowledge,
            self.model.as_ref(),
            conflicts,
            threshold,
            self.config.resolution.temperature,
            self.config.memory.default_confidence,
        )
        .await
    }

    // ── Chunks ──────────────────────────────────────────────────────────────

    pub async fn list_by_category(&self, category: Category) -> Vec<AtomicChunk> {
        self.knowledge.list_by_category(category).await
    }

    pub async fn chunks(&self) -> Vec<AtomicChunk> {
        self.knowledge.all().await
    }

    pub async fn get_chunk(&self, id: &str) -> MemoryResult<AtomicChunk> {
        self.knowledge
            .get(id)
            .await
            .ok_or_else(|| MemoryError::NotFound(format!("chunk {id}")))
    }

    /// The `k` chunks nearest to `query`, for prompt injection.
    pub async fn relevant_chunks(&self, query: &str, k: usize) -> MemoryResult<Vec<(AtomicChunk, f32)>> {
        if k == 0 || query.trim().is_empty() || self.knowledge.is_empty().await {
            return Ok(Vec::new());
        }
        let embedding = self.model.embed(query).await.map_err(MemoryError::upstream)?;
        Ok(self.knowledge.nearest(&embedding, k, None).await)
    }

    // ── Archive ─────────────────────────────────────────────────────────────

    pub async fn archives(&self) -> Vec<ArchiveSummary> {
        self.archive.lock().await.list().to_vec()
    }

    pub async fn snapshot_now(&self) -> MemoryResult<ArchiveSummary> {
        let chunks = self.knowledge.all().await;
        self.archive
            .lock()
            .await
            .snapshot(chunks)
            .await
            .map_err(MemoryError::persistence)
    }

    /// Replace the whole store with snapshot `index`.  Destructive; callers
    /// confirm with the user first.
    #[instrument(skip(self))]
    pub async fn restore(&self, index: u64) -> MemoryResult<usize> {
        let _cycle = self.cycle_lock.lock().await;
        let snapshot = self.archive.lock().await.load(index)?;
        let count = snapshot.chunks.len();
        self.knowledge.replace_all(snapshot.chunks).await?;
        info!(index, chunks = count, "restored archive snapshot");
        Ok(count)
    }

    /// Snapshot the store every `archive_interval_minutes` until shutdown.
    /// `None` when the interval is 0.
    pub fn spawn_archive_task(
        self: &Arc<Self>,
        shutdown_tx: &watch::Sender<bool>,
    ) -> Option<JoinHandle<()>> {
        let minutes = self.config.memory.archive_interval_minutes;
        if minutes == 0 {
            return None;
        }
        let system = Arc::clone(self);
        let mut rx = shutdown_tx.subscribe();
        Some(tokio::spawn(async move {
            let interval = Duration::from_secs(minutes * 60);
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        match system.snapshot_now().await {
                            Ok(summary) => info!(index = summary.index, "timed archive snapshot written"),
                            Err(err) => warn!(%err, "timed archive snapshot failed"),
                        }
                    }
                    changed = rx.changed() => {
                        if changed.is_err() || *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        }))
    }

    // ── Holding area ────────────────────────────────────────────────────────

    pub async fn holding_items(&self) -> Vec<HoldingItem> {
        self.holding.lock().await.pending().to_vec()
    }

    /// Approve (optionally with edited content) or reject a held candidate.
    pub async fn review_holding(
        &self,
        id: &str,
        action: ReviewAction,
        content: Option<String>,
    ) -> MemoryResult<HoldingReview> {
        let _cycle = self.cycle_lock.lock().await;
        let mut holding = self.holding.lock().await;
        let item = holding.get(id)?.clone();

        match action {
            ReviewAction::Reject => {
                let item = holding.resolve(id, ReviewAction::Reject, None).await?;
                Ok(HoldingReview {
                    item,
                    chunk_id: None,
                })
            }
            ReviewAction::Approve => {
                let content = content
                    .map(|c| c.trim().to_string())
                    .unwrap_or_else(|| item.content.clone());
                if content.is_empty() {
                    return Err(MemoryError::InvalidRequest(
                        "approved content must not be empty".to_string(),
                    ));
                }

                // A retry after a failed holding write finds the committed chunk.
                if let Some(existing) = self.knowledge.find_by_hash(&content_hash(&content)).await {
                    info!(chunk = %existing, "approved content already stored");
                    let item = holding
                        .resolve(id, ReviewAction::Approve, Some(content))
                        .await?;
                    return Ok(HoldingReview {
                        item,
                        chunk_id: Some(existing),
                    });
                }

                let embedding = self
                    .model
                    .embed(&content)
                    .await
                    .map_err(MemoryError::upstream)?;
                let report = self
                    .knowledge
                    .apply(vec![PreparedOp::Add {
                        content: content.clone(),
                        category: item.category,
                        confidence: item.confidence.max(self.config.memory.default_confidence),
                        embedding,
                    }])
                    .await?;
                let item = holding
                    .resolve(id, ReviewAction::Approve, Some(content))
                    .await?;
                Ok(HoldingReview {
                    item,
                    chunk_id: report.added.first().cloned(),
                })
            }
        }
    }

    // ── Export / import ─────────────────────────────────────────────────────

    pub async fn export(&self, format: ExportFormat) -> MemoryResult<String> {
        export_chunks(&self.knowledge.all().await, format)
    }

    /// Load an export into an empty store.  Ids are reassigned.
    pub async fn import(&self, format: ExportFormat, raw: &str) -> MemoryResult<ImportReport> {
        let _cycle = self.cycle_lock.lock().await;
        if !self.knowledge.is_empty().await {
            return Err(MemoryError::InvalidRequest(
                "import requires an empty knowledge store".to_string(),
            ));
        }

        let (records, skipped) = parse_export(format, raw)?;
        let mut ops = Vec::with_capacity(records.len());
        for record in records {
            let embedding = self
                .model
                .embed(&record.content)
                .await
                .map_err(MemoryError::upstream)?;
            ops.push(PreparedOp::Add {
                content: record.content,
                category: record.category,
                confidence: record
                    .confidence
                    .unwrap_or(self.config.memory.default_confidence),
                embedding,
            });
        }

        let report = self.knowledge.apply(ops).await?;
        info!(imported = report.added.len(), skipped, "import complete");
        Ok(ImportReport {
            imported: report.added.len(),
            skipped,
        })
    }

    // ── Stats ───────────────────────────────────────────────────────────────

    pub async fn stats(&self) -> MemoryStats {
        let (buffer_len, buffer_capacity, turns_since_consolidation) = {
            let buffer = self.buffer.lock().await;
            (
                buffer.len(),
                buffer.capacity(),
                buffer.turns_since_consolidation(),
            )
        };
        let (consolidation_count, cycles_since_snapshot, archive_count) = {
            let archive = self.archive.lock().await;
            (
                archive.total_cycles(),
                archive.cycles_since_snapshot(),
                archive.list().len(),
            )
        };
        let by_category = self.knowledge.category_counts().await;
        MemoryStats {
            buffer_len,
            buffer_capacity,
            turns_since_consolidation,
            consolidation_count,
            cycles_since_snapshot,
            chunk_count: by_category.values().sum(),
            by_category,
            archive_count,
            pending_holding: self.holding.lock().await.len(),
        }
    }
}

#[cfg(test)]
mod tests;
