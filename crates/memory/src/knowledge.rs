//! The chunk store and its vector index, behind one lock.
//!
//! Every mutation goes through [`KnowledgeBase::apply`] or
//! [`KnowledgeBase::replace_all`]: the batch is applied to a copy of the
//! state, the copy is written to disk (temp file, fsync, rename), and only
//! then is the in-memory state swapped.  A failed write leaves both the file
//! and the in-memory pair exactly as they were.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::conflict::{self, ConflictPair};
use crate::error::{MemoryError, MemoryResult, SkippedOperation};
use crate::index::VectorIndex;
use crate::persist;
use crate::schema::{AtomicChunk, Category, content_hash, truncate_str};
use crate::store::ChunkStore;

const KNOWLEDGE_FILE_VERSION: u32 = 1;

// ── Batch operations ──────────────────────────────────────────────────────────

/// A validated, embedded operation ready to commit.
#[derive(Debug, Clone)]
pub enum PreparedOp {
    Add {
        content: String,
        category: Category,
        confidence: f32,
        embedding: Vec<f32>,
    },
    Update {
        target_id: String,
        content: String,
        category: Option<Category>,
        confidence: Option<f32>,
        embedding: Vec<f32>,
    },
    Delete {
        target_id: String,
    },
}

impl PreparedOp {
    fn describe(&self) -> String {
        match self {
            Self::Add { content, category, .. } => {
                format!("ADD [{category}] {}", truncate_str(content, 80))
            }
            Self::Update {
                target_id, content, ..
            } => format!("UPDATE {target_id}: {}", truncate_str(content, 80)),
            Self::Delete { target_id } => format!("DELETE {target_id}"),
        }
    }
}

/// What a committed batch changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub deleted: Vec<String>,
    pub skipped: Vec<SkippedOperation>,
}

impl CommitReport {
    pub fn changed(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.deleted.is_empty())
    }
}

// ── State ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct KnowledgeFile {
    version: u32,
    saved_at: DateTime<Utc>,
    store: ChunkStore,
}

#[derive(Debug, Clone, Default)]
struct KnowledgeState {
    store: ChunkStore,
    index: VectorIndex,
}

impl KnowledgeState {
    fn from_store(store: ChunkStore) -> Self {
        let index = VectorIndex::from_store(&store);
        Self { store, index }
    }

    fn apply_op(&mut self, op: PreparedOp, now: DateTime<Utc>, report: &mut CommitReport) {
        let fragment = op.describe();
        match op {
            PreparedOp::Add {
                content,
                category,
                confidence,
                embedding,
            } => {
                let id = self.store.allocate_id();
                let chunk = AtomicChunk {
                    id: id.clone(),
                    content_hash: content_hash(&content),
                    content,
                    category,
                    embedding,
                    created_at: now,
                    updated_at: None,
                    confidence: confidence.clamp(0.0, 1.0),
                };
                self.index.insert(&id, chunk.embedding.clone(), chunk.created_at);
                self.store.add_or_update(chunk);
                report.added.push(id);
            }
            PreparedOp::Update {
                target_id,
                content,
                category,
                confidence,
                embedding,
            } => {
                let Some(existing) = self.store.get(&target_id) else {
                    warn!(chunk = %target_id, "dropping UPDATE of unknown chunk");
                    report
                        .skipped
                        .push(SkippedOperation::new(fragment, "target chunk does not exist"));
                    return;
                };
                let mut chunk = existing.clone();
                chunk.content_hash = content_hash(&content);
                chunk.content = content;
                chunk.embedding = embedding;
                chunk.updated_at = Some(now);
                if let Some(category) = category {
                    chunk.category = category;
                }
                if let Some(confidence) = confidence {
                    chunk.confidence = confidence.clamp(0.0, 1.0);
                }
                self.index
                    .insert(&chunk.id, chunk.embedding.clone(), chunk.created_at);
                self.store.add_or_update(chunk);
                if !report.updated.contains(&target_id) {
                    report.updated.push(target_id);
                }
            }
            PreparedOp::Delete { target_id } => {
                if self.store.delete(&target_id).is_none() {
                    warn!(chunk = %target_id, "dropping DELETE of unknown chunk");
                    report
                        .skipped
                        .push(SkippedOperation::new(fragment, "target chunk does not exist"));
                    return;
                }
                self.index.remove(&target_id);
                report.updated.retain(|id| id != &target_id);
                report.deleted.push(target_id);
            }
        }
    }
}

// ── KnowledgeBase ─────────────────────────────────────────────────────────────

pub struct KnowledgeBase {
    path: PathBuf,
    state: Mutex<KnowledgeState>,
}

impl KnowledgeBase {
    /// Load `path`, or start empty when it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let store = match persist::read_json::<KnowledgeFile>(&path)? {
            Some(file) => {
                if file.version != KNOWLEDGE_FILE_VERSION {
                    anyhow::bail!(
                        "unsupported knowledge file version {} in {}",
                        file.version,
                        path.display()
                    );
                }
                file.store
            }
            None => ChunkStore::default(),
        };
        info!(path = %path.display(), chunks = store.len(), "knowledge store loaded");
        Ok(Self {
            path,
            state: Mutex::new(KnowledgeState::from_store(store)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, id: &str) -> Option<AtomicChunk> {
        self.state.lock().await.store.get(id).cloned()
    }

    /// Every chunk, oldest first.
    pub async fn all(&self) -> Vec<AtomicChunk> {
        let state = self.state.lock().await;
        let mut chunks: Vec<AtomicChunk> = state.store.iter().cloned().collect();
        chunks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        chunks
    }

    pub async fn list_by_category(&self, category: Category) -> Vec<AtomicChunk> {
        let state = self.state.lock().await;
        state
            .store
            .list_by_category(category)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.store.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.store.is_empty()
    }

    pub async fn category_counts(&self) -> BTreeMap<Category, usize> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<Category, usize> =
            Category::ALL.iter().map(|c| (*c, 0)).collect();
        for chunk in state.store.iter() {
            *counts.entry(chunk.category).or_default() += 1;
        }
        counts
    }

    /// Id of a live chunk whose normalised content hashes to `hash`.
    pub async fn find_by_hash(&self, hash: &str) -> Option<String> {
        let state = self.state.lock().await;
        state.store.find_by_hash(hash).map(|c| c.id.clone())
    }

    pub async fn nearest(
        &self,
        embedding: &[f32],
        k: usize,
        exclude: Option<&str>,
    ) -> Vec<(AtomicChunk, f32)> {
        let state = self.state.lock().await;
        state
            .index
            .nearest(embedding, k, exclude)
            .into_iter()
            .filter_map(|n| state.store.get(&n.id).map(|c| (c.clone(), n.similarity)))
            .collect()
    }

    pub async fn scan_conflicts(&self, threshold: f32) -> Vec<ConflictPair> {
        let state = self.state.lock().await;
        conflict::scan(&state.index, threshold)
    }

    /// Store ids and index ids.  Equal after every committed operation.
    pub async fn id_sets(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        let state = self.state.lock().await;
        (state.store.ids(), state.index.ids())
    }

    /// Apply a batch atomically.
    ///
    /// Operations naming a missing chunk are dropped into `skipped`; the rest
    /// commit together.  Nothing is written when nothing changed.
    pub async fn apply(&self, ops: Vec<PreparedOp>) -> MemoryResult<CommitReport> {
        let mut state = self.state.lock().await;
        let mut working = state.clone();
        let mut report = CommitReport::default();
        let now = Utc::now();

        for op in ops {
            working.apply_op(op, now, &mut report);
        }

        if !report.changed() {
            debug!(skipped = report.skipped.len(), "batch produced no changes");
            return Ok(report);
        }

        self.persist(&working.store).await?;
        *state = working;

        info!(
            added = report.added.len(),
            updated = report.updated.len(),
            deleted = report.deleted.len(),
            skipped = report.skipped.len(),
            "knowledge batch committed"
        );
        Ok(report)
    }

    /// Replace the whole store (used by archive restore).
    pub async fn replace_all(&self, chunks: Vec<AtomicChunk>) -> MemoryResult<()> {
        let mut state = self.state.lock().await;
        let mut store = state.store.clone();
        store.replace_all(chunks);
        self.persist(&store).await?;
        *state = KnowledgeState::from_store(store);
        info!(chunks = state.store.len(), "knowledge store replaced");
        Ok(())
    }

    async fn persist(&self, store: &ChunkStore) -> MemoryResult<()> {
        let file = KnowledgeFile {
            version: KNOWLEDGE_FILE_VERSION,
            saved_at: Utc::now(),
            store: store.clone(),
        };
        persist::write_json_atomic(&self.path, &file)
            .await
            .map_err(MemoryError::persistence)
    }
}
