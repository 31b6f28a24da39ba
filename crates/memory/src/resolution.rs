//! Model-driven resolution of detected conflicts.
//!
//! The whole conflict set goes to the model in one request.  The reply is
//! parsed into a plan, every operation is checked against the conflict set,
//! and the survivors commit as one atomic batch.  The raw reply is always
//! returned so an operator can audit what the model decided.

use std::collections::BTreeSet;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use mnemo_llm::{CompletionOptions, ModelClient};

use crate::conflict::ConflictPair;
use crate::error::{MemoryError, MemoryResult, SkippedOperation};
use crate::index::cosine_similarity;
use crate::knowledge::{KnowledgeBase, PreparedOp};
use crate::plan::{PlanOperation, parse_plan};
use crate::schema::AtomicChunk;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolutionResult {
    /// Conflicts sent to the model.
    pub conflicts: usize,
    pub added: usize,
    pub updated: usize,
    pub deleted: usize,
    pub added_ids: Vec<String>,
    pub updated_ids: Vec<String>,
    pub deleted_ids: Vec<String>,
    pub skipped: Vec<SkippedOperation>,
    /// Model output verbatim, reasoning included.
    pub raw_output: String,
}

impl ResolutionResult {
    pub fn total_operations(&self) -> usize {
        self.added + self.updated + self.deleted
    }
}

/// A conflict with the content of both sides resolved.
#[derive(Debug, Clone)]
pub struct ConflictView {
    pub pair: ConflictPair,
    pub a: AtomicChunk,
    pub b: AtomicChunk,
}

pub fn build_resolution_prompt(conflicts: &[ConflictView]) -> String {
    let descriptions: String = conflicts
        .iter()
        .enumerate()
        .map(|(i, c)| {
            format!(
                "CONFLICT {} (similarity: {:.0}%):\n  Chunk A [{}] ({}): {}\n  Chunk B [{}] ({}): {}\n",
                i + 1,
                c.pair.similarity * 100.0,
                c.a.id,
                c.a.category,
                c.a.content,
                c.b.id,
                c.b.category,
                c.b.content,
            )
        })
        .collect();

    format!(
        "You are resolving duplicate or conflicting knowledge chunks.

DETECTED CONFLICTS:
{descriptions}
RESOLUTION RULES:
1. Duplicates with identical meaning -> DELETE one, keep the other.
2. Chunks that contradict each other -> UPDATE one to the correct version, DELETE the incorrect one.
3. Similar chunks that both add value -> UPDATE one to merge them, DELETE the other.
4. Use ADD only when a merged fact cannot replace either chunk.

OUTPUT the operations using EXACTLY this format:

[DELETE chunk_id=\"...\"]

[UPDATE chunk_id=\"...\"]
merged or corrected content here
[/UPDATE]

[ADD category=\"facts\"]new fact[/ADD]

CRITICAL: Only output operations for the chunks listed above. Do not modify unrelated chunks.
If the chunks are not actually in conflict, reply with NONE.
"
    )
}

/// Resolve `conflicts` and commit the resulting plan.
///
/// Each pair is re-checked against the current store: pairs naming a missing
/// chunk, or whose similarity is now below `threshold`, are dropped.  No
/// remaining conflicts means no model call and zero operations.  If the reply
/// contains nothing parseable the call fails with
/// [`MemoryError::MalformedOutput`] and the store is untouched.
#[instrument(skip_all, fields(conflicts = conflicts.len(), threshold = threshold))]
pub async fn resolve(
    knowledge: &KnowledgeBase,
    model: &dyn ModelClient,
    conflicts: &[ConflictPair],
    threshold: f32,
    temperature: f32,
    default_confidence: f32,
) -> MemoryResult<ResolutionResult> {
    let mut views = Vec::with_capacity(conflicts.len());
    let mut seen = BTreeSet::new();
    for pair in conflicts {
        let (Some(a), Some(b)) = (knowledge.get(&pair.chunk_a).await, knowledge.get(&pair.chunk_b).await) else {
            warn!(a = %pair.chunk_a, b = %pair.chunk_b, "conflict refers to a missing chunk; ignoring");
            continue;
        };
        if a.id == b.id {
            continue;
        }
        let key = if a.id < b.id {
            (a.id.clone(), b.id.clone())
        } else {
            (b.id.clone(), a.id.clone())
        };
        if !seen.insert(key) {
            continue;
        }
        let similarity = cosine_similarity(&a.embedding, &b.embedding);
        if similarity < threshold {
            debug!(a = %a.id, b = %b.id, similarity, "pair is not a near-duplicate; ignoring");
            continue;
        }
        views.push(ConflictView {
            pair: ConflictPair {
                chunk_a: a.id.clone(),
                chunk_b: b.id.clone(),
                similarity,
            },
            a,
            b,
        });
    }

    if views.is_empty() {
        info!("no conflicts to resolve");
        return Ok(ResolutionResult::default());
    }

    let allowed: BTreeSet<&str> = views
        .iter()
        .flat_map(|v| [v.a.id.as_str(), v.b.id.as_str()])
        .collect();

    let prompt = build_resolution_prompt(&views);
    let raw = model
        .complete(&prompt, &CompletionOptions::with_temperature(temperature))
        .await
        .map_err(MemoryError::upstream)?;

    let plan = parse_plan(&raw);
    if plan.is_unparseable() {
        warn!(
            skipped = plan.skipped.len(),
            "resolution output contained no valid operation"
        );
        return Err(MemoryError::MalformedOutput { raw });
    }

    let mut skipped = plan.skipped;
    let mut accepted = Vec::new();
    for op in plan.operations {
        if let Some(target) = op.target_id() {
            if !allowed.contains(target) {
                warn!(chunk = target, kind = op.kind(), "resolution targets a chunk outside the conflict set");
                skipped.push(SkippedOperation::new(
                    op.describe(),
                    "target is not one of the conflicting chunks",
                ));
                continue;
            }
        }
        accepted.push(op);
    }

    let mut prepared = Vec::with_capacity(accepted.len());
    for op in accepted {
        let prepared_op = match op {
            PlanOperation::Add {
                content,
                category,
                confidence,
                ..
            } => {
                let embedding = model.embed(&content).await.map_err(MemoryError::upstream)?;
                PreparedOp::Add {
                    content,
                    category,
                    confidence: confidence.unwrap_or(default_confidence),
                    embedding,
                }
            }
            PlanOperation::Update {
                target_id,
                content,
                category,
            } => {
                let embedding = model.embed(&content).await.map_err(MemoryError::upstream)?;
                PreparedOp::Update {
                    target_id,
                    content,
                    category,
                    confidence: None,
                    embedding,
                }
            }
            PlanOperation::Delete { target_id } => PreparedOp::Delete { target_id },
        };
        prepared.push(prepared_op);
    }

    let report = knowledge.apply(prepared).await?;
    skipped.extend(report.skipped);

    let result = ResolutionResult {
        conflicts: views.len(),
        added: report.added.len(),
        updated: report.updated.len(),
        deleted: report.deleted.len(),
        added_ids: report.added,
        updated_ids: report.updated,
        deleted_ids: report.deleted,
        skipped,
        raw_output: raw,
    };
    info!(
        added = result.added,
        updated = result.updated,
        deleted = result.deleted,
        skipped = result.skipped.len(),
        "conflict resolution committed"
    );
    Ok(result)
}
