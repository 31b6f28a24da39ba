//! Sleep-cycle consolidation: buffered turns → atomic, categorized chunks.
//!
//! The model call happens with no lock held.  Candidates are parsed,
//! de-duplicated and embedded first; only the final
//! [`KnowledgeBase::apply`] takes the store lock.  Any upstream failure
//! returns before that point, so a failed run never changes the store.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use mnemo_config::{AppConfig, MergePolicy};
use mnemo_llm::{CompletionOptions, ModelClient, strip_reasoning};

use crate::error::{MemoryError, MemoryResult, SkippedOperation};
use crate::index::cosine_similarity;
use crate::knowledge::{KnowledgeBase, PreparedOp};
use crate::plan::{PlanOperation, declares_nothing, parse_plan};
use crate::schema::{AtomicChunk, Category, Turn, content_hash, truncate_str};

const CONTEXT_PREVIEW_CHARS: usize = 200;

// ── Options & results ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConsolidationOptions {
    pub temperature: f32,
    pub enable_similarity_check: bool,
    pub similarity_threshold: f32,
    pub context_aware: bool,
    pub context_size: usize,
    pub merge_policy: MergePolicy,
    pub fallback_to_summary_chunk: bool,
    pub default_confidence: f32,
    /// `Some(min_confidence)` when the holding area is enabled.
    pub holding_min_confidence: Option<f32>,
    pub user_name: String,
}

impl ConsolidationOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        let memory = &config.memory;
        Self {
            temperature: config.llm.temperature,
            enable_similarity_check: memory.enable_similarity_check,
            similarity_threshold: memory.similarity_threshold,
            context_aware: memory.enable_context_aware_consolidation,
            context_size: memory.consolidation_context_size,
            merge_policy: memory.merge_policy,
            fallback_to_summary_chunk: memory.fallback_to_summary_chunk,
            default_confidence: memory.default_confidence,
            holding_min_confidence: config
                .holding
                .enabled
                .then_some(config.holding.min_confidence),
            user_name: config.agent.user_name.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsolidationResult {
    pub added: usize,
    pub updated: usize,
    /// Candidates routed to the holding area instead of the store.
    pub held: usize,
    pub added_ids: Vec<String>,
    pub updated_ids: Vec<String>,
    pub skipped: Vec<SkippedOperation>,
    /// Model output verbatim, reasoning included.
    pub raw_output: String,
    pub turns_consumed: usize,
    /// Index of the archive snapshot taken right after this run, if any.
    pub archived_snapshot: Option<u64>,
}

impl ConsolidationResult {
    /// Whether the caller should tell the user that knowledge changed.
    pub fn changed(&self) -> bool {
        self.added + self.updated + self.held > 0
    }
}

/// A candidate quarantined for review.
#[derive(Debug, Clone, PartialEq)]
pub struct HeldCandidate {
    pub content: String,
    pub category: Category,
    pub confidence: f32,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConsolidationOutcome {
    pub result: ConsolidationResult,
    pub held: Vec<HeldCandidate>,
}

// ── Prompt ────────────────────────────────────────────────────────────────────

pub fn build_extraction_prompt(turns: &[Turn], context: &[AtomicChunk], user_name: &str) -> String {
    let who = if user_name.trim().is_empty() {
        "the user".to_string()
    } else {
        user_name.trim().to_string()
    };

    let conversation = turns
        .iter()
        .map(|t| format!("{}: {}", t.role.label(), t.content.trim()))
        .collect::<Vec<_>>()
        .join("\n");

    let knowledge = if context.is_empty() {
        "(no related knowledge yet)".to_string()
    } else {
        context
            .iter()
            .map(|c| {
                format!(
                    "[{}] ({}): {}",
                    c.id,
                    c.category,
                    truncate_str(&c.content, CONTEXT_PREVIEW_CHARS)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "You are the memory consolidation process of a personal assistant. \
Read the conversation below and extract durable, atomic facts about {who}.

RULES:
- One fact per block, short and self-contained.
- category is one of: preferences, facts, general.
- When a fact refines or corrects an existing chunk listed under EXISTING KNOWLEDGE, \
UPDATE that chunk instead of adding a duplicate.
- Skip small talk and anything already known.
- Optional ADD attributes: confidence=\"0.0-1.0\" and conflicts_with=\"<chunk id>\" \
when the fact contradicts an existing chunk.
- If nothing is worth remembering, reply with NONE.

OUTPUT FORMAT (operations only, nothing else):
[ADD category=\"preferences\"]User prefers green tea[/ADD]
[UPDATE chunk_id=\"chunk_1a2b3c4d\"]User now lives in Oslo[/UPDATE]

EXISTING KNOWLEDGE:
{knowledge}

CONVERSATION:
{conversation}
"
    )
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

enum Candidate {
    Add {
        content: String,
        category: Category,
        confidence: f32,
    },
    Update {
        target_id: String,
        content: String,
        category: Option<Category>,
    },
}

impl Candidate {
    fn content(&self) -> &str {
        match self {
            Self::Add { content, .. } | Self::Update { content, .. } => content,
        }
    }
}

/// Run one consolidation over `turns` and commit the result.
#[instrument(skip_all, fields(turns = turns.len()))]
pub async fn consolidate(
    knowledge: &KnowledgeBase,
    model: &dyn ModelClient,
    turns: &[Turn],
    opts: &ConsolidationOptions,
) -> MemoryResult<ConsolidationOutcome> {
    if turns.is_empty() {
        return Ok(ConsolidationOutcome::default());
    }

    // 1. Related knowledge for the prompt.
    let context: Vec<AtomicChunk> = if opts.context_aware && opts.context_size > 0 && !knowledge.is_empty().await {
        let query = turns
            .iter()
            .map(|t| t.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let embedding = model.embed(&query).await.map_err(MemoryError::upstream)?;
        knowledge
            .nearest(&embedding, opts.context_size, None)
            .await
            .into_iter()
            .map(|(chunk, _)| chunk)
            .collect()
    } else {
        Vec::new()
    };
    debug!(context = context.len(), "built consolidation context");

    // 2. Extraction.
    let prompt = build_extraction_prompt(turns, &context, &opts.user_name);
    let raw = model
        .complete(&prompt, &CompletionOptions::with_temperature(opts.temperature))
        .await
        .map_err(MemoryError::upstream)?;

    // 3. Parse.
    let mut plan = parse_plan(&raw);
    if plan.operations.is_empty() {
        let text = strip_reasoning(&raw);
        if opts.fallback_to_summary_chunk && !declares_nothing(text) {
            warn!("no operations parsed; committing model output as a single general chunk");
            plan.operations.push(PlanOperation::Add {
                content: text.to_string(),
                category: Category::General,
                confidence: None,
                conflicts_with: None,
            });
        } else if plan.is_unparseable() {
            warn!(
                skipped = plan.skipped.len(),
                "consolidation output contained no valid operation"
            );
            return Err(MemoryError::MalformedOutput { raw });
        }
    }

    let mut skipped = plan.skipped;
    let mut held = Vec::new();
    let mut candidates = Vec::new();
    let mut seen_hashes = HashSet::new();

    for op in plan.operations {
        let fragment = op.describe();
        match op {
            PlanOperation::Delete { .. } => {
                skipped.push(SkippedOperation::new(
                    fragment,
                    "DELETE is not applied during consolidation",
                ));
            }
            PlanOperation::Add {
                content,
                category,
                confidence,
                conflicts_with,
            } => {
                let hash = content_hash(&content);
                if !seen_hashes.insert(hash.clone()) {
                    skipped.push(SkippedOperation::new(fragment, "duplicate of an earlier candidate"));
                    continue;
                }
                if let Some(existing) = knowledge.find_by_hash(&hash).await {
                    skipped.push(SkippedOperation::new(
                        fragment,
                        format!("already stored as {existing}"),
                    ));
                    continue;
                }
                let confidence = confidence.unwrap_or(opts.default_confidence);
                if let Some(min_confidence) = opts.holding_min_confidence {
                    let reason = match conflicts_with {
                        Some(id) => Some(format!("contradicts {id}")),
                        None if confidence < min_confidence => Some(format!(
                            "confidence {confidence:.2} below {min_confidence:.2}"
                        )),
                        None => None,
                    };
                    if let Some(reason) = reason {
                        debug!(%reason, "routing candidate to holding area");
                        held.push(HeldCandidate {
                            content,
                            category,
                            confidence,
                            reason,
                        });
                        continue;
                    }
                }
                candidates.push(Candidate::Add {
                    content,
                    category,
                    confidence,
                });
            }
            PlanOperation::Update {
                target_id,
                content,
                category,
            } => candidates.push(Candidate::Update {
                target_id,
                content,
                category,
            }),
        }
    }

    // 4. Embed everything before touching the store.
    let mut embeddings = Vec::with_capacity(candidates.len());
    for candidate in &candidates {
        let embedding = model
            .embed(candidate.content())
            .await
            .map_err(MemoryError::upstream)?;
        embeddings.push(embedding);
    }

    // 5. Similarity dedup and merge policy.
    let threshold = opts.similarity_threshold;
    let mut prepared = Vec::new();
    let mut batch_embeddings: Vec<Vec<f32>> = Vec::new();
    let mut targeted: HashSet<String> = HashSet::new();

    for (candidate, embedding) in candidates.into_iter().zip(embeddings) {
        match candidate {
            Candidate::Add {
                content,
                category,
                confidence,
            } => {
                let fragment = format!("ADD [{category}] {}", truncate_str(&content, 80));
                if opts.enable_similarity_check
                    && batch_embeddings
                        .iter()
                        .any(|e| cosine_similarity(e, &embedding) >= threshold)
                {
                    skipped.push(SkippedOperation::new(
                        fragment,
                        "near-duplicate of an earlier candidate in this batch",
                    ));
                    continue;
                }

                let merge_target = if opts.enable_similarity_check
                    && opts.merge_policy == MergePolicy::SimilarityUpdate
                {
                    knowledge
                        .nearest(&embedding, 1, None)
                        .await
                        .into_iter()
                        .next()
                        .filter(|(_, similarity)| *similarity >= threshold)
                } else {
                    None
                };

                batch_embeddings.push(embedding.clone());
                match merge_target {
                    Some((existing, similarity)) => {
                        if !targeted.insert(existing.id.clone()) {
                            skipped.push(SkippedOperation::new(
                                fragment,
                                format!("{} already updated in this batch", existing.id),
                            ));
                            continue;
                        }
                        debug!(chunk = %existing.id, similarity, "merging candidate into existing chunk");
                        prepared.push(PreparedOp::Update {
                            target_id: existing.id,
                            content,
                            category: Some(category),
                            confidence: Some(confidence),
                            embedding,
                        });
                    }
                    None => prepared.push(PreparedOp::Add {
                        content,
                        category,
                        confidence,
                        embedding,
                    }),
                }
            }
            Candidate::Update {
                target_id,
                content,
                category,
            } => {
                if !targeted.insert(target_id.clone()) {
                    skipped.push(SkippedOperation::new(
                        format!("UPDATE {target_id}: {}", truncate_str(&content, 80)),
                        format!("{target_id} already updated in this batch"),
                    ));
                    continue;
                }
                prepared.push(PreparedOp::Update {
                    target_id,
                    content,
                    category,
                    confidence: None,
                    embedding,
                });
            }
        }
    }

    // 6. Commit.
    let report = knowledge.apply(prepared).await?;
    skipped.extend(report.skipped);

    let result = ConsolidationResult {
        added: report.added.len(),
        updated: report.updated.len(),
        held: held.len(),
        added_ids: report.added,
        updated_ids: report.updated,
        skipped,
        raw_output: raw,
        turns_consumed: turns.len(),
        archived_snapshot: None,
    };
    info!(
        added = result.added,
        updated = result.updated,
        held = result.held,
        skipped = result.skipped.len(),
        "consolidation committed"
    );
    Ok(ConsolidationOutcome { result, held })
}
