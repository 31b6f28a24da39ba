use std::sync::Arc;

use mnemo_config::{AppConfig, MergePolicy};
use tempfile::TempDir;
use tokio::sync::watch;

use super::*;
use crate::testing::ScriptedModel;

fn config_in(dir: &TempDir) -> AppConfig {
    let mut config = AppConfig::default();
    config.memory.data_dir = dir.path().join("data").to_string_lossy().into_owned();
    config
}

fn open(config: AppConfig, model: &Arc<ScriptedModel>) -> MemorySystem {
    MemorySystem::open(config, model.clone()).unwrap()
}

async fn assert_index_matches_store(system: &MemorySystem) {
    let (store_ids, index_ids) = system.knowledge().id_sets().await;
    assert_eq!(store_ids, index_ids);
}

/// One manual consolidation cycle that adds `fact`.
async fn cycle(system: &MemorySystem, model: &ScriptedModel, fact: &str) -> ConsolidationResult {
    model.reply(format!("[ADD category=\"facts\"]{fact}[/ADD]"));
    system
        .record_turn(Turn::user(format!("by the way, {fact}")))
        .await
        .unwrap();
    system.consolidate().await.unwrap()
}

async fn contents(system: &MemorySystem) -> Vec<String> {
    let mut contents: Vec<String> = system.chunks().await.into_iter().map(|c| c.content).collect();
    contents.sort();
    contents
}

// ── Buffer-driven consolidation ─────────────────────────────────────────────

#[tokio::test]
async fn threshold_triggers_consolidation_and_resets_counter() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let mut config = config_in(&dir);
    config.memory.summary_threshold = 5;
    config.memory.stm_size = 20;
    let system = open(config, &model);

    model.reply(
        "[ADD category=\"preferences\"]User likes green tea[/ADD]\n\
         [ADD category=\"facts\"]User lives in Oslo[/ADD]",
    );

    for i in 0..4 {
        let outcome = system.record_turn(Turn::user(format!("turn {i}"))).await.unwrap();
        assert!(matches!(outcome, RecordOutcome::Buffered));
    }
    assert_eq!(model.completion_calls(), 0);

    let outcome = system.record_turn(Turn::assistant("Noted.")).await.unwrap();
    let RecordOutcome::Consolidated(result) = outcome else {
        panic!("expected consolidation, got {outcome:?}");
    };
    assert_eq!(result.added, 2);
    assert_eq!(result.turns_consumed, 5);
    assert_eq!(system.turns_since_consolidation().await, 0);

    let stats = system.stats().await;
    assert_eq!(stats.chunk_count, 2);
    assert_eq!(stats.by_category[&Category::Preferences], 1);
    assert_eq!(stats.by_category[&Category::General], 0);
    assert_eq!(stats.consolidation_count, 1);
    assert_index_matches_store(&system).await;
}

#[tokio::test]
async fn empty_buffer_consolidation_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);

    let result = system.consolidate().await.unwrap();
    assert!(!result.changed());
    assert_eq!(model.completion_calls(), 0);
    assert_eq!(system.stats().await.consolidation_count, 0);
}

#[tokio::test]
async fn json_plan_with_bracketed_content_commits() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);

    system.record_turn(Turn::user("my cat is called Miso")).await.unwrap();
    model.reply(r#"{"operations":[{"op":"add","content":"User calls the cat [Miso]","category":"facts"}]}"#);
    let result = system.consolidate().await.unwrap();
    assert_eq!(result.added, 1);
    assert!(result.skipped.is_empty());
    assert_eq!(contents(&system).await, vec!["User calls the cat [Miso]"]);
}

#[tokio::test]
async fn unconsolidated_turns_survive_restart() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    {
        let system = open(config_in(&dir), &model);
        system.record_turn(Turn::user("I adopted a cat")).await.unwrap();
        system.record_turn(Turn::assistant("Congratulations!")).await.unwrap();
    }

    let system = open(config_in(&dir), &model);
    assert_eq!(system.turns_since_consolidation().await, 2);
    let resumed: Vec<String> = system.recent_turns().await.into_iter().map(|t| t.content).collect();
    assert_eq!(resumed, vec!["I adopted a cat", "Congratulations!"]);

    model.reply("[ADD category=\"facts\"]User has a cat[/ADD]");
    let result = system.consolidate().await.unwrap();
    assert_eq!(result.turns_consumed, 2);
    assert_eq!(model.completion_calls(), 1);
    assert!(model.last_prompt().unwrap().contains("user: I adopted a cat"));

    system.record_turn(Turn::user("she is grey")).await.unwrap();
    drop(system);

    let system = open(config_in(&dir), &model);
    let resumed: Vec<String> = system.recent_turns().await.into_iter().map(|t| t.content).collect();
    assert_eq!(resumed, vec!["she is grey"]);
    assert_eq!(system.turns_since_consolidation().await, 1);
}

#[tokio::test]
async fn exchange_crossing_the_threshold_is_consolidated_whole() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let mut config = config_in(&dir);
    config.memory.summary_threshold = 3;
    let system = open(config, &model);

    let outcome = system
        .record_turns(vec![Turn::user("hi"), Turn::assistant("hello")])
        .await
        .unwrap();
    assert!(matches!(outcome, RecordOutcome::Buffered));

    model.reply("NONE");
    let outcome = system
        .record_turns(vec![Turn::user("I like chess"), Turn::assistant("Nice, chess is fun")])
        .await
        .unwrap();
    let result = match outcome {
        RecordOutcome::Consolidated(result) => result,
        other => panic!("expected a consolidation, got {other:?}"),
    };
    assert_eq!(result.turns_consumed, 4);
    assert!(model.last_prompt().unwrap().contains("assistant: Nice, chess is fun"));
    assert!(system.recent_turns().await.is_empty());
}

#[tokio::test]
async fn none_reply_consumes_the_buffer_without_changes() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);

    system.record_turn(Turn::user("hello there")).await.unwrap();
    model.reply("NONE");
    let result = system.consolidate().await.unwrap();
    assert!(!result.changed());
    assert_eq!(system.stats().await.buffer_len, 0);
    assert!(system.chunks().await.is_empty());
}

#[tokio::test]
async fn exact_duplicates_are_skipped() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);

    cycle(&system, &model, "User has a cat named Miso").await;
    let result = cycle(&system, &model, "user has a cat  named miso").await;
    assert_eq!(result.added, 0);
    assert_eq!(result.skipped.len(), 1);
    assert!(result.skipped[0].reason.starts_with("already stored as chunk_"));
    assert_eq!(system.chunks().await.len(), 1);
}

// ── Failure handling ────────────────────────────────────────────────────────

#[tokio::test]
async fn upstream_failure_leaves_buffer_and_store_untouched() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let mut config = config_in(&dir);
    config.memory.summary_threshold = 2;
    let system = open(config, &model);

    model.fail_next_completion("connection refused");
    system.record_turn(Turn::user("I adopted a dog")).await.unwrap();
    let outcome = system.record_turn(Turn::assistant("Congrats!")).await.unwrap();
    let RecordOutcome::ConsolidationFailed(err) = outcome else {
        panic!("expected failure, got {outcome:?}");
    };
    assert!(err.is_retryable());

    let stats = system.stats().await;
    assert_eq!(stats.buffer_len, 2);
    assert_eq!(stats.turns_since_consolidation, 2);
    assert_eq!(stats.chunk_count, 0);
    assert_eq!(stats.consolidation_count, 0);
    assert!(!system.knowledge().path().exists());

    // Retry succeeds with the same turns.
    model.reply("[ADD category=\"facts\"]User has a dog[/ADD]");
    let result = system.consolidate().await.unwrap();
    assert_eq!(result.added, 1);
    assert_eq!(result.turns_consumed, 2);
    assert_eq!(system.stats().await.buffer_len, 0);
}

#[tokio::test]
async fn embedding_failure_aborts_before_commit() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);

    system.record_turn(Turn::user("I play chess")).await.unwrap();
    model.reply("[ADD category=\"facts\"]User plays chess[/ADD]");
    model.set_embeddings_failing(true);
    let err = system.consolidate().await.unwrap_err();
    assert!(matches!(err, MemoryError::Upstream(_)));
    assert!(system.chunks().await.is_empty());
    assert_eq!(system.stats().await.buffer_len, 1);
}

#[tokio::test]
async fn malformed_output_keeps_the_buffer() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);

    system.record_turn(Turn::user("I like hiking")).await.unwrap();
    model.reply("The user seems outdoorsy and friendly.");
    let err = system.consolidate().await.unwrap_err();
    assert!(matches!(err, MemoryError::MalformedOutput { .. }));
    assert!(!err.is_retryable());
    assert_eq!(system.stats().await.buffer_len, 1);
    assert!(system.chunks().await.is_empty());
}

#[tokio::test]
async fn fallback_commits_unparsed_output_as_general_chunk() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let mut config = config_in(&dir);
    config.memory.fallback_to_summary_chunk = true;
    let system = open(config, &model);

    system.record_turn(Turn::user("I like hiking")).await.unwrap();
    model.reply("<think>hmm</think>User enjoys hiking on weekends.");
    let result = system.consolidate().await.unwrap();
    assert_eq!(result.added, 1);
    let chunks = system.list_by_category(Category::General).await;
    assert_eq!(chunks[0].content, "User enjoys hiking on weekends.");
}

// ── Similarity merge policy ─────────────────────────────────────────────────

async fn seeded_tea_system(dir: &TempDir, policy: MergePolicy) -> (Arc<ScriptedModel>, MemorySystem) {
    let model = Arc::new(ScriptedModel::new());
    model.pin("User likes tea", &[1.0, 0.0]);
    model.pin("User loves tea", &[0.95, 0.312_25]);
    let mut config = config_in(dir);
    config.memory.merge_policy = policy;
    let system = open(config, &model);
    system
        .import(ExportFormat::Text, "[preferences] User likes tea\n")
        .await
        .unwrap();
    (model, system)
}

#[tokio::test]
async fn similarity_update_merges_into_nearest_chunk() {
    let dir = TempDir::new().unwrap();
    let (model, system) = seeded_tea_system(&dir, MergePolicy::SimilarityUpdate).await;

    let result = cycle(&system, &model, "User loves tea").await;
    assert_eq!(result.added, 0);
    assert_eq!(result.updated, 1);
    assert_eq!(contents(&system).await, vec!["User loves tea"]);
    assert_index_matches_store(&system).await;
}

#[tokio::test]
async fn defer_to_audit_adds_and_leaves_conflict_for_resolution() {
    let dir = TempDir::new().unwrap();
    let (model, system) = seeded_tea_system(&dir, MergePolicy::DeferToAudit).await;

    let result = cycle(&system, &model, "User loves tea").await;
    assert_eq!(result.added, 1);
    assert_eq!(result.updated, 0);
    assert_eq!(system.chunks().await.len(), 2);
    assert_eq!(system.scan_conflicts(Some(0.85)).await.len(), 1);
}

// ── Conflict resolution ─────────────────────────────────────────────────────

#[tokio::test]
async fn merge_plan_removes_one_chunk_and_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    model.pin("User likes tea", &[1.0, 0.0]);
    model.pin("User prefers tea over coffee", &[0.9, 0.435_89]);
    let system = open(config_in(&dir), &model);
    system
        .import(
            ExportFormat::Text,
            "[preferences] User likes tea\n[preferences] User prefers tea over coffee\n",
        )
        .await
        .unwrap();

    let conflicts = system.scan_conflicts(Some(0.85)).await;
    assert_eq!(conflicts.len(), 1);
    let pair = &conflicts[0];
    assert!(pair.similarity >= 0.85);

    model.reply(format!(
        "[UPDATE chunk_id=\"{}\"]User prefers tea over coffee[/UPDATE]\n[DELETE chunk_id=\"{}\"]",
        pair.chunk_a, pair.chunk_b
    ));
    let result = system.resolve_pairs(&conflicts).await.unwrap();
    assert_eq!(model.pending_replies(), 0);
    assert_eq!(result.conflicts, 1);
    assert_eq!(result.updated, 1);
    assert_eq!(result.deleted, 1);
    assert_eq!(contents(&system).await, vec!["User prefers tea over coffee"]);
    assert_index_matches_store(&system).await;

    let calls = model.completion_calls();
    let second = system.resolve_conflicts(Some(0.85)).await.unwrap();
    assert_eq!(second.total_operations(), 0);
    assert_eq!(model.completion_calls(), calls);
}

#[tokio::test]
async fn no_near_duplicates_means_no_operations() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);
    system
        .import(ExportFormat::Text, "[facts] User has a dog\n[preferences] User likes jazz\n")
        .await
        .unwrap();

    let result = system.resolve_conflicts(None).await.unwrap();
    assert_eq!(result.conflicts, 0);
    assert_eq!(result.total_operations(), 0);
    assert_eq!(model.completion_calls(), 0);
}

#[tokio::test]
async fn resolution_cannot_touch_chunks_outside_the_conflict() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    model.pin("User likes tea", &[1.0, 0.0]);
    model.pin("User drinks tea daily", &[0.95, 0.312_25]);
    let system = open(config_in(&dir), &model);
    system
        .import(
            ExportFormat::Text,
            "[preferences] User likes tea\n[facts] User drinks tea daily\n[facts] User has a dog\n",
        )
        .await
        .unwrap();
    let bystander = system
        .list_by_category(Category::Facts)
        .await
        .into_iter()
        .find(|c| c.content == "User has a dog")
        .unwrap();

    let conflicts = system.scan_conflicts(None).await;
    model.reply(format!("[DELETE chunk_id=\"{}\"]", bystander.id));
    let result = system.resolve_pairs(&conflicts).await.unwrap();
    assert_eq!(result.deleted, 0);
    assert_eq!(result.skipped.len(), 1);
    assert!(system.get_chunk(&bystander.id).await.is_ok());
}

#[tokio::test]
async fn dissimilar_pairs_are_not_sent_to_the_model() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);
    system
        .import(ExportFormat::Text, "[facts] User has a dog\n[preferences] User likes jazz\n")
        .await
        .unwrap();
    let chunks = system.chunks().await;
    let claimed = vec![ConflictPair {
        chunk_a: chunks[0].id.clone(),
        chunk_b: chunks[1].id.clone(),
        similarity: 0.99,
    }];

    model.reply(format!("[DELETE chunk_id=\"{}\"]", chunks[0].id));
    let result = system.resolve_pairs(&claimed).await.unwrap();
    assert_eq!(result.conflicts, 0);
    assert_eq!(result.total_operations(), 0);
    assert_eq!(model.completion_calls(), 0);
    assert_eq!(model.pending_replies(), 1);
    assert_eq!(system.chunks().await.len(), 2);
}

async fn tea_conflict(dir: &TempDir) -> (Arc<ScriptedModel>, MemorySystem, Vec<ConflictPair>) {
    let model = Arc::new(ScriptedModel::new());
    model.pin("User likes tea", &[1.0, 0.0]);
    model.pin("User prefers tea over coffee", &[0.9, 0.435_89]);
    let system = open(config_in(dir), &model);
    system
        .import(
            ExportFormat::Text,
            "[preferences] User likes tea\n[preferences] User prefers tea over coffee\n",
        )
        .await
        .unwrap();
    let conflicts = system.scan_conflicts(None).await;
    assert_eq!(conflicts.len(), 1);
    (model, system, conflicts)
}

#[tokio::test]
async fn unparseable_resolution_reply_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let (model, system, conflicts) = tea_conflict(&dir).await;
    let before = contents(&system).await;

    let reply = "<think>hmm</think>These two look fine to me, [honestly].";
    model.reply(reply);
    let err = system.resolve_pairs(&conflicts).await.unwrap_err();
    match err {
        MemoryError::MalformedOutput { raw } => assert_eq!(raw, reply),
        other => panic!("expected malformed output, got {other:?}"),
    }
    assert_eq!(contents(&system).await, before);
    assert_index_matches_store(&system).await;
}

#[tokio::test]
async fn partially_malformed_resolution_commits_the_valid_operations() {
    let dir = TempDir::new().unwrap();
    let (model, system, conflicts) = tea_conflict(&dir).await;
    let pair = &conflicts[0];

    model.reply(format!(
        "[UPDATE chunk_id=\"{}\"]User prefers tea over coffee, always[/UPDATE]\n\
         [DELETE]\n\
         [ADD category=\"hobbies\"]User paints[/ADD]\n\
         [DELETE chunk_id=\"{}\"]",
        pair.chunk_a, pair.chunk_b
    ));
    let result = system.resolve_pairs(&conflicts).await.unwrap();
    assert_eq!(result.updated, 1);
    assert_eq!(result.deleted, 1);
    assert_eq!(result.added, 0);
    assert_eq!(result.skipped.len(), 2);
    assert!(result.raw_output.contains("[ADD category=\"hobbies\"]"));
    assert_eq!(contents(&system).await, vec!["User prefers tea over coffee, always"]);
    assert_index_matches_store(&system).await;
}

// ── Archive ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn snapshot_after_threshold_cycles() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let mut config = config_in(&dir);
    config.memory.archive_threshold = 5;
    config.memory.summary_threshold = 0;
    let system = open(config, &model);

    for i in 0..4 {
        let result = cycle(&system, &model, &format!("Fact number {i}")).await;
        assert_eq!(result.archived_snapshot, None);
    }
    assert!(system.archives().await.is_empty());

    let result = cycle(&system, &model, "Fact number 4").await;
    assert_eq!(result.archived_snapshot, Some(0));
    let archives = system.archives().await;
    assert_eq!(archives.len(), 1);
    assert_eq!(archives[0].chunk_count, 5);
    assert_eq!(system.stats().await.cycles_since_snapshot, 0);
}

#[tokio::test]
async fn window_evicts_the_oldest_snapshot() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let mut config = config_in(&dir);
    config.memory.archive_threshold = 1;
    config.memory.archive_window = 10;
    config.memory.summary_threshold = 0;
    let system = open(config, &model);

    for i in 0..11 {
        cycle(&system, &model, &format!("Fact number {i}")).await;
    }
    let archives = system.archives().await;
    assert_eq!(archives.len(), 10);
    assert_eq!(archives[0].index, 1);
    assert!(matches!(system.restore(0).await, Err(MemoryError::NotFound(_))));
}

#[tokio::test]
async fn restore_returns_exactly_the_snapshot_chunks() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let mut config = config_in(&dir);
    config.memory.archive_threshold = 0;
    config.memory.summary_threshold = 0;
    let system = open(config, &model);

    cycle(&system, &model, "User has a dog").await;
    cycle(&system, &model, "User lives in Oslo").await;
    let snapshot = system.snapshot_now().await.unwrap();
    let before = system.list_by_category(Category::Facts).await;

    cycle(&system, &model, "User plays chess").await;
    cycle(&system, &model, "User speaks Norwegian").await;
    assert_eq!(system.chunks().await.len(), 4);

    let restored = system.restore(snapshot.index).await.unwrap();
    assert_eq!(restored, 2);
    assert_eq!(system.list_by_category(Category::Facts).await, before);
    assert_index_matches_store(&system).await;

    // New chunks never reuse ids dropped by the restore.
    let result = cycle(&system, &model, "User collects stamps").await;
    let (store_ids, _) = system.knowledge().id_sets().await;
    assert_eq!(store_ids.len(), 3);
    assert!(before.iter().all(|c| c.id != result.added_ids[0]));
}

#[tokio::test]
async fn archive_task_is_disabled_without_interval_and_stops_on_shutdown() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let (tx, _rx) = watch::channel(false);

    let system = Arc::new(open(config_in(&dir), &model));
    assert!(system.spawn_archive_task(&tx).is_none());

    let other = TempDir::new().unwrap();
    let mut config = config_in(&other);
    config.memory.archive_interval_minutes = 60;
    let system = Arc::new(open(config, &model));
    let handle = system.spawn_archive_task(&tx).unwrap();
    tx.send(true).unwrap();
    handle.await.unwrap();
    assert!(system.archives().await.is_empty());
}

// ── Holding area ────────────────────────────────────────────────────────────

fn holding_config(dir: &TempDir) -> AppConfig {
    let mut config = config_in(dir);
    config.holding.enabled = true;
    config.holding.min_confidence = 0.6;
    config
}

#[tokio::test]
async fn low_confidence_candidates_are_held_and_approved() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(holding_config(&dir), &model);

    system.record_turn(Turn::user("I mostly eat plants")).await.unwrap();
    model.reply(
        "[ADD category=\"facts\" confidence=\"0.3\"]User might be vegan[/ADD]\n\
         [ADD category=\"preferences\"]User likes jazz[/ADD]",
    );
    let result = system.consolidate().await.unwrap();
    assert_eq!(result.added, 1);
    assert_eq!(result.held, 1);

    let held = system.holding_items().await;
    assert_eq!(held.len(), 1);
    assert_eq!(held[0].content, "User might be vegan");

    let review = system
        .review_holding(&held[0].id, ReviewAction::Approve, Some("User is vegan".into()))
        .await
        .unwrap();
    assert_eq!(review.item.status, crate::holding::HoldingStatus::Approved);
    let chunk = system.get_chunk(&review.chunk_id.unwrap()).await.unwrap();
    assert_eq!(chunk.content, "User is vegan");
    assert_eq!(chunk.category, Category::Facts);
    assert!((chunk.confidence - 0.8).abs() < f32::EPSILON);
    assert!(system.holding_items().await.is_empty());
    assert_index_matches_store(&system).await;
}

#[tokio::test]
async fn contradicting_candidates_are_held_and_rejected() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(holding_config(&dir), &model);
    system
        .import(ExportFormat::Text, "[facts] User lives in Oslo\n")
        .await
        .unwrap();
    let existing = system.chunks().await.remove(0);

    system.record_turn(Turn::user("I live in Bergen now")).await.unwrap();
    model.reply(format!(
        "[ADD category=\"facts\" conflicts_with=\"{}\"]User lives in Bergen[/ADD]",
        existing.id
    ));
    let result = system.consolidate().await.unwrap();
    assert_eq!(result.held, 1);

    let held = system.holding_items().await;
    assert_eq!(
        held[0].conflict_reason.as_deref(),
        Some(format!("contradicts {}", existing.id).as_str())
    );
    let review = system
        .review_holding(&held[0].id, ReviewAction::Reject, None)
        .await
        .unwrap();
    assert!(review.chunk_id.is_none());
    assert_eq!(contents(&system).await, vec!["User lives in Oslo"]);

    let err = system
        .review_holding(&held[0].id, ReviewAction::Reject, None)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::NotFound(_)));
}

#[tokio::test]
async fn holding_disabled_commits_directly() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);

    system.record_turn(Turn::user("maybe vegan")).await.unwrap();
    model.reply("[ADD category=\"facts\" confidence=\"0.3\"]User might be vegan[/ADD]");
    let result = system.consolidate().await.unwrap();
    assert_eq!(result.added, 1);
    assert_eq!(result.held, 0);
}

#[tokio::test]
async fn approving_already_stored_content_reuses_the_chunk() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(holding_config(&dir), &model);
    system
        .import(ExportFormat::Text, "[facts] User is vegan\n")
        .await
        .unwrap();
    let existing = system.chunks().await.remove(0);

    system.record_turn(Turn::user("no meat for me")).await.unwrap();
    model.reply("[ADD category=\"facts\" confidence=\"0.3\"]User might be vegan[/ADD]");
    system.consolidate().await.unwrap();
    let held = system.holding_items().await;
    assert_eq!(held.len(), 1);

    let embeds = model.embed_calls();
    let review = system
        .review_holding(&held[0].id, ReviewAction::Approve, Some("user is  VEGAN".into()))
        .await
        .unwrap();
    assert_eq!(review.chunk_id.as_deref(), Some(existing.id.as_str()));
    assert_eq!(model.embed_calls(), embeds);
    assert_eq!(system.chunks().await.len(), 1);
    assert!(system.holding_items().await.is_empty());
}

// ── Export / import / reopen ────────────────────────────────────────────────

#[tokio::test]
async fn export_import_round_trip_into_empty_store() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);
    cycle(&system, &model, "User has a dog").await;
    system.record_turn(Turn::user("jazz!")).await.unwrap();
    model.reply("[ADD category=\"preferences\"]User likes jazz[/ADD]");
    system.consolidate().await.unwrap();
    cycle(&system, &model, "User has\ntwo cats, one is C:\\Miso").await;

    for format in [ExportFormat::Json, ExportFormat::Text] {
        let exported = system.export(format).await.unwrap();
        let other = TempDir::new().unwrap();
        let target = open(config_in(&other), &model);
        let report = target.import(format, &exported).await.unwrap();
        assert_eq!(report.imported, 3);
        assert_eq!(report.skipped, 0);
        assert_eq!(contents(&target).await, contents(&system).await);
        assert_eq!(
            target.stats().await.by_category,
            system.stats().await.by_category
        );
        assert_index_matches_store(&target).await;
    }
}

#[tokio::test]
async fn import_refuses_non_empty_store() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);
    system
        .import(ExportFormat::Text, "[facts] User has a dog\n")
        .await
        .unwrap();
    let err = system
        .import(ExportFormat::Text, "[facts] User has a cat\n")
        .await
        .unwrap_err();
    assert!(matches!(err, MemoryError::InvalidRequest(_)));
}

#[tokio::test]
async fn clear_empties_store_and_buffer_and_allows_import() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let mut config = config_in(&dir);
    config.memory.archive_threshold = 1;
    let system = open(config.clone(), &model);
    cycle(&system, &model, "User has a dog").await;
    let old_id = system.chunks().await.remove(0).id;
    system.record_turn(Turn::user("pending turn")).await.unwrap();

    assert_eq!(system.clear().await.unwrap(), 1);
    assert!(system.chunks().await.is_empty());
    assert!(system.recent_turns().await.is_empty());
    assert_eq!(system.turns_since_consolidation().await, 0);
    assert_eq!(system.archives().await.len(), 1);
    assert_index_matches_store(&system).await;
    drop(system);

    let system = open(config, &model);
    assert!(system.chunks().await.is_empty());
    assert!(system.recent_turns().await.is_empty());

    system
        .import(ExportFormat::Text, "[facts] User has a dog\n")
        .await
        .unwrap();
    let chunks = system.chunks().await;
    assert_eq!(chunks.len(), 1);
    assert_ne!(chunks[0].id, old_id);
}

#[tokio::test]
async fn state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    {
        let mut config = holding_config(&dir);
        config.memory.archive_threshold = 1;
        let system = open(config, &model);
        system.record_turn(Turn::user("facts")).await.unwrap();
        model.reply(
            "[ADD category=\"facts\"]User has a dog[/ADD]\n\
             [ADD category=\"facts\" confidence=\"0.2\"]User may own a boat[/ADD]",
        );
        system.consolidate().await.unwrap();
    }

    let system = open(holding_config(&dir), &model);
    assert_eq!(contents(&system).await, vec!["User has a dog"]);
    assert_eq!(system.holding_items().await.len(), 1);
    assert_eq!(system.archives().await.len(), 1);
    assert_eq!(system.stats().await.consolidation_count, 1);
    assert_index_matches_store(&system).await;
}

// ── Retrieval ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn relevant_chunks_skip_embedding_on_empty_store() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);
    assert!(system.relevant_chunks("tea?", 3).await.unwrap().is_empty());
    assert_eq!(model.embed_calls(), 0);
}

#[tokio::test]
async fn relevant_chunks_rank_by_similarity() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    model.pin("User likes tea", &[1.0, 0.0]);
    model.pin("User has a dog", &[0.0, 1.0]);
    model.pin("what do I drink?", &[0.9, 0.1]);
    let system = open(config_in(&dir), &model);
    system
        .import(ExportFormat::Text, "[facts] User has a dog\n[preferences] User likes tea\n")
        .await
        .unwrap();

    let hits = system.relevant_chunks("what do I drink?", 1).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].0.content, "User likes tea");
}

#[tokio::test]
async fn consolidation_prompt_includes_related_knowledge() {
    let dir = TempDir::new().unwrap();
    let model = Arc::new(ScriptedModel::new());
    let system = open(config_in(&dir), &model);
    cycle(&system, &model, "User has a dog").await;
    cycle(&system, &model, "User lives in Oslo").await;

    let prompt = model.last_prompt().unwrap();
    assert!(prompt.contains("(facts): User has a dog"));
    assert!(prompt.contains("user: by the way, User lives in Oslo"));
}
