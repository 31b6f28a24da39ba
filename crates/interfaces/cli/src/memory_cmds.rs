use std::fs;
use std::io;
use std::io::IsTerminal;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, bail};

use mnemo_memory::schema::truncate_str;
use mnemo_memory::{
    Category, ConsolidationResult, ExportFormat, MemorySystem, ResolutionResult, ReviewAction,
    SkippedOperation,
};

pub(crate) async fn run_sleep(system: &MemorySystem) -> Result<()> {
    let result = system.consolidate().await?;
    print_consolidation_report(&result);
    Ok(())
}

fn print_consolidation_report(result: &ConsolidationResult) {
    if result.turns_consumed == 0 {
        println!("nothing to consolidate");
        return;
    }
    println!("consolidation complete ({} turns)", result.turns_consumed);
    println!("- added:   {}", result.added);
    println!("- updated: {}", result.updated);
    println!("- held:    {}", result.held);
    if let Some(index) = result.archived_snapshot {
        println!("- archive snapshot {index} written");
    }
    print_skipped(&result.skipped);
}

fn print_skipped(skipped: &[SkippedOperation]) {
    if skipped.is_empty() {
        return;
    }
    println!("- skipped: {}", skipped.len());
    for op in skipped {
        println!("    {} ({})", truncate_str(&op.fragment, 80), op.reason);
    }
}

pub(crate) async fn run_chunks(system: &MemorySystem, category: Option<Category>) {
    let chunks = match category {
        Some(category) => system.list_by_category(category).await,
        None => system.chunks().await,
    };
    if chunks.is_empty() {
        println!("(no knowledge chunks)");
        return;
    }
    for chunk in &chunks {
        println!(
            "{}  [{}] {} (confidence {:.2}, {})",
            chunk.id,
            chunk.category,
            chunk.content,
            chunk.confidence,
            chunk.touched_at().format("%Y-%m-%d %H:%M")
        );
    }
    println!("({} chunks)", chunks.len());
}

pub(crate) async fn run_conflicts_scan(system: &MemorySystem, threshold: Option<f32>) {
    let pairs = system.scan_conflicts(threshold).await;
    if pairs.is_empty() {
        println!("no conflicts found");
        return;
    }
    println!("── conflicts ────────────────────────────────────────");
    for pair in &pairs {
        let a = system.get_chunk(&pair.chunk_a).await.map(|c| c.content).unwrap_or_default();
        let b = system.get_chunk(&pair.chunk_b).await.map(|c| c.content).unwrap_or_default();
        println!("  {:.1}%  {} ↔ {}", pair.similarity * 100.0, pair.chunk_a, pair.chunk_b);
        println!("         {}", truncate_str(&a, 80));
        println!("         {}", truncate_str(&b, 80));
    }
    println!("  ({} pairs)", pairs.len());
}

pub(crate) async fn run_conflicts_resolve(system: &MemorySystem, threshold: Option<f32>) -> Result<()> {
    let result = system.resolve_conflicts(threshold).await?;
    print_resolution_report(&result);
    Ok(())
}

fn print_resolution_report(result: &ResolutionResult) {
    if result.conflicts == 0 {
        println!("no conflicts to resolve");
        return;
    }
    println!("resolved {} conflicts", result.conflicts);
    println!("- added:   {}", result.added);
    println!("- updated: {}", result.updated);
    println!("- deleted: {}", result.deleted);
    print_skipped(&result.skipped);
}

pub(crate) async fn run_archive_list(system: &MemorySystem) {
    let archives = system.archives().await;
    if archives.is_empty() {
        println!("(no archive snapshots)");
        return;
    }
    println!("── archive snapshots ────────────────────────────────");
    for summary in &archives {
        println!(
            "  #{:<4} {}  {} chunks",
            summary.index,
            summary.created_at.format("%Y-%m-%d %H:%M:%S"),
            summary.chunk_count
        );
    }
}

pub(crate) async fn run_archive_snapshot(system: &MemorySystem) -> Result<()> {
    let summary = system.snapshot_now().await?;
    println!(
        "archive snapshot {} written ({} chunks)",
        summary.index, summary.chunk_count
    );
    Ok(())
}

pub(crate) async fn run_archive_restore(system: &MemorySystem, index: u64, yes: bool) -> Result<()> {
    let archives = system.archives().await;
    let Some(summary) = archives.iter().find(|s| s.index == index) else {
        bail!("archive snapshot {index} is not retained (see `mnemo archive list`)");
    };
    let current = system.stats().await.chunk_count;

    println!("⚠️  destructive operation: archive restore");
    println!("- snapshot: #{index} ({})", summary.created_at.format("%Y-%m-%d %H:%M:%S"));
    println!("- snapshot chunks: {}", summary.chunk_count);
    println!("- current chunks:  {current} (all replaced)");

    if !yes {
        if !io::stdin().is_terminal() {
            bail!("refusing archive restore in non-interactive mode without --yes");
        }

        let expected = format!("RESTORE {index}");
        print!("This replaces the whole knowledge store. Type '{expected}' to continue: ");
        io::stdout().flush()?;

        let mut confirmation = String::new();
        io::stdin().read_line(&mut confirmation)?;
        if confirmation.trim() != expected {
            println!("restore cancelled");
            return Ok(());
        }
    }

    let restored = system.restore(index).await?;
    println!("restore complete: {restored} chunks from snapshot #{index}");
    Ok(())
}

pub(crate) async fn run_clear(system: &MemorySystem, yes: bool) -> Result<()> {
    let stats = system.stats().await;

    println!("⚠️  destructive operation: memory clear");
    println!("- chunks removed:  {}", stats.chunk_count);
    println!("- buffered turns:  {}", stats.buffer_len);
    println!("- archive snapshots kept: {}", stats.archive_count);

    if !yes {
        if !io::stdin().is_terminal() {
            bail!("refusing memory clear in non-interactive mode without --yes");
        }

        print!("This deletes all long-term knowledge. Type 'CLEAR' to continue: ");
        io::stdout().flush()?;

        let mut confirmation = String::new();
        io::stdin().read_line(&mut confirmation)?;
        if confirmation.trim() != "CLEAR" {
            println!("clear cancelled");
            return Ok(());
        }
    }

    let removed = system.clear().await?;
    println!("memory cleared: {removed} chunks removed");
    Ok(())
}

pub(crate) async fn run_holding_list(system: &MemorySystem) {
    let items = system.holding_items().await;
    if items.is_empty() {
        println!("(holding area is empty)");
        return;
    }
    println!("── holding area ─────────────────────────────────────");
    for item in &items {
        println!(
            "  {}  [{}] {} (confidence {:.2})",
            item.id, item.category, item.content, item.confidence
        );
        if let Some(reason) = &item.conflict_reason {
            println!("      reason: {reason}");
        }
    }
}

pub(crate) async fn run_holding_approve(system: &MemorySystem, id: &str, content: Option<String>) -> Result<()> {
    let review = system.review_holding(id, ReviewAction::Approve, content).await?;
    let chunk_id = review.chunk_id.unwrap_or_default();
    println!("approved {id} as {chunk_id}: {}", review.item.content);
    Ok(())
}

pub(crate) async fn run_holding_reject(system: &MemorySystem, id: &str) -> Result<()> {
    let review = system.review_holding(id, ReviewAction::Reject, None).await?;
    println!("rejected {id}: {}", review.item.content);
    Ok(())
}

pub(crate) async fn run_export(system: &MemorySystem, format: ExportFormat, out: Option<&Path>) -> Result<()> {
    let rendered = system.export(format).await?;
    match out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(path, &rendered).with_context(|| format!("write export {}", path.display()))?;
            println!("exported {} chunks to {}", system.stats().await.chunk_count, path.display());
        }
        None => print!("{rendered}"),
    }
    Ok(())
}

pub(crate) async fn run_import(system: &MemorySystem, path: &Path, format: ExportFormat) -> Result<()> {
    let raw = fs::read_to_string(path).with_context(|| format!("read import {}", path.display()))?;
    let report = system.import(format, &raw).await?;
    println!("imported {} chunks ({} lines skipped)", report.imported, report.skipped);
    Ok(())
}

pub(crate) async fn run_stats(system: &MemorySystem) {
    let stats = system.stats().await;
    println!("── memory stats ─────────────────────────────────────");
    println!("  buffer:              {}/{}", stats.buffer_len, stats.buffer_capacity);
    println!("  since consolidation: {}", stats.turns_since_consolidation);
    println!("  consolidations:      {}", stats.consolidation_count);
    println!("  chunks:              {}", stats.chunk_count);
    for (category, count) in &stats.by_category {
        println!("    {category}: {count}");
    }
    println!("  archive snapshots:   {}", stats.archive_count);
    println!("  since snapshot:      {}", stats.cycles_since_snapshot);
    println!("  pending review:      {}", stats.pending_holding);
}
