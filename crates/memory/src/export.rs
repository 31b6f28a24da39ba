//! Plain-text and JSON export/import of the chunk set.
//!
//! Embeddings are not exported; they are recomputed on import.  The text
//! format is one `[category] content` line per chunk, with `\\`, `\n` and
//! `\r` escaped so multi-line content survives the round trip.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{MemoryError, MemoryResult};
use crate::schema::{AtomicChunk, Category};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExportFormat {
    #[default]
    Json,
    Text,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "txt" => Ok(Self::Text),
            other => Err(format!("unknown export format '{other}' (expected json or text)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedChunk {
    #[serde(default)]
    pub id: Option<String>,
    pub content: String,
    pub category: Category,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExportDocument {
    exported_at: DateTime<Utc>,
    chunks: Vec<ExportedChunk>,
}

/// Render `chunks` ordered by category, then age.
pub fn export_chunks(chunks: &[AtomicChunk], format: ExportFormat) -> MemoryResult<String> {
    let mut sorted: Vec<&AtomicChunk> = chunks.iter().collect();
    sorted.sort_by(|a, b| {
        a.category
            .cmp(&b.category)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    match format {
        ExportFormat::Json => {
            let doc = ExportDocument {
                exported_at: Utc::now(),
                chunks: sorted
                    .into_iter()
                    .map(|c| ExportedChunk {
                        id: Some(c.id.clone()),
                        content: c.content.clone(),
                        category: c.category,
                        confidence: Some(c.confidence),
                        created_at: Some(c.created_at),
                    })
                    .collect(),
            };
            serde_json::to_string_pretty(&doc)
                .map_err(|err| MemoryError::Persistence(anyhow::Error::from(err)))
        }
        ExportFormat::Text => {
            let mut out = String::new();
            for chunk in sorted {
                out.push_str(&format!("[{}] {}\n", chunk.category, escape_line(&chunk.content)));
            }
            Ok(out)
        }
    }
}

/// Parse an export back into chunk records.
///
/// Text lines that are not `[category] content` are skipped with a warning
/// and counted in the second tuple element.
pub fn parse_export(format: ExportFormat, raw: &str) -> MemoryResult<(Vec<ExportedChunk>, usize)> {
    match format {
        ExportFormat::Json => {
            let doc: ExportDocument = serde_json::from_str(raw)
                .map_err(|err| MemoryError::InvalidRequest(format!("invalid JSON export: {err}")))?;
            Ok((doc.chunks, 0))
        }
        ExportFormat::Text => {
            let mut chunks = Vec::new();
            let mut skipped = 0;
            for (line_idx, line) in raw.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match parse_text_line(line) {
                    Some(chunk) => chunks.push(chunk),
                    None => {
                        skipped += 1;
                        warn!(line = line_idx + 1, "skipping malformed export line");
                    }
                }
            }
            Ok((chunks, skipped))
        }
    }
}

fn parse_text_line(line: &str) -> Option<ExportedChunk> {
    let rest = line.strip_prefix('[')?;
    let (label, content) = rest.split_once(']')?;
    let category = Category::from_label(label)?;
    let content = unescape_line(content.trim());
    if content.trim().is_empty() {
        return None;
    }
    Some(ExportedChunk {
        id: None,
        content,
        category,
        confidence: None,
        created_at: None,
    })
}

fn escape_line(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for ch in content.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// Inverse of [`escape_line`].  Unknown escapes are kept verbatim.
fn unescape_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
