//! Out-of-band channels in a chat response stream.
//!
//! A response interleaves ordinary reply text with memory-write text and a
//! trailing JSON metadata block.  Callers that multiplex everything onto one
//! byte stream use [`StreamEvent::to_wire`], which prefixes the out-of-band
//! payloads with sentinel markers.

use serde::Serialize;
use serde_json::json;

use crate::consolidation::ConsolidationResult;

pub const MEMORY_CHUNK_SENTINEL: &str = "__MEMORY_CHUNK__";
pub const METADATA_SENTINEL: &str = "__METADATA__";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "channel", content = "payload", rename_all = "snake_case")]
pub enum StreamEvent {
    Reply(String),
    /// Text describing long-term memory being written.
    MemoryWrite(String),
    Metadata(serde_json::Value),
}

impl StreamEvent {
    pub fn to_wire(&self) -> String {
        match self {
            Self::Reply(text) => text.clone(),
            Self::MemoryWrite(text) => format!("{MEMORY_CHUNK_SENTINEL}{text}"),
            Self::Metadata(value) => format!("\n{METADATA_SENTINEL}{value}"),
        }
    }

    /// Metadata announcing the outcome of a turn.
    pub fn turn_metadata(consolidation: Option<&ConsolidationResult>) -> Self {
        let value = match consolidation {
            Some(result) => json!({
                "consolidated": true,
                "memory_updated": result.changed(),
                "added": result.added,
                "updated": result.updated,
                "held": result.held,
                "skipped": result.skipped.len(),
                "archived_snapshot": result.archived_snapshot,
            }),
            None => json!({ "consolidated": false, "memory_updated": false }),
        };
        Self::Metadata(value)
    }

    /// Human-readable memory-write notice for a committed consolidation.
    pub fn memory_notice(result: &ConsolidationResult) -> Option<Self> {
        if !result.changed() {
            return None;
        }
        Some(Self::MemoryWrite(format!(
            "memory updated: {} added, {} updated, {} held for review",
            result.added, result.updated, result.held
        )))
    }
}
