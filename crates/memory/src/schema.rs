use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Knowledge categories a chunk can belong to.
///
/// | Category      | Purpose                                              |
/// |---------------|------------------------------------------------------|
/// | `Preferences` | Likes, dislikes, habits and stated wishes of the user |
/// | `Facts`       | Objective statements about the user or their world   |
/// | `General`     | Everything else worth remembering                    |
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Preferences,
    Facts,
    General,
}

impl Category {
    pub const ALL: [Category; 3] = [Self::Preferences, Self::Facts, Self::General];

    /// Lowercase label used in prompts, exports and log lines.
    pub fn label(self) -> &'static str {
        match self {
            Self::Preferences => "preferences",
            Self::Facts => "facts",
            Self::General => "general",
        }
    }

    /// Parse a category from a model-produced label (case-insensitive).
    ///
    /// Accepts the singular forms models tend to emit as well.
    pub fn from_label(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "preferences" | "preference" | "prefs" => Some(Self::Preferences),
            "facts" | "fact" => Some(Self::Facts),
            "general" | "misc" | "other" => Some(Self::General),
            _ => None,
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s).ok_or_else(|| format!("unknown category '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn label(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One conversation turn.  Immutable once appended to the buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// The unit of long-term knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomicChunk {
    pub id: String,
    pub content: String,
    pub category: Category,
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    /// Set whenever an UPDATE rewrites the chunk in place.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    pub confidence: f32,
    /// SHA-256 hex of the normalised content.
    #[serde(default)]
    pub content_hash: String,
}

impl AtomicChunk {
    /// Most recent modification time (update if any, else creation).
    pub fn touched_at(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }
}

/// SHA-256 hex of `content` after trimming, lowercasing and collapsing
/// whitespace, so trivially re-worded copies hash identically.
pub fn content_hash(content: &str) -> String {
    let normalized = content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    let mut h = Sha256::new();
    h.update(normalized.as_bytes());
    format!("{:x}", h.finalize())
}

/// Truncate `s` to at most `max_chars` Unicode scalar values, returning a
/// sub-slice.  Used by the prompt builders.
pub fn truncate_str(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
