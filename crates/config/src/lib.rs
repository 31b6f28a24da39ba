use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Merge policy ──────────────────────────────────────────────────────────────

/// Decides who owns near-duplicate facts produced by a consolidation run.
///
/// | Policy              | Behaviour                                                        |
/// |---------------------|------------------------------------------------------------------|
/// | `similarity-update` | A candidate whose nearest chunk is above the threshold becomes an UPDATE of that chunk. |
/// | `defer-to-audit`    | Candidates are always added; the conflict audit resolves overlaps later. |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MergePolicy {
    #[default]
    SimilarityUpdate,
    DeferToAudit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub name: String,
    pub user_name: String,
    /// System prompt used by the chat loop.  `{current_time}` is substituted.
    pub system_role: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            name: "Mnemo".to_string(),
            user_name: String::new(),
            system_role: "You are a helpful assistant with a long-term memory. \
                          The current time is {current_time}."
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub base_url: String,
    pub model: String,
    pub embedding_model: String,
    pub temperature: f32,
    /// Per-request timeout.  A timed-out call is treated exactly like an
    /// upstream failure: the operation aborts without touching memory.
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            model: "llama3.1:8b".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            temperature: 0.7,
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Root directory for the knowledge store, archive, holding area and logs.
    pub data_dir: String,
    /// Number of recent turns held in the short-term buffer.
    pub stm_size: usize,
    /// Turns since the last consolidation that trigger an automatic sleep.
    pub summary_threshold: usize,
    /// Consolidation cycles between archive snapshots.
    pub archive_threshold: usize,
    /// Maximum number of archive snapshots retained (oldest evicted first).
    pub archive_window: usize,
    /// Time-based snapshot cadence in minutes.  `0` (the default) disables it.
    pub archive_interval_minutes: u64,
    pub enable_similarity_check: bool,
    pub similarity_threshold: f32,
    /// Feed the summarization prompt a sample of related existing chunks so the
    /// model prefers UPDATE over a duplicate ADD.
    pub enable_context_aware_consolidation: bool,
    pub consolidation_context_size: usize,
    pub merge_policy: MergePolicy,
    /// Commit the raw model output as one `general` chunk when nothing parses.
    pub fallback_to_summary_chunk: bool,
    /// Confidence assigned to extracted facts when the model does not state one.
    pub default_confidence: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: ".mnemo".to_string(),
            stm_size: 10,
            summary_threshold: 5,
            archive_threshold: 5,
            archive_window: 10,
            archive_interval_minutes: 0,
            enable_similarity_check: true,
            similarity_threshold: 0.85,
            enable_context_aware_consolidation: true,
            consolidation_context_size: 10,
            merge_policy: MergePolicy::SimilarityUpdate,
            fallback_to_summary_chunk: false,
            default_confidence: 0.8,
        }
    }
}

impl MemoryConfig {
    pub fn data_path(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Similarity threshold used by the conflict audit.  Falls back to the
    /// consolidation threshold when the resolution section leaves it unset.
    pub fn conflict_threshold(&self, resolution: &ResolutionConfig) -> f32 {
        resolution
            .conflict_threshold
            .unwrap_or(self.similarity_threshold)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    /// Sampling temperature for the resolution request.  Kept low so the
    /// edit plan is stable across retries.
    pub temperature: f32,
    pub conflict_threshold: Option<f32>,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            conflict_threshold: None,
        }
    }
}

/// Legacy quarantine mode.  Off by default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldingConfig {
    pub enabled: bool,
    /// Candidates below this confidence are held for review.
    pub min_confidence: f32,
}

impl Default for HoldingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_confidence: 0.6,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub log_to_file: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_to_file: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub agent: AgentConfig,
    pub llm: LlmConfig,
    pub memory: MemoryConfig,
    pub resolution: ResolutionConfig,
    pub holding: HoldingConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.base_url = value;
            }
        }

        if let Ok(value) = env::var("MNEMO_MODEL") {
            if !value.is_empty() {
                config.llm.model = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
