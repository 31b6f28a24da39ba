//! Strict parser for model-produced edit plans.
//!
//! Two surface formats are accepted:
//!
//! ```text
//! [ADD category="preferences" confidence="0.9"]User likes tea[/ADD]
//! [UPDATE chunk_id="chunk_1a2b3c4d" category="facts"]User moved to Oslo[/UPDATE]
//! [DELETE chunk_id="chunk_5e6f7a8b"]
//! ```
//!
//! or a JSON document `{"operations": [{"op": "add", "content": ..., ...}]}`.
//! Every fragment that does not form a valid operation lands in
//! [`ParsedPlan::skipped`] with a reason; nothing is dropped silently.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use mnemo_llm::{extract_json_output, strip_reasoning};

use crate::error::SkippedOperation;
use crate::schema::{Category, truncate_str};

static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\s*(/?)\s*([A-Za-z_]+)((?:\s+[^\]]*)?)\s*\]").expect("static tag pattern")
});

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_]+)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"']+))"#)
        .expect("static attribute pattern")
});

static OPEN_OP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\[\s*(?:ADD|UPDATE|DELETE)\b").expect("static opening-tag pattern")
});

static ADD_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*/\s*ADD\s*\]").expect("static closing-tag pattern"));

static UPDATE_CLOSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\[\s*/\s*UPDATE\s*\]").expect("static closing-tag pattern"));

const FRAGMENT_PREVIEW_CHARS: usize = 200;

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PlanOperation {
    Add {
        content: String,
        category: Category,
        confidence: Option<f32>,
        /// Id of an existing chunk the model says this fact contradicts.
        conflicts_with: Option<String>,
    },
    Update {
        target_id: String,
        content: String,
        category: Option<Category>,
    },
    Delete {
        target_id: String,
    },
}

impl PlanOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Add { .. } => "ADD",
            Self::Update { .. } => "UPDATE",
            Self::Delete { .. } => "DELETE",
        }
    }

    pub fn target_id(&self) -> Option<&str> {
        match self {
            Self::Add { .. } => None,
            Self::Update { target_id, .. } | Self::Delete { target_id } => Some(target_id),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Add {
                content, category, ..
            } => format!("ADD [{category}] {}", truncate_str(content, 80)),
            Self::Update {
                target_id, content, ..
            } => format!("UPDATE {target_id}: {}", truncate_str(content, 80)),
            Self::Delete { target_id } => format!("DELETE {target_id}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParsedPlan {
    pub operations: Vec<PlanOperation>,
    pub skipped: Vec<SkippedOperation>,
    /// The model explicitly said there is nothing to do (`NONE`, empty
    /// output, or an empty JSON operation list).
    pub declared_empty: bool,
}

impl ParsedPlan {
    /// Nothing parsed and the model did not say "nothing to do".
    pub fn is_unparseable(&self) -> bool {
        self.operations.is_empty() && !self.declared_empty
    }

    fn skip(&mut self, fragment: &str, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(reason = %reason, fragment = %truncate_str(fragment, 80), "skipping plan fragment");
        self.skipped.push(SkippedOperation::new(
            truncate_str(fragment.trim(), FRAGMENT_PREVIEW_CHARS),
            reason,
        ));
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

/// Parse raw model output (reasoning preamble included) into a plan.
pub fn parse_plan(raw: &str) -> ParsedPlan {
    let text = strip_reasoning(raw);
    if declares_nothing(text) {
        return ParsedPlan {
            declared_empty: true,
            ..ParsedPlan::default()
        };
    }

    let tagged = parse_tagged(text);
    if !tagged.operations.is_empty() {
        return tagged;
    }

    // Brackets inside JSON string values can look like tags.
    match parse_json(text) {
        Some(mut json) => {
            let mut skipped = tagged.skipped;
            skipped.append(&mut json.skipped);
            json.skipped = skipped;
            json
        }
        None => tagged,
    }
}

/// `true` for empty output or a bare `NONE`.
pub fn declares_nothing(text: &str) -> bool {
    let trimmed = text.trim().trim_end_matches(['.', '!']);
    trimmed.is_empty() || trimmed.eq_ignore_ascii_case("none")
}

// ── Tagged format ─────────────────────────────────────────────────────────────

fn parse_tagged(text: &str) -> ParsedPlan {
    let mut plan = ParsedPlan::default();
    let mut pos = 0;

    while let Some(caps) = TAG_RE.captures_at(text, pos) {
        let Some(whole) = caps.get(0) else {
            break;
        };
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let name = caps
            .get(2)
            .map_or(String::new(), |m| m.as_str().to_ascii_uppercase());
        let attrs = parse_attrs(caps.get(3).map_or("", |m| m.as_str()));
        pos = whole.end();

        if closing {
            // `[DELETE ...][/DELETE]` is a common variation; the closer carries nothing.
            if name == "ADD" || name == "UPDATE" {
                plan.skip(whole.as_str(), "closing tag without a matching opening tag");
            }
            continue;
        }

        match name.as_str() {
            "ADD" | "UPDATE" => {
                let rest = &text[whole.end()..];
                let close_re = if name == "ADD" {
                    &ADD_CLOSE_RE
                } else {
                    &UPDATE_CLOSE_RE
                };
                let close = close_re.find(rest);
                let next_open = OPEN_OP_RE.find(rest);
                match close {
                    Some(close) if next_open.is_none_or(|n| n.start() >= close.start()) => {
                        let body = &rest[..close.start()];
                        let fragment = &text[whole.start()..whole.end() + close.end()];
                        pos = whole.end() + close.end();
                        let built = if name == "ADD" {
                            build_add(&attrs, body)
                        } else {
                            build_update(&attrs, body)
                        };
                        match built {
                            Ok(op) => plan.operations.push(op),
                            Err(reason) => plan.skip(fragment, reason),
                        }
                    }
                    _ => {
                        let end = next_open.map_or(rest.len(), |n| n.start());
                        let fragment = &text[whole.start()..whole.end() + end];
                        plan.skip(fragment, format!("unclosed [{name}] block"));
                    }
                }
            }
            "DELETE" => match build_delete(&attrs) {
                Ok(op) => plan.operations.push(op),
                Err(reason) => plan.skip(whole.as_str(), reason),
            },
            // A bare `[word]` is prose; only a tag with attributes reads as an operation.
            _ if attrs.is_empty() => {}
            other => plan.skip(whole.as_str(), format!("unknown operation `{other}`")),
        }
    }

    plan
}

fn parse_attrs(raw: &str) -> HashMap<String, String> {
    ATTR_RE
        .captures_iter(raw)
        .filter_map(|caps| {
            let key = caps.get(1)?.as_str().to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map_or("", |m| m.as_str());
            Some((key, value.trim().to_string()))
        })
        .collect()
}

fn target_attr(attrs: &HashMap<String, String>) -> Result<String, String> {
    attrs
        .get("chunk_id")
        .or_else(|| attrs.get("id"))
        .or_else(|| attrs.get("target_id"))
        .filter(|id| !id.is_empty())
        .cloned()
        .ok_or_else(|| "missing chunk_id".to_string())
}

fn category_attr(attrs: &HashMap<String, String>) -> Result<Option<Category>, String> {
    match attrs.get("category") {
        None => Ok(None),
        Some(label) if label.is_empty() => Ok(None),
        Some(label) => Category::from_label(label)
            .map(Some)
            .ok_or_else(|| format!("unknown category `{label}`")),
    }
}

fn build_add(attrs: &HashMap<String, String>, body: &str) -> Result<PlanOperation, String> {
    let content = body.trim();
    if content.is_empty() {
        return Err("empty content".to_string());
    }
    let category = category_attr(attrs)?.unwrap_or(Category::General);
    let confidence = match attrs.get("confidence") {
        None => None,
        Some(raw) => {
            let value: f32 = raw
                .parse()
                .map_err(|_| format!("invalid confidence `{raw}`"))?;
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("confidence {value} outside [0, 1]"));
            }
            Some(value)
        }
    };
    let conflicts_with = attrs
        .get("conflicts_with")
        .filter(|v| !v.is_empty())
        .cloned();
    Ok(PlanOperation::Add {
        content: content.to_string(),
        category,
        confidence,
        conflicts_with,
    })
}

fn build_update(attrs: &HashMap<String, String>, body: &str) -> Result<PlanOperation, String> {
    let target_id = target_attr(attrs)?;
    let content = body.trim();
    if content.is_empty() {
        return Err("empty content".to_string());
    }
    Ok(PlanOperation::Update {
        target_id,
        content: content.to_string(),
        category: category_attr(attrs)?,
    })
}

fn build_delete(attrs: &HashMap<String, String>) -> Result<PlanOperation, String> {
    Ok(PlanOperation::Delete {
        target_id: target_attr(attrs)?,
    })
}

// ── JSON format ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct JsonPlan {
    operations: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct JsonOperation {
    op: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default, alias = "target_id", alias = "id")]
    chunk_id: Option<String>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    conflicts_with: Option<String>,
}

fn parse_json(text: &str) -> Option<ParsedPlan> {
    let doc = extract_json_output::<JsonPlan>(text)?;
    let mut plan = ParsedPlan {
        declared_empty: doc.operations.is_empty(),
        ..ParsedPlan::default()
    };

    for value in doc.operations {
        let fragment = value.to_string();
        let op: JsonOperation = match serde_json::from_value(value) {
            Ok(op) => op,
            Err(err) => {
                plan.skip(&fragment, format!("malformed operation: {err}"));
                continue;
            }
        };

        let mut attrs = HashMap::new();
        if let Some(category) = op.category {
            attrs.insert("category".to_string(), category);
        }
        if let Some(id) = op.chunk_id {
            attrs.insert("chunk_id".to_string(), id);
        }
        if let Some(confidence) = op.confidence {
            attrs.insert("confidence".to_string(), confidence.to_string());
        }
        if let Some(conflicts_with) = op.conflicts_with {
            attrs.insert("conflicts_with".to_string(), conflicts_with);
        }
        let body = op.content.unwrap_or_default();

        let built = match op.op.trim().to_ascii_uppercase().as_str() {
            "ADD" => build_add(&attrs, &body),
            "UPDATE" => build_update(&attrs, &body),
            "DELETE" => build_delete(&attrs),
            other => Err(format!("unknown operation `{other}`")),
        };
        match built {
            Ok(op) => plan.operations.push(op),
            Err(reason) => plan.skip(&fragment, reason),
        }
    }

    Some(plan)
}
