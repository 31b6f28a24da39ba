//! Quarantine for candidate facts awaiting human review.
//!
//! Items stay pending until explicitly approved or rejected; there is no
//! expiry.  A reviewed item leaves the holding file.  The caller commits
//! an approved item to the knowledge store before calling [`HoldingArea::resolve`].

use std::path::PathBuf;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::consolidation::HeldCandidate;
use crate::error::{MemoryError, MemoryResult};
use crate::persist;
use crate::schema::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HoldingStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Approve,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldingItem {
    pub id: String,
    pub content: String,
    pub category: Category,
    pub confidence: f32,
    pub status: HoldingStatus,
    #[serde(default)]
    pub conflict_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HoldingFile {
    items: Vec<HoldingItem>,
}

pub struct HoldingArea {
    path: PathBuf,
    items: Vec<HoldingItem>,
}

impl HoldingArea {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let items = persist::read_json::<HoldingFile>(&path)?
            .unwrap_or_default()
            .items;
        Ok(Self { path, items })
    }

    pub fn pending(&self) -> &[HoldingItem] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> MemoryResult<&HoldingItem> {
        self.items
            .iter()
            .find(|item| item.id == id)
            .ok_or_else(|| MemoryError::NotFound(format!("holding item {id}")))
    }

    /// Quarantine new candidates.
    pub async fn hold(&mut self, candidates: Vec<HeldCandidate>) -> MemoryResult<Vec<String>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let mut next = self.items.clone();
        let mut ids = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let id = format!("hold_{}", &Uuid::new_v4().simple().to_string()[..8]);
            ids.push(id.clone());
            next.push(HoldingItem {
                id,
                content: candidate.content,
                category: candidate.category,
                confidence: candidate.confidence,
                status: HoldingStatus::Pending,
                conflict_reason: Some(candidate.reason),
                created_at: Utc::now(),
                resolved_at: None,
            });
        }
        self.save(next).await?;
        info!(held = ids.len(), pending = self.items.len(), "candidates quarantined");
        Ok(ids)
    }

    /// Remove a reviewed item and return it with its final status.
    pub async fn resolve(
        &mut self,
        id: &str,
        action: ReviewAction,
        content: Option<String>,
    ) -> MemoryResult<HoldingItem> {
        let mut item = self.get(id)?.clone();
        let next: Vec<HoldingItem> = self.items.iter().filter(|i| i.id != id).cloned().collect();
        self.save(next).await?;

        item.status = match action {
            ReviewAction::Approve => HoldingStatus::Approved,
            ReviewAction::Reject => HoldingStatus::Rejected,
        };
        if let Some(content) = content {
            item.content = content;
        }
        item.resolved_at = Some(Utc::now());
        info!(id, status = ?item.status, "holding item resolved");
        Ok(item)
    }

    async fn save(&mut self, items: Vec<HoldingItem>) -> MemoryResult<()> {
        let file = HoldingFile { items };
        persist::write_json_atomic(&self.path, &file)
            .await
            .map_err(MemoryError::persistence)?;
        self.items = file.items;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    fn candidate(content: &str) -> HeldCandidate {
        HeldCandidate {
            content: content.into(),
            category: Category::Facts,
            confidence: 0.3,
            reason: "confidence 0.30 below 0.60".into(),
        }
    }

    #[tokio::test]
    async fn hold_persists_pending_items() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("holding.json");
        let ids = {
            let mut area = HoldingArea::open(&path).unwrap();
            area.hold(vec![candidate("User might be vegan")]).await.unwrap()
        };
        let area = HoldingArea::open(&path).unwrap();
        assert_eq!(area.len(), 1);
        let item = area.get(&ids[0]).unwrap();
        assert_eq!(item.status, HoldingStatus::Pending);
        assert_eq!(item.conflict_reason.as_deref(), Some("confidence 0.30 below 0.60"));
        assert!(item.id.starts_with("hold_"));
    }

    #[tokio::test]
    async fn approve_with_edit_removes_item() {
        let dir = TempDir::new().unwrap();
        let mut area = HoldingArea::open(dir.path().join("holding.json")).unwrap();
        let ids = area.hold(vec![candidate("draft")]).await.unwrap();
        let item = area
            .resolve(&ids[0], ReviewAction::Approve, Some("edited".into()))
            .await
            .unwrap();
        assert_eq!(item.status, HoldingStatus::Approved);
        assert_eq!(item.content, "edited");
        assert!(item.resolved_at.is_some());
        assert!(area.is_empty());
    }

    #[tokio::test]
    async fn reject_discards_item() {
        let dir = TempDir::new().unwrap();
        let mut area = HoldingArea::open(dir.path().join("holding.json")).unwrap();
        let ids = area
            .hold(vec![candidate("a"), candidate("b")])
            .await
            .unwrap();
        let item = area.resolve(&ids[0], ReviewAction::Reject, None).await.unwrap();
        assert_eq!(item.status, HoldingStatus::Rejected);
        assert_eq!(area.len(), 1);
        assert_eq!(area.pending()[0].content, "b");
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let dir = TempDir::new().unwrap();
        let mut area = HoldingArea::open(dir.path().join("holding.json")).unwrap();
        let err = area
            .resolve("hold_missing", ReviewAction::Reject, None)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
    }
}
