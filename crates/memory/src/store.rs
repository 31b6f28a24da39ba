use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::schema::{AtomicChunk, Category};

/// Id-keyed chunk records plus every id ever retired.
///
/// Retired ids are kept forever so `allocate_id` never hands out an id that
/// was used before, even after the chunk is gone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkStore {
    chunks: BTreeMap<String, AtomicChunk>,
    #[serde(default)]
    retired: BTreeSet<String>,
}

impl ChunkStore {
    /// A fresh `chunk_xxxxxxxx` id unused by live and retired chunks.
    pub fn allocate_id(&self) -> String {
        loop {
            let hex = Uuid::new_v4().simple().to_string();
            let id = format!("chunk_{}", &hex[..8]);
            if !self.chunks.contains_key(&id) && !self.retired.contains(&id) {
                return id;
            }
        }
    }

    pub fn is_retired(&self, id: &str) -> bool {
        self.retired.contains(id)
    }

    /// Insert or replace by id.  Returns `true` when the id was new.
    pub fn add_or_update(&mut self, chunk: AtomicChunk) -> bool {
        self.retired.remove(&chunk.id);
        self.chunks.insert(chunk.id.clone(), chunk).is_none()
    }

    pub fn delete(&mut self, id: &str) -> Option<AtomicChunk> {
        let removed = self.chunks.remove(id)?;
        self.retired.insert(removed.id.clone());
        Some(removed)
    }

    pub fn get(&self, id: &str) -> Option<&AtomicChunk> {
        self.chunks.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.chunks.contains_key(id)
    }

    /// Chunks of one category, oldest first.
    pub fn list_by_category(&self, category: Category) -> Vec<&AtomicChunk> {
        let mut out: Vec<&AtomicChunk> = self
            .chunks
            .values()
            .filter(|c| c.category == category)
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        out
    }

    pub fn find_by_hash(&self, hash: &str) -> Option<&AtomicChunk> {
        self.chunks.values().find(|c| c.content_hash == hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AtomicChunk> {
        self.chunks.values()
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.chunks.keys().cloned().collect()
    }

    /// Swap the live set for `chunks`.  Ids that drop out are retired.
    pub fn replace_all(&mut self, chunks: Vec<AtomicChunk>) {
        let incoming: BTreeSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        let dropped: Vec<String> = self
            .chunks
            .keys()
            .filter(|id| !incoming.contains(id.as_str()))
            .cloned()
            .collect();
        self.retired.extend(dropped);
        self.chunks.clear();
        for chunk in chunks {
            self.add_or_update(chunk);
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}
