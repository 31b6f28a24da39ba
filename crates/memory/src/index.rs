//! In-memory nearest-neighbour index over chunk embeddings.
//!
//! Holds only `id → embedding` back-references; chunk content lives in the
//! [`ChunkStore`](crate::store::ChunkStore).  Search is exhaustive cosine
//! similarity, which is exact and fast enough for a single user's store.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::store::ChunkStore;

#[derive(Debug, Clone)]
struct IndexEntry {
    embedding: Vec<f32>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub id: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    entries: HashMap<String, IndexEntry>,
}

impl VectorIndex {
    pub fn from_store(store: &ChunkStore) -> Self {
        let mut index = Self::default();
        for chunk in store.iter() {
            index.insert(&chunk.id, chunk.embedding.clone(), chunk.created_at);
        }
        index
    }

    pub fn insert(&mut self, id: &str, embedding: Vec<f32>, created_at: DateTime<Utc>) {
        self.entries.insert(
            id.to_string(),
            IndexEntry {
                embedding,
                created_at,
            },
        );
    }

    pub fn remove(&mut self, id: &str) -> bool {
        self.entries.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn embedding(&self, id: &str) -> Option<&[f32]> {
        self.entries.get(id).map(|e| e.embedding.as_slice())
    }

    pub fn ids(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Up to `k` neighbours of `query`, most similar first.
    ///
    /// Ties go to the newer chunk (it is more likely to be current), then to
    /// the smaller id so the order is deterministic.
    pub fn nearest(&self, query: &[f32], k: usize, exclude: Option<&str>) -> Vec<Neighbor> {
        if k == 0 || query.is_empty() {
            return Vec::new();
        }
        let mut scored: Vec<(&String, &IndexEntry, f32)> = self
            .entries
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != exclude)
            .map(|(id, entry)| (id, entry, cosine_similarity(query, &entry.embedding)))
            .collect();

        scored.sort_by(|(lid, le, ls), (rid, re, rs)| {
            rs.total_cmp(ls)
                .then_with(|| re.created_at.cmp(&le.created_at))
                .then_with(|| lid.cmp(rid))
        });

        scored
            .into_iter()
            .take(k)
            .map(|(id, _, similarity)| Neighbor {
                id: id.clone(),
                similarity,
            })
            .collect()
    }
}

/// Cosine similarity clamped to `[0, 1]`.  Mismatched or zero vectors score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}
