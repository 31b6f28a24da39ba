//! Near-duplicate / contradiction detection over the vector index.

use serde::{Deserialize, Serialize};

use crate::index::{VectorIndex, cosine_similarity};

/// Two chunks similar enough to be a duplicate or a contradiction.
/// Derived on demand, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictPair {
    pub chunk_a: String,
    pub chunk_b: String,
    pub similarity: f32,
}

/// Every unordered pair with similarity ≥ `threshold`, most similar first.
///
/// Exhaustive pairwise comparison.  `chunk_a` is always the smaller id, so
/// `(a, b)` and `(b, a)` can never both be reported.
pub fn scan(index: &VectorIndex, threshold: f32) -> Vec<ConflictPair> {
    let ids: Vec<String> = index.ids().into_iter().collect();
    let mut pairs = Vec::new();

    for (i, a) in ids.iter().enumerate() {
        let Some(emb_a) = index.embedding(a) else {
            continue;
        };
        for b in &ids[i + 1..] {
            let Some(emb_b) = index.embedding(b) else {
                continue;
            };
            let similarity = cosine_similarity(emb_a, emb_b);
            if similarity >= threshold {
                pairs.push(ConflictPair {
                    chunk_a: a.clone(),
                    chunk_b: b.clone(),
                    similarity,
                });
            }
        }
    }

    pairs.sort_by(|l, r| {
        r.similarity
            .total_cmp(&l.similarity)
            .then_with(|| l.chunk_a.cmp(&r.chunk_a))
            .then_with(|| l.chunk_b.cmp(&r.chunk_b))
    });
    pairs
}
