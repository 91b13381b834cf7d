//! HNSW-backed vector index (C5), feature-gated behind `vector-search`.
//!
//! Keys are fact ids directly (usearch keys are `u64`, and fact ids are
//! always positive), so there's no separate key-mapping table to keep in
//! sync the way a string-keyed index would need.

#![cfg(feature = "vector-search")]

use std::sync::Mutex;
use usearch::{Index, IndexOptions, MetricKind, ScalarKind};

use crate::embeddings::EMBEDDING_DIMENSIONS;
use crate::error::{EngineError, Result};

pub const DEFAULT_CONNECTIVITY: usize = 16;
pub const DEFAULT_EXPANSION_ADD: usize = 128;
pub const DEFAULT_EXPANSION_SEARCH: usize = 64;

/// An in-memory HNSW index over fact embeddings. Rebuilt from
/// `fact_embeddings` on `Engine::open` — the index itself is not persisted,
/// the table is the source of truth.
pub struct VectorIndex {
    index: Mutex<Index>,
}

impl VectorIndex {
    pub fn new() -> Result<Self> {
        let options = IndexOptions {
            dimensions: EMBEDDING_DIMENSIONS,
            metric: MetricKind::Cos,
            quantization: ScalarKind::F32,
            connectivity: DEFAULT_CONNECTIVITY,
            expansion_add: DEFAULT_EXPANSION_ADD,
            expansion_search: DEFAULT_EXPANSION_SEARCH,
            multi: false,
        };
        let index = Index::new(&options).map_err(|e| EngineError::internal(format!("vector index creation failed: {e}")))?;
        Ok(Self { index: Mutex::new(index) })
    }

    pub fn reserve(&self, capacity: usize) -> Result<()> {
        let index = self.index.lock().expect("vector index lock poisoned");
        index.reserve(capacity).map_err(|e| EngineError::internal(format!("reserve failed: {e}")))
    }

    /// Insert or replace the vector for `fact_id`.
    pub fn add(&self, fact_id: i64, vector: &[f32]) -> Result<()> {
        if vector.len() != EMBEDDING_DIMENSIONS {
            return Err(EngineError::invalid_input(format!(
                "expected {EMBEDDING_DIMENSIONS}-dim vector, got {}",
                vector.len()
            )));
        }
        let index = self.index.lock().expect("vector index lock poisoned");
        let key = fact_id as u64;
        if index.contains(key) {
            index.remove(key).map_err(|e| EngineError::internal(format!("vector remove failed: {e}")))?;
        }
        if index.size() >= index.capacity() {
            let new_capacity = (index.capacity() * 2).max(16);
            index.reserve(new_capacity).map_err(|e| EngineError::internal(format!("reserve failed: {e}")))?;
        }
        index.add(key, vector).map_err(|e| EngineError::internal(format!("vector add failed: {e}")))
    }

    pub fn remove(&self, fact_id: i64) -> Result<bool> {
        let index = self.index.lock().expect("vector index lock poisoned");
        let key = fact_id as u64;
        if !index.contains(key) {
            return Ok(false);
        }
        index.remove(key).map_err(|e| EngineError::internal(format!("vector remove failed: {e}")))?;
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.index.lock().expect("vector index lock poisoned").size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Nearest neighbors to `query` by cosine distance, as `(fact_id,
    /// distance)` pairs ascending by distance.
    pub fn search(&self, query: &[f32], limit: usize) -> Result<Vec<(i64, f32)>> {
        if query.len() != EMBEDDING_DIMENSIONS {
            return Err(EngineError::invalid_input(format!(
                "expected {EMBEDDING_DIMENSIONS}-dim query vector, got {}",
                query.len()
            )));
        }
        let index = self.index.lock().expect("vector index lock poisoned");
        if index.size() == 0 || limit == 0 {
            return Ok(Vec::new());
        }
        let results = index.search(query, limit).map_err(|e| EngineError::internal(format!("vector search failed: {e}")))?;
        Ok(results.keys.iter().zip(results.distances.iter()).map(|(k, d)| (*k as i64, *d)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vec384(fill: f32) -> Vec<f32> {
        let mut v = vec![0.0; EMBEDDING_DIMENSIONS];
        v[0] = fill;
        v
    }

    #[test]
    fn add_then_search_finds_nearest() {
        let index = VectorIndex::new().unwrap();
        index.reserve(16).unwrap();
        index.add(1, &vec384(1.0)).unwrap();
        index.add(2, &vec384(-1.0)).unwrap();

        let results = index.search(&vec384(0.9), 2).unwrap();
        assert_eq!(results[0].0, 1);
    }

    #[test]
    fn remove_drops_from_results() {
        let index = VectorIndex::new().unwrap();
        index.reserve(16).unwrap();
        index.add(1, &vec384(1.0)).unwrap();
        assert!(index.remove(1).unwrap());
        assert!(index.is_empty());
    }

    #[test]
    fn rejects_wrong_dimension_vectors() {
        let index = VectorIndex::new().unwrap();
        assert!(index.add(1, &[1.0, 2.0]).is_err());
    }
}
