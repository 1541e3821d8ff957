//! In-process vector store.
//!
//! Collections of records with a JSON payload and a caller-supplied
//! vector; nearest-neighbor queries use cosine distance. The loader
//! recreates collections destructively, so the store never holds a mix
//! of corpus generations.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Collection names used by the knowledge loader.
pub const COLLECTION_METRICS: &str = "FinancialMetrics";
pub const COLLECTION_TERMS: &str = "BusinessTerms";
pub const COLLECTION_COLUMN_TYPES: &str = "ColumnTypes";
pub const COLLECTION_EXAMPLES: &str = "SQLExamples";

/// A stored record: payload plus its vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub payload: serde_json::Value,
    pub vector: Vec<f32>,
}

/// A nearest-neighbor hit. `distance` is cosine distance in `[0, 2]`.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: VectorRecord,
    pub distance: f32,
}

#[derive(Debug)]
struct Collection {
    dim: usize,
    records: Vec<VectorRecord>,
}

/// In-process vector store keyed by collection name.
#[derive(Debug, Default)]
pub struct VectorStore {
    collections: DashMap<String, Collection>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a collection with a fixed vector width. Recreation is
    /// destructive: any existing records are dropped.
    pub fn create_collection(&self, name: &str, dim: usize) {
        let replaced = self
            .collections
            .insert(
                name.to_string(),
                Collection {
                    dim,
                    records: Vec::new(),
                },
            )
            .is_some();
        debug!(collection = name, dim, replaced, "collection created");
    }

    /// Whether a collection exists.
    pub fn has_collection(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    /// Number of records in a collection.
    pub fn len(&self, name: &str) -> usize {
        self.collections
            .get(name)
            .map(|c| c.records.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, name: &str) -> bool {
        self.len(name) == 0
    }

    /// Insert or replace a record by id.
    pub fn upsert(
        &self,
        name: &str,
        id: &str,
        payload: serde_json::Value,
        vector: Vec<f32>,
    ) -> CoreResult<()> {
        let mut collection = self
            .collections
            .get_mut(name)
            .ok_or_else(|| CoreError::Config(format!("unknown collection: {}", name)))?;

        if vector.len() != collection.dim {
            return Err(CoreError::Config(format!(
                "vector width {} does not match collection '{}' dim {}",
                vector.len(),
                name,
                collection.dim
            )));
        }

        let record = VectorRecord {
            id: id.to_string(),
            payload,
            vector,
        };

        if let Some(existing) = collection.records.iter_mut().find(|r| r.id == id) {
            *existing = record;
        } else {
            collection.records.push(record);
        }
        Ok(())
    }

    /// Top-k records by cosine distance, smallest first. Ties break on
    /// record id so retrieval is deterministic. An optional payload
    /// filter is applied before ranking.
    pub fn nearest(
        &self,
        name: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&dyn Fn(&serde_json::Value) -> bool>,
    ) -> CoreResult<Vec<SearchHit>> {
        let collection = self
            .collections
            .get(name)
            .ok_or_else(|| CoreError::Config(format!("unknown collection: {}", name)))?;

        if vector.len() != collection.dim {
            return Err(CoreError::Config(format!(
                "query vector width {} does not match collection '{}' dim {}",
                vector.len(),
                name,
                collection.dim
            )));
        }

        let mut hits: Vec<SearchHit> = collection
            .records
            .iter()
            .filter(|r| filter.map(|f| f(&r.payload)).unwrap_or(true))
            .map(|r| SearchHit {
                distance: cosine_distance(vector, &r.vector),
                record: r.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        hits.truncate(k);
        Ok(hits)
    }
}

/// Cosine distance: `1 - cos(a, b)`. Zero vectors are maximally distant.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cosine_distance_bounds() {
        let a = [1.0, 0.0];
        assert!((cosine_distance(&a, &[1.0, 0.0])).abs() < 1e-6);
        assert!((cosine_distance(&a, &[0.0, 1.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&a, &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
        assert_eq!(cosine_distance(&a, &[0.0, 0.0]), 1.0);
    }

    #[test]
    fn test_nearest_orders_by_distance() {
        let store = VectorStore::new();
        store.create_collection("test", 2);
        store
            .upsert("test", "x", json!({"name": "x"}), vec![1.0, 0.0])
            .unwrap();
        store
            .upsert("test", "y", json!({"name": "y"}), vec![0.0, 1.0])
            .unwrap();

        let hits = store.nearest("test", &[1.0, 0.1], 2, None).unwrap();
        assert_eq!(hits[0].record.id, "x");
        assert_eq!(hits[1].record.id, "y");
    }

    #[test]
    fn test_nearest_with_filter() {
        let store = VectorStore::new();
        store.create_collection("test", 2);
        store
            .upsert("test", "a", json!({"dialect": "bigquery"}), vec![1.0, 0.0])
            .unwrap();
        store
            .upsert("test", "b", json!({"dialect": "postgres"}), vec![1.0, 0.0])
            .unwrap();

        let filter = |payload: &serde_json::Value| {
            payload.get("dialect").and_then(|d| d.as_str()) == Some("bigquery")
        };
        let hits = store.nearest("test", &[1.0, 0.0], 5, Some(&filter)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.id, "a");
    }

    #[test]
    fn test_upsert_replaces_by_id() {
        let store = VectorStore::new();
        store.create_collection("test", 2);
        store
            .upsert("test", "a", json!({"v": 1}), vec![1.0, 0.0])
            .unwrap();
        store
            .upsert("test", "a", json!({"v": 2}), vec![0.0, 1.0])
            .unwrap();

        assert_eq!(store.len("test"), 1);
        let hits = store.nearest("test", &[0.0, 1.0], 1, None).unwrap();
        assert_eq!(hits[0].record.payload["v"], 2);
    }

    #[test]
    fn test_recreate_is_destructive() {
        let store = VectorStore::new();
        store.create_collection("test", 2);
        store
            .upsert("test", "a", json!({}), vec![1.0, 0.0])
            .unwrap();
        store.create_collection("test", 2);
        assert!(store.is_empty("test"));
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let store = VectorStore::new();
        store.create_collection("test", 2);
        assert!(store.upsert("test", "a", json!({}), vec![1.0]).is_err());
        assert!(store.nearest("test", &[1.0], 1, None).is_err());
    }
}
