//! Exact nearest-neighbor index over chunk vectors.
//!
//! Vectors are compared with cosine similarity by brute force, which is
//! fine for a personal corpus. Every entry remembers the provider that
//! produced it, so a query can be restricted to vectors from the active
//! provider; vectors of a different dimensionality are never compared.

use std::collections::{BTreeSet, HashMap};

use crate::embedding::cosine_similarity;
use crate::error::{EngineError, Result};
use crate::models::ProviderDescriptor;

/// Metadata stored next to each vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VectorMeta {
    pub document_id: String,
    pub provider_id: String,
    /// Unix seconds of the owning document, used for tie-breaking.
    pub created_at: i64,
}

#[derive(Debug, Clone)]
struct Entry {
    meta: VectorMeta,
    vector: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub chunk_id: String,
    pub document_id: String,
    /// Raw cosine similarity in `[-1, 1]`.
    pub score: f64,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct VectorQuery {
    pub hits: Vec<VectorHit>,
    /// Entries skipped because another provider produced them.
    pub excluded: usize,
}

#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    entries: HashMap<String, Entry>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the vector for `chunk_id`.
    pub fn upsert(&mut self, chunk_id: &str, vector: Vec<f32>, meta: VectorMeta) -> Result<()> {
        validate_vector(&vector)?;
        self.entries
            .insert(chunk_id.to_string(), Entry { meta, vector });
        Ok(())
    }

    pub fn remove(&mut self, chunk_id: &str) -> bool {
        self.entries.remove(chunk_id).is_some()
    }

    /// Remove every vector owned by `document_id`, returning how many went.
    pub fn delete_by_document(&mut self, document_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| e.meta.document_id != document_id);
        before - self.entries.len()
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.entries.contains_key(chunk_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn chunk_ids(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    /// Distinct dimensionalities currently stored.
    pub fn dimensions(&self) -> BTreeSet<usize> {
        self.entries.values().map(|e| e.vector.len()).collect()
    }

    /// Rank stored vectors by cosine similarity to `vector`.
    ///
    /// With `provider`, only vectors produced by that provider are
    /// candidates and the rest are counted in [`VectorQuery::excluded`].
    /// Without it, every stored vector is a candidate and all of them must
    /// share the query's dimension.
    ///
    /// # Errors
    ///
    /// [`EngineError::DimensionMismatch`] when the query dimension differs
    /// from the provider's declared dimension or from any candidate.
    pub fn query(
        &self,
        vector: &[f32],
        k: usize,
        provider: Option<&ProviderDescriptor>,
    ) -> Result<VectorQuery> {
        validate_vector(vector)?;

        let mut excluded = 0;
        let mut candidates: Vec<(&String, &Entry)> = Vec::with_capacity(self.entries.len());

        match provider {
            Some(p) => {
                if p.dimension != vector.len() {
                    return Err(EngineError::DimensionMismatch {
                        expected: p.dimension,
                        actual: vector.len(),
                    });
                }
                for (id, e) in &self.entries {
                    if e.meta.provider_id == p.id && e.vector.len() == p.dimension {
                        candidates.push((id, e));
                    } else {
                        excluded += 1;
                    }
                }
            }
            None => {
                for (id, e) in &self.entries {
                    if e.vector.len() != vector.len() {
                        return Err(EngineError::DimensionMismatch {
                            expected: e.vector.len(),
                            actual: vector.len(),
                        });
                    }
                    candidates.push((id, e));
                }
            }
        }

        let mut hits: Vec<VectorHit> = candidates
            .into_iter()
            .map(|(id, e)| VectorHit {
                chunk_id: id.clone(),
                document_id: e.meta.document_id.clone(),
                score: f64::from(cosine_similarity(vector, &e.vector)),
                created_at: e.meta.created_at,
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.created_at.cmp(&a.created_at))
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        hits.truncate(k);

        Ok(VectorQuery { hits, excluded })
    }
}

fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.is_empty() {
        return Err(EngineError::InvalidInput("empty vector".to_string()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(EngineError::InvalidInput(
            "vector contains NaN or infinite values".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CostClass;

    fn meta(doc: &str, provider: &str, created_at: i64) -> VectorMeta {
        VectorMeta {
            document_id: doc.to_string(),
            provider_id: provider.to_string(),
            created_at,
        }
    }

    #[test]
    fn test_nearest_first() {
        let mut idx = VectorIndex::new();
        idx.upsert("c1", vec![1.0, 0.0], meta("d1", "p", 0)).unwrap();
        idx.upsert("c2", vec![0.0, 1.0], meta("d2", "p", 0)).unwrap();
        idx.upsert("c3", vec![0.7, 0.7], meta("d3", "p", 0)).unwrap();

        let q = idx.query(&[1.0, 0.1], 10, None).unwrap();
        let ids: Vec<&str> = q.hits.iter().map(|h| h.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c3", "c2"]);
        assert_eq!(q.excluded, 0);
    }

    #[test]
    fn test_ties_prefer_recent() {
        let mut idx = VectorIndex::new();
        idx.upsert("old", vec![1.0, 0.0], meta("d1", "p", 100)).unwrap();
        idx.upsert("new", vec![2.0, 0.0], meta("d2", "p", 200)).unwrap();
        let q = idx.query(&[1.0, 0.0], 10, None).unwrap();
        assert_eq!(q.hits[0].chunk_id, "new");
        assert_eq!(q.hits[1].chunk_id, "old");
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut idx = VectorIndex::new();
        idx.upsert("c1", vec![0.1; 384], meta("d1", "small", 0)).unwrap();
        let err = idx.query(&[0.1; 1536], 5, None).unwrap_err();
        assert!(matches!(
            err,
            EngineError::DimensionMismatch {
                expected: 384,
                actual: 1536
            }
        ));
    }

    #[test]
    fn test_mixed_dimensions_rejected_without_filter() {
        let mut idx = VectorIndex::new();
        idx.upsert("c1", vec![0.1; 4], meta("d1", "a", 0)).unwrap();
        idx.upsert("c2", vec![0.1; 8], meta("d2", "b", 0)).unwrap();
        assert!(idx.query(&[0.1; 4], 5, None).is_err());
        assert_eq!(idx.dimensions().len(), 2);
    }

    #[test]
    fn test_provider_filter_excludes_stale() {
        let mut idx = VectorIndex::new();
        idx.upsert("c1", vec![0.1; 4], meta("d1", "small", 0)).unwrap();
        idx.upsert("c2", vec![0.1; 8], meta("d2", "large", 0)).unwrap();
        idx.upsert("c3", vec![0.2; 8], meta("d3", "large", 0)).unwrap();

        let large = ProviderDescriptor::new("large", 8, CostClass::Metered);
        let q = idx.query(&[0.1; 8], 5, Some(&large)).unwrap();
        assert_eq!(q.hits.len(), 2);
        assert_eq!(q.excluded, 1);

        let err = idx.query(&[0.1; 4], 5, Some(&large)).unwrap_err();
        assert!(matches!(err, EngineError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_delete_by_document() {
        let mut idx = VectorIndex::new();
        idx.upsert("c1", vec![1.0], meta("d1", "p", 0)).unwrap();
        idx.upsert("c2", vec![1.0], meta("d1", "p", 0)).unwrap();
        idx.upsert("c3", vec![1.0], meta("d2", "p", 0)).unwrap();
        assert_eq!(idx.delete_by_document("d1"), 2);
        assert_eq!(idx.len(), 1);
        assert!(idx.contains("c3"));
    }

    #[test]
    fn test_rejects_invalid_vectors() {
        let mut idx = VectorIndex::new();
        assert!(idx.upsert("c1", vec![], meta("d1", "p", 0)).is_err());
        assert!(idx
            .upsert("c1", vec![f32::NAN, 1.0], meta("d1", "p", 0))
            .is_err());
        assert!(idx.query(&[], 3, None).is_err());
    }

    #[test]
    fn test_k_larger_than_corpus() {
        let mut idx = VectorIndex::new();
        idx.upsert("c1", vec![1.0, 0.0], meta("d1", "p", 0)).unwrap();
        assert_eq!(idx.query(&[1.0, 0.0], 100, None).unwrap().hits.len(), 1);
        assert!(VectorIndex::new().query(&[1.0], 5, None).unwrap().hits.is_empty());
    }
}
