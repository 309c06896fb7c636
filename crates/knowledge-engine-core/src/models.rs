//! Core data models used throughout Knowledge Engine.
//!
//! These types represent the documents, chunks, provider descriptors and
//! search results that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Text plus metadata handed over by an upstream parser or connector.
///
/// The engine never parses raw file bytes; whatever produced this item has
/// already extracted its text.
#[derive(Debug, Clone, Default)]
pub struct IngestItem {
    /// Assigned id. When `None`, the id is derived from `source_path`.
    pub document_id: Option<String>,
    pub source_path: String,
    pub text: String,
    pub doc_type: String,
    pub title: Option<String>,
    pub metadata: serde_json::Value,
    /// Hash of the original bytes, when the caller already computed one.
    pub content_hash: Option<String>,
    /// Unix seconds. Defaults to ingestion time.
    pub created_at: Option<i64>,
}

/// A normalized document.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub source_path: String,
    pub content_hash: String,
    pub doc_type: String,
    pub title: Option<String>,
    pub created_at: i64,
    pub metadata: serde_json::Value,
}

/// Derive a stable document id from its source path.
pub fn document_id_for_path(source_path: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, source_path.as_bytes()).to_string()
}

/// Half-open range of character offsets into the normalized document text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharSpan {
    pub start: usize,
    pub end: usize,
}

impl CharSpan {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// A chunk of a document's text, the unit of embedding and retrieval.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub sequence_index: usize,
    pub text: String,
    pub char_span: CharSpan,
    /// SHA-256 of `text`.
    pub hash: String,
    pub embedding: Option<Vec<f32>>,
    pub embedding_provider_id: Option<String>,
    pub embedding_dimension: Option<usize>,
}

impl Chunk {
    /// Attach a vector computed by `provider`.
    pub fn set_embedding(&mut self, vector: Vec<f32>, provider: &ProviderDescriptor) {
        self.embedding_dimension = Some(vector.len());
        self.embedding_provider_id = Some(provider.id.clone());
        self.embedding = Some(vector);
    }

    /// A chunk is stale when it has no vector from the active provider.
    pub fn is_stale(&self, active: &ProviderDescriptor) -> bool {
        if !active.is_enabled() {
            return false;
        }
        self.embedding.is_none()
            || self.embedding_provider_id.as_deref() != Some(active.id.as_str())
            || self.embedding_dimension != Some(active.dimension)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CostClass {
    Free,
    Metered,
}

/// Identity and output shape of an embedding provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderDescriptor {
    pub id: String,
    pub dimension: usize,
    pub cost_class: CostClass,
}

impl ProviderDescriptor {
    pub fn new(id: impl Into<String>, dimension: usize, cost_class: CostClass) -> Self {
        Self {
            id: id.into(),
            dimension,
            cost_class,
        }
    }

    pub fn disabled() -> Self {
        Self::new("disabled", 0, CostClass::Free)
    }

    pub fn is_enabled(&self) -> bool {
        self.dimension > 0
    }
}

/// One ranked chunk returned by the hybrid ranker.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    pub title: Option<String>,
    pub source_path: String,
    pub sequence_index: usize,
    /// Normalized semantic score (0.0 if absent from vector candidates).
    pub semantic_score: f64,
    /// Normalized lexical score (0.0 if absent from keyword candidates).
    pub lexical_score: f64,
    pub combined_score: f64,
    pub created_at: i64,
    /// Full chunk text, used to build grounded prompts.
    #[serde(skip)]
    pub text: String,
    pub highlighted_text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk() -> Chunk {
        Chunk {
            id: "c1".into(),
            document_id: "d1".into(),
            sequence_index: 0,
            text: "hello".into(),
            char_span: CharSpan { start: 0, end: 5 },
            hash: String::new(),
            embedding: None,
            embedding_provider_id: None,
            embedding_dimension: None,
        }
    }

    #[test]
    fn stale_until_embedded_by_active_provider() {
        let small = ProviderDescriptor::new("hash:384", 384, CostClass::Free);
        let large = ProviderDescriptor::new("openai:text-embedding-3-small", 1536, CostClass::Metered);
        let mut c = chunk();
        assert!(c.is_stale(&small));
        c.set_embedding(vec![0.1; 384], &small);
        assert!(!c.is_stale(&small));
        assert!(c.is_stale(&large));
    }

    #[test]
    fn nothing_is_stale_when_embeddings_are_disabled() {
        assert!(!chunk().is_stale(&ProviderDescriptor::disabled()));
    }

    #[test]
    fn document_id_is_stable_per_path() {
        assert_eq!(
            document_id_for_path("/notes/a.md"),
            document_id_for_path("/notes/a.md")
        );
        assert_ne!(
            document_id_for_path("/notes/a.md"),
            document_id_for_path("/notes/b.md")
        );
    }
}
