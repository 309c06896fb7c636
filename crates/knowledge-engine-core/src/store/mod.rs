//! Storage abstraction for Knowledge Engine.
//!
//! The [`Store`] trait defines all storage operations needed by the
//! ingestion, retrieval and maintenance pipelines: document and chunk
//! records, the lexical index, and the vector index. Backends must keep
//! the three consistent and must make each chunk write atomic, so that a
//! concurrent reader sees a chunk either fully indexed (record, postings
//! and vector) or not at all.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::Result;
use crate::models::{Chunk, Document, ProviderDescriptor};

/// A candidate chunk returned from keyword or vector search.
///
/// Carries enough information to perform score normalization, hybrid
/// merging, and recency tie-breaking without another lookup.
#[derive(Debug, Clone)]
pub struct ChunkCandidate {
    /// Chunk UUID.
    pub chunk_id: String,
    /// Parent document UUID.
    pub document_id: String,
    /// Raw score from the search backend (BM25 or cosine similarity).
    pub raw_score: f64,
    /// Parent document `created_at`.
    pub created_at: i64,
}

/// Vector search candidates plus how many stale vectors were skipped.
#[derive(Debug, Clone, Default)]
pub struct VectorCandidates {
    pub candidates: Vec<ChunkCandidate>,
    pub stale_excluded: usize,
}

/// Chunk text joined with the fields of its document that a search
/// result or citation needs.
#[derive(Debug, Clone)]
pub struct ChunkContext {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: usize,
    pub text: String,
    pub title: Option<String>,
    pub source_path: String,
    pub created_at: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub documents: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
}

/// Divergence between chunk records and the two indices.
///
/// Every list holds chunk ids, sorted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConsistencyReport {
    /// Chunk records with no lexical postings.
    pub missing_lexical: Vec<String>,
    /// Lexical entries with no chunk record.
    pub orphan_lexical: Vec<String>,
    /// Embedded chunk records with no vector.
    pub missing_vectors: Vec<String>,
    /// Vectors with no embedded chunk record.
    pub orphan_vectors: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_lexical.is_empty()
            && self.orphan_lexical.is_empty()
            && self.missing_vectors.is_empty()
            && self.orphan_vectors.is_empty()
    }
}

/// Abstract storage backend for Knowledge Engine.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_document`](Store::upsert_document) | Insert or update a document |
/// | [`replace_chunks`](Store::replace_chunks) | Replace all chunks for a document |
/// | [`delete_document`](Store::delete_document) | Remove a document and everything it owns |
/// | [`list_documents`](Store::list_documents) | Page through documents, newest first |
/// | [`keyword_search`](Store::keyword_search) | BM25 keyword search |
/// | [`vector_search`](Store::vector_search) | Cosine search over the active provider's vectors |
/// | [`set_chunk_embedding`](Store::set_chunk_embedding) | Attach a vector to an existing chunk |
/// | [`stale_chunks`](Store::stale_chunks) | Chunks lacking a vector from the active provider |
/// | [`check_consistency`](Store::check_consistency) | Compare records against both indices |
/// | [`repair_indexes`](Store::repair_indexes) | Rebuild both indices from the records |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or update a document record.
    async fn upsert_document(&self, doc: &Document) -> Result<()>;

    /// Replace all chunks of a document.
    ///
    /// Chunks are indexed one at a time, each atomically. Chunks that carry
    /// an embedding get a vector entry; chunks from the previous version
    /// that are not in `chunks` are removed.
    async fn replace_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    async fn find_by_source_path(&self, source_path: &str) -> Result<Option<Document>>;

    /// Page through documents, newest `created_at` first, ties by id.
    async fn list_documents(&self, limit: usize, offset: usize) -> Result<Vec<Document>>;

    /// All chunks of a document ordered by `sequence_index`.
    async fn get_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>>;

    /// Look up chunk contexts. Unknown ids are left out of the result.
    async fn chunk_contexts(&self, chunk_ids: &[String]) -> Result<Vec<ChunkContext>>;

    /// Delete a document with its chunks, postings and vectors.
    ///
    /// Returns false if the document did not exist.
    async fn delete_document(&self, id: &str) -> Result<bool>;

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>>;

    /// Rank vectors produced by `active`, skipping stale ones.
    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        active: &ProviderDescriptor,
    ) -> Result<VectorCandidates>;

    /// Attach a vector to a chunk, replacing any previous one.
    async fn set_chunk_embedding(
        &self,
        chunk_id: &str,
        vector: Vec<f32>,
        provider: &ProviderDescriptor,
    ) -> Result<()>;

    /// Up to `limit` stale chunks, ordered by document then sequence.
    async fn stale_chunks(&self, active: &ProviderDescriptor, limit: usize) -> Result<Vec<Chunk>>;

    async fn stale_count(&self, active: &ProviderDescriptor) -> Result<usize>;

    /// Whether any document has at least one stale chunk.
    async fn document_has_stale_chunks(
        &self,
        doc_id: &str,
        active: &ProviderDescriptor,
    ) -> Result<bool>;

    async fn stats(&self) -> Result<StoreStats>;

    async fn check_consistency(&self) -> Result<ConsistencyReport>;

    /// Re-derive postings and vectors from chunk records.
    ///
    /// Returns the report taken before the rebuild.
    async fn repair_indexes(&self) -> Result<ConsistencyReport>;
}
