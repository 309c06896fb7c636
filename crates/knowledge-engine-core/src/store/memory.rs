//! In-memory [`Store`] implementation.
//!
//! Documents, chunk records, the BM25 index and the vector index live in a
//! single [`State`] behind one `std::sync::RwLock`. Every mutation of a
//! chunk touches all three under the same write guard, which is what makes
//! chunk writes atomic for concurrent readers. Guards are never held across
//! an `.await`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::lexical::LexicalIndex;
use crate::models::{Chunk, Document, ProviderDescriptor};
use crate::vector::{VectorIndex, VectorMeta};

use super::{
    ChunkCandidate, ChunkContext, ConsistencyReport, Store, StoreStats, VectorCandidates,
};

#[derive(Default)]
struct State {
    documents: HashMap<String, Document>,
    by_path: HashMap<String, String>,
    chunks: HashMap<String, Chunk>,
    /// document id -> sequence index -> chunk id
    doc_chunks: HashMap<String, BTreeMap<usize, String>>,
    lexical: LexicalIndex,
    vectors: VectorIndex,
}

impl State {
    fn created_at(&self, doc_id: &str) -> i64 {
        self.documents.get(doc_id).map_or(0, |d| d.created_at)
    }

    fn index_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        self.lexical.upsert(&chunk.id, &chunk.text);
        match (&chunk.embedding, &chunk.embedding_provider_id) {
            (Some(vector), Some(provider_id)) => {
                let meta = VectorMeta {
                    document_id: chunk.document_id.clone(),
                    provider_id: provider_id.clone(),
                    created_at: self.created_at(&chunk.document_id),
                };
                if let Err(e) = self.vectors.upsert(&chunk.id, vector.clone(), meta) {
                    self.lexical.remove(&chunk.id);
                    return Err(e);
                }
            }
            _ => {
                self.vectors.remove(&chunk.id);
            }
        }
        self.doc_chunks
            .entry(chunk.document_id.clone())
            .or_default()
            .insert(chunk.sequence_index, chunk.id.clone());
        self.chunks.insert(chunk.id.clone(), chunk.clone());
        Ok(())
    }

    fn remove_chunk(&mut self, chunk_id: &str) {
        if let Some(chunk) = self.chunks.remove(chunk_id) {
            if let Some(seqs) = self.doc_chunks.get_mut(&chunk.document_id) {
                if seqs.get(&chunk.sequence_index).map(String::as_str) == Some(chunk_id) {
                    seqs.remove(&chunk.sequence_index);
                }
            }
        }
        self.lexical.remove(chunk_id);
        self.vectors.remove(chunk_id);
    }

    fn report(&self) -> ConsistencyReport {
        let records: BTreeSet<&String> = self.chunks.keys().collect();
        let embedded: BTreeSet<&String> = self
            .chunks
            .values()
            .filter(|c| c.embedding.is_some() && c.embedding_provider_id.is_some())
            .map(|c| &c.id)
            .collect();
        let lexical: BTreeSet<&String> = self.lexical.chunk_ids().collect();
        let vectors: BTreeSet<&String> = self.vectors.chunk_ids().collect();

        let diff = |a: &BTreeSet<&String>, b: &BTreeSet<&String>| -> Vec<String> {
            a.difference(b).map(|s| (*s).clone()).collect()
        };

        ConsistencyReport {
            missing_lexical: diff(&records, &lexical),
            orphan_lexical: diff(&lexical, &records),
            missing_vectors: diff(&embedded, &vectors),
            orphan_vectors: diff(&vectors, &embedded),
        }
    }
}

/// In-memory store shared between the scan job and query paths.
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_document(&self, doc: &Document) -> Result<()> {
        let mut state = self.write();
        let old_path = state.documents.get(&doc.id).map(|d| d.source_path.clone());
        if let Some(old_path) = old_path.filter(|p| *p != doc.source_path) {
            state.by_path.remove(&old_path);
        }
        state
            .by_path
            .insert(doc.source_path.clone(), doc.id.clone());
        state.documents.insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn replace_chunks(&self, doc_id: &str, chunks: &[Chunk]) -> Result<()> {
        if let Some(c) = chunks.iter().find(|c| c.document_id != doc_id) {
            return Err(EngineError::InvalidInput(format!(
                "chunk {} belongs to {}, not {doc_id}",
                c.id, c.document_id
            )));
        }

        {
            let mut state = self.write();
            let keep: BTreeSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
            let obsolete: Vec<String> = state
                .doc_chunks
                .get(doc_id)
                .map(|seqs| {
                    seqs.values()
                        .filter(|id| !keep.contains(id.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for id in &obsolete {
                state.remove_chunk(id);
            }
        }

        for chunk in chunks {
            let mut state = self.write();
            state.index_chunk(chunk)?;
        }

        debug!(doc_id, chunks = chunks.len(), "replaced chunks");
        Ok(())
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.read().documents.get(id).cloned())
    }

    async fn find_by_source_path(&self, source_path: &str) -> Result<Option<Document>> {
        let state = self.read();
        Ok(state
            .by_path
            .get(source_path)
            .and_then(|id| state.documents.get(id))
            .cloned())
    }

    async fn list_documents(&self, limit: usize, offset: usize) -> Result<Vec<Document>> {
        let state = self.read();
        let mut docs: Vec<&Document> = state.documents.values().collect();
        docs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(docs.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn get_chunks(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let state = self.read();
        Ok(state
            .doc_chunks
            .get(doc_id)
            .map(|seqs| {
                seqs.values()
                    .filter_map(|id| state.chunks.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn chunk_contexts(&self, chunk_ids: &[String]) -> Result<Vec<ChunkContext>> {
        let state = self.read();
        Ok(chunk_ids
            .iter()
            .filter_map(|id| {
                let chunk = state.chunks.get(id)?;
                let doc = state.documents.get(&chunk.document_id);
                Some(ChunkContext {
                    chunk_id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    sequence_index: chunk.sequence_index,
                    text: chunk.text.clone(),
                    title: doc.and_then(|d| d.title.clone()),
                    source_path: doc.map(|d| d.source_path.clone()).unwrap_or_default(),
                    created_at: doc.map_or(0, |d| d.created_at),
                })
            })
            .collect())
    }

    async fn delete_document(&self, id: &str) -> Result<bool> {
        let mut state = self.write();
        let Some(doc) = state.documents.remove(id) else {
            return Ok(false);
        };
        if state.by_path.get(&doc.source_path).map(String::as_str) == Some(id) {
            state.by_path.remove(&doc.source_path);
        }
        let ids: Vec<String> = state
            .doc_chunks
            .remove(id)
            .map(|seqs| seqs.into_values().collect())
            .unwrap_or_default();
        for chunk_id in &ids {
            state.chunks.remove(chunk_id);
            state.lexical.remove(chunk_id);
        }
        state.vectors.delete_by_document(id);
        debug!(doc_id = id, chunks = ids.len(), "deleted document");
        Ok(true)
    }

    async fn keyword_search(&self, query: &str, limit: usize) -> Result<Vec<ChunkCandidate>> {
        let state = self.read();
        Ok(state
            .lexical
            .search(query, limit)
            .into_iter()
            .filter_map(|(chunk_id, score)| {
                let chunk = state.chunks.get(&chunk_id)?;
                Some(ChunkCandidate {
                    document_id: chunk.document_id.clone(),
                    created_at: state.created_at(&chunk.document_id),
                    chunk_id,
                    raw_score: score,
                })
            })
            .collect())
    }

    async fn vector_search(
        &self,
        query_vec: &[f32],
        limit: usize,
        active: &ProviderDescriptor,
    ) -> Result<VectorCandidates> {
        if !active.is_enabled() {
            return Ok(VectorCandidates::default());
        }
        let state = self.read();
        let query = state.vectors.query(query_vec, limit, Some(active))?;
        let unembedded = state
            .chunks
            .values()
            .filter(|c| c.embedding.is_none())
            .count();
        Ok(VectorCandidates {
            candidates: query
                .hits
                .into_iter()
                .map(|h| ChunkCandidate {
                    chunk_id: h.chunk_id,
                    document_id: h.document_id,
                    raw_score: h.score,
                    created_at: h.created_at,
                })
                .collect(),
            stale_excluded: query.excluded + unembedded,
        })
    }

    async fn set_chunk_embedding(
        &self,
        chunk_id: &str,
        vector: Vec<f32>,
        provider: &ProviderDescriptor,
    ) -> Result<()> {
        if vector.len() != provider.dimension {
            return Err(EngineError::DimensionMismatch {
                expected: provider.dimension,
                actual: vector.len(),
            });
        }
        let mut state = self.write();
        let Some(mut chunk) = state.chunks.get(chunk_id).cloned() else {
            return Err(EngineError::NotFound(format!("chunk {chunk_id}")));
        };
        chunk.set_embedding(vector, provider);
        state.index_chunk(&chunk)
    }

    async fn stale_chunks(&self, active: &ProviderDescriptor, limit: usize) -> Result<Vec<Chunk>> {
        let state = self.read();
        let mut stale: Vec<&Chunk> = state
            .chunks
            .values()
            .filter(|c| c.is_stale(active))
            .collect();
        stale.sort_by(|a, b| {
            a.document_id
                .cmp(&b.document_id)
                .then(a.sequence_index.cmp(&b.sequence_index))
        });
        Ok(stale.into_iter().take(limit).cloned().collect())
    }

    async fn stale_count(&self, active: &ProviderDescriptor) -> Result<usize> {
        Ok(self
            .read()
            .chunks
            .values()
            .filter(|c| c.is_stale(active))
            .count())
    }

    async fn document_has_stale_chunks(
        &self,
        doc_id: &str,
        active: &ProviderDescriptor,
    ) -> Result<bool> {
        let state = self.read();
        Ok(state.doc_chunks.get(doc_id).is_some_and(|seqs| {
            seqs.values()
                .filter_map(|id| state.chunks.get(id))
                .any(|c| c.is_stale(active))
        }))
    }

    async fn stats(&self) -> Result<StoreStats> {
        let state = self.read();
        Ok(StoreStats {
            documents: state.documents.len(),
            chunks: state.chunks.len(),
            embedded_chunks: state
                .chunks
                .values()
                .filter(|c| c.embedding.is_some())
                .count(),
        })
    }

    async fn check_consistency(&self) -> Result<ConsistencyReport> {
        Ok(self.read().report())
    }

    async fn repair_indexes(&self) -> Result<ConsistencyReport> {
        let mut state = self.write();
        let before = state.report();
        if before.is_consistent() {
            return Ok(before);
        }

        state.lexical = LexicalIndex::new();
        state.vectors = VectorIndex::new();
        let chunks: Vec<Chunk> = state.chunks.values().cloned().collect();
        for chunk in &chunks {
            if let Err(e) = state.index_chunk(chunk) {
                return Err(EngineError::IndexConsistency(format!(
                    "cannot re-index chunk {}: {e}",
                    chunk.id
                )));
            }
        }
        debug!(chunks = chunks.len(), "rebuilt lexical and vector indices");
        Ok(before)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_text, ChunkParams};
    use crate::models::CostClass;

    fn doc(id: &str, path: &str, created_at: i64) -> Document {
        Document {
            id: id.to_string(),
            source_path: path.to_string(),
            content_hash: "h".to_string(),
            doc_type: "text".to_string(),
            title: None,
            created_at,
            metadata: serde_json::json!({}),
        }
    }

    fn provider(id: &str, dim: usize) -> ProviderDescriptor {
        ProviderDescriptor::new(id, dim, CostClass::Free)
    }

    async fn seeded(store: &InMemoryStore, id: &str, text: &str, p: Option<&ProviderDescriptor>) {
        store.upsert_document(&doc(id, &format!("/{id}.txt"), 10)).await.unwrap();
        let mut chunks = chunk_text(id, text, &ChunkParams::new(512, 50).unwrap());
        if let Some(p) = p {
            for c in &mut chunks {
                c.set_embedding(vec![1.0; p.dimension], p);
            }
        }
        store.replace_chunks(id, &chunks).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_documents_newest_first() {
        let store = InMemoryStore::new();
        store.upsert_document(&doc("b", "/b.txt", 5)).await.unwrap();
        store.upsert_document(&doc("a", "/a.txt", 5)).await.unwrap();
        store.upsert_document(&doc("c", "/c.txt", 9)).await.unwrap();

        let ids = |docs: Vec<Document>| docs.into_iter().map(|d| d.id).collect::<Vec<_>>();
        assert_eq!(ids(store.list_documents(10, 0).await.unwrap()), vec!["c", "a", "b"]);
        assert_eq!(ids(store.list_documents(1, 1).await.unwrap()), vec!["a"]);
        assert!(store.list_documents(10, 3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_keyword_search_finds_chunk() {
        let store = InMemoryStore::new();
        seeded(&store, "d1", "the budget report for march", None).await;
        seeded(&store, "d2", "holiday photos", None).await;

        let hits = store.keyword_search("budget", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document_id, "d1");
        assert_eq!(hits[0].created_at, 10);
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let store = InMemoryStore::new();
        let p = provider("p", 4);
        seeded(&store, "d1", "alpha beta", Some(&p)).await;

        assert!(store.delete_document("d1").await.unwrap());
        assert!(!store.delete_document("d1").await.unwrap());
        assert!(store.get_chunks("d1").await.unwrap().is_empty());
        assert!(store.keyword_search("alpha", 10).await.unwrap().is_empty());
        let v = store.vector_search(&[1.0; 4], 10, &p).await.unwrap();
        assert!(v.candidates.is_empty());
        assert!(store.find_by_source_path("/d1.txt").await.unwrap().is_none());
        assert!(store.check_consistency().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_vector_search_excludes_stale() {
        let store = InMemoryStore::new();
        let small = provider("small", 4);
        let large = provider("large", 8);
        seeded(&store, "d1", "old vectors", Some(&small)).await;
        seeded(&store, "d2", "new vectors", Some(&large)).await;

        let v = store.vector_search(&[1.0; 8], 10, &large).await.unwrap();
        assert_eq!(v.candidates.len(), 1);
        assert_eq!(v.candidates[0].document_id, "d2");
        assert_eq!(v.stale_excluded, 1);
        assert_eq!(store.stale_count(&large).await.unwrap(), 1);
        assert!(store.document_has_stale_chunks("d1", &large).await.unwrap());
        assert!(!store.document_has_stale_chunks("d2", &large).await.unwrap());
    }

    #[tokio::test]
    async fn test_set_chunk_embedding_migrates() {
        let store = InMemoryStore::new();
        let small = provider("small", 4);
        let large = provider("large", 8);
        seeded(&store, "d1", "some text", Some(&small)).await;

        let stale = store.stale_chunks(&large, 10).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert!(store
            .set_chunk_embedding(&stale[0].id, vec![1.0; 4], &large)
            .await
            .is_err());
        store
            .set_chunk_embedding(&stale[0].id, vec![1.0; 8], &large)
            .await
            .unwrap();
        assert_eq!(store.stale_count(&large).await.unwrap(), 0);
        assert_eq!(
            store.vector_search(&[1.0; 8], 10, &large).await.unwrap().candidates.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_replace_chunks_drops_obsolete() {
        let store = InMemoryStore::new();
        let long = "word ".repeat(2000);
        seeded(&store, "d1", &long, None).await;
        assert!(store.get_chunks("d1").await.unwrap().len() > 1);

        seeded(&store, "d1", "short now", None).await;
        let chunks = store.get_chunks("d1").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "short now");
        assert_eq!(store.stats().await.unwrap().chunks, 1);
        assert!(store.check_consistency().await.unwrap().is_consistent());
    }

    #[tokio::test]
    async fn test_repair_rebuilds_indices() {
        let store = InMemoryStore::new();
        seeded(&store, "d1", "alpha", None).await;
        {
            let mut state = store.write();
            state.lexical = LexicalIndex::new();
        }
        let report = store.check_consistency().await.unwrap();
        assert_eq!(report.missing_lexical.len(), 1);

        let before = store.repair_indexes().await.unwrap();
        assert!(!before.is_consistent());
        assert!(store.check_consistency().await.unwrap().is_consistent());
        assert_eq!(store.keyword_search("alpha", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_foreign_chunks() {
        let store = InMemoryStore::new();
        let chunks = chunk_text("other", "text", &ChunkParams::new(512, 50).unwrap());
        assert!(store.replace_chunks("d1", &chunks).await.is_err());
    }
}
