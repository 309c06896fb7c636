//! Ingestion pipeline orchestration.
//!
//! Coordinates the flow for one item: normalization → chunking →
//! embedding → storage. A failing provider does not lose the item: chunks
//! are stored without vectors, stay searchable lexically, and are picked
//! up later by [`reindex_stale`] or the next scan. Transient failures end
//! in `Ok` with `embedding_error` set; an exhausted quota is returned as
//! the error once the chunks are stored, so callers stop calling it.

use std::collections::HashMap;

use knowledge_engine_core::chunk::{chunk_text, content_hash, normalize_text, ChunkParams};
use knowledge_engine_core::embedding::{validate_batch, EmbeddingProvider};
use knowledge_engine_core::models::{document_id_for_path, Chunk, Document, IngestItem};
use knowledge_engine_core::store::Store;
use knowledge_engine_core::{EngineError, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

/// What happened to one ingested item.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks: usize,
    /// Chunks embedded by this call.
    pub embedded: usize,
    /// Chunks whose text was unchanged and kept their previous vector.
    pub reused: usize,
    /// Chunks left without a vector from the active provider.
    pub pending: usize,
    pub embedding_error: Option<String>,
}

/// Outcome of [`reindex_stale`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexReport {
    pub embedded: usize,
    pub remaining: usize,
}

pub async fn ingest_item(
    store: &dyn Store,
    embedder: &dyn EmbeddingProvider,
    params: &ChunkParams,
    batch_size: usize,
    item: IngestItem,
) -> Result<IngestReport> {
    if item.source_path.trim().is_empty() {
        return Err(EngineError::InvalidInput(
            "source_path must not be empty".to_string(),
        ));
    }

    let text = normalize_text(&item.text);
    let doc_id = item
        .document_id
        .clone()
        .unwrap_or_else(|| document_id_for_path(&item.source_path));

    let existing = store.get_document(&doc_id).await?;
    let created_at = item
        .created_at
        .or_else(|| existing.as_ref().map(|d| d.created_at))
        .unwrap_or_else(|| chrono::Utc::now().timestamp());

    let doc = Document {
        id: doc_id.clone(),
        source_path: item.source_path.clone(),
        content_hash: item
            .content_hash
            .clone()
            .unwrap_or_else(|| content_hash(text.as_bytes())),
        doc_type: item.doc_type.clone(),
        title: item.title.clone(),
        created_at,
        metadata: item.metadata.clone(),
    };
    store.upsert_document(&doc).await?;

    let mut chunks = chunk_text(&doc_id, &text, params);
    let mut report = IngestReport {
        document_id: doc_id.clone(),
        chunks: chunks.len(),
        ..Default::default()
    };

    let active = embedder.descriptor().clone();
    if active.is_enabled() && !chunks.is_empty() {
        let previous: HashMap<String, Chunk> = store
            .get_chunks(&doc_id)
            .await?
            .into_iter()
            .filter(|c| !c.is_stale(&active))
            .map(|c| (c.hash.clone(), c))
            .collect();

        for chunk in chunks.iter_mut() {
            if let Some(prev) = previous.get(&chunk.hash) {
                if let Some(vector) = &prev.embedding {
                    chunk.set_embedding(vector.clone(), &active);
                    report.reused += 1;
                }
            }
        }

        let mut quota = None;
        let todo: Vec<usize> = (0..chunks.len())
            .filter(|&i| chunks[i].embedding.is_none())
            .collect();
        for batch in todo.chunks(batch_size.max(1)) {
            let texts: Vec<String> = batch.iter().map(|&i| chunks[i].text.clone()).collect();
            let vectors = match embed_checked(embedder, &texts).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        document = %item.source_path,
                        provider = %active.id,
                        error = %e,
                        "embedding failed, chunks stored without vectors"
                    );
                    report.embedding_error = Some(e.to_string());
                    if e.is_quota() {
                        quota = Some(e);
                    }
                    break;
                }
            };
            for (&i, vector) in batch.iter().zip(vectors) {
                chunks[i].set_embedding(vector, &active);
                report.embedded += 1;
            }
        }
        report.pending = chunks.iter().filter(|c| c.is_stale(&active)).count();
        if let Some(e) = quota {
            store.replace_chunks(&doc_id, &chunks).await?;
            return Err(e);
        }
    }

    store.replace_chunks(&doc_id, &chunks).await?;

    debug!(
        document = %doc_id,
        path = %item.source_path,
        chunks = report.chunks,
        embedded = report.embedded,
        reused = report.reused,
        "ingested"
    );
    Ok(report)
}

async fn embed_checked(embedder: &dyn EmbeddingProvider, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let vectors = embedder.embed_batch(texts).await?;
    validate_batch(embedder.descriptor(), texts.len(), &vectors)?;
    Ok(vectors)
}

/// Re-embed every stale chunk with `embedder`, in batches.
///
/// Stops at the first provider error, leaving the rest stale.
pub async fn reindex_stale(
    store: &dyn Store,
    embedder: &dyn EmbeddingProvider,
    batch_size: usize,
) -> Result<ReindexReport> {
    let active = embedder.descriptor().clone();
    let mut report = ReindexReport::default();
    if !active.is_enabled() {
        return Ok(report);
    }

    loop {
        let batch = store.stale_chunks(&active, batch_size.max(1)).await?;
        if batch.is_empty() {
            break;
        }
        let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
        let vectors = embed_checked(embedder, &texts).await?;
        for (chunk, vector) in batch.iter().zip(vectors) {
            store.set_chunk_embedding(&chunk.id, vector, &active).await?;
            report.embedded += 1;
        }
    }

    report.remaining = store.stale_count(&active).await?;
    info!(
        provider = %active.id,
        embedded = report.embedded,
        remaining = report.remaining,
        "stale chunks re-embedded"
    );
    Ok(report)
}
