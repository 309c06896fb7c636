//! Query-side glue between the active embedding provider and the core
//! hybrid ranker, shared by search and chat.

use knowledge_engine_core::embedding::{embed_query, EmbeddingProvider};
use knowledge_engine_core::search::{search, SearchOutcome, SearchRequest};
use knowledge_engine_core::store::Store;
use knowledge_engine_core::{EngineError, Result};
use tracing::debug;

/// Embed `query` when the semantic side is needed and run the hybrid
/// ranker.
///
/// With embeddings disabled the effective weight drops to 0, so the
/// ranking is purely lexical. The weight is checked before any provider
/// call is made.
pub async fn hybrid_search(
    store: &dyn Store,
    embedder: &dyn EmbeddingProvider,
    query: &str,
    semantic_weight: f64,
    limit: usize,
) -> Result<SearchOutcome> {
    if !(0.0..=1.0).contains(&semantic_weight) {
        return Err(EngineError::InvalidInput(format!(
            "semantic_weight must be within [0, 1], got {semantic_weight}"
        )));
    }

    let active = embedder.descriptor();
    let weight = if active.is_enabled() {
        semantic_weight
    } else {
        if semantic_weight > 0.0 {
            debug!(semantic_weight, "embeddings disabled, ranking lexically");
        }
        0.0
    };

    let query_vec = if weight > 0.0 && !query.trim().is_empty() && limit > 0 {
        Some(embed_query(embedder, query).await?)
    } else {
        None
    };

    search(
        store,
        &SearchRequest {
            query,
            query_vec: query_vec.as_deref(),
            active,
            semantic_weight: weight,
            limit,
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{DisabledEmbedder, HashEmbedder};
    use crate::ingest::ingest_item;
    use knowledge_engine_core::chunk::ChunkParams;
    use knowledge_engine_core::models::IngestItem;
    use async_trait::async_trait;
    use knowledge_engine_core::models::ProviderDescriptor;
    use knowledge_engine_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Metered {
        inner: HashEmbedder,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for Metered {
        fn descriptor(&self) -> &ProviderDescriptor {
            self.inner.descriptor()
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }
    }

    async fn seeded(embedder: &dyn EmbeddingProvider) -> InMemoryStore {
        let store = InMemoryStore::new();
        let params = ChunkParams::new(128, 16).unwrap();
        for (path, text) in [
            ("/n/budget.md", "The quarterly budget report is due on Friday."),
            ("/n/garden.md", "Tomatoes need sun and regular watering."),
        ] {
            let item = IngestItem {
                source_path: path.to_string(),
                text: text.to_string(),
                doc_type: "md".to_string(),
                ..Default::default()
            };
            ingest_item(&store, embedder, &params, 8, item).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_disabled_embeddings_fall_back_to_lexical() {
        let embedder = DisabledEmbedder::default();
        let store = seeded(&embedder).await;
        let outcome = hybrid_search(&store, &embedder, "budget", 0.7, 10)
            .await
            .unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].source_path, "/n/budget.md");
        assert_eq!(outcome.results[0].semantic_score, 0.0);
    }

    #[tokio::test]
    async fn test_semantic_side_uses_query_embedding() {
        let embedder = HashEmbedder::new(64).unwrap();
        let store = seeded(&embedder).await;
        let outcome = hybrid_search(&store, &embedder, "quarterly budget", 1.0, 10)
            .await
            .unwrap();
        assert_eq!(outcome.lexical_candidates, 0);
        assert_eq!(outcome.semantic_candidates, 2);
        assert_eq!(outcome.results[0].source_path, "/n/budget.md");
    }

    #[tokio::test]
    async fn test_weight_out_of_range_is_rejected() {
        let embedder = DisabledEmbedder::default();
        let store = seeded(&embedder).await;
        let err = hybrid_search(&store, &embedder, "budget", 1.5, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_invalid_weight_makes_no_provider_call() {
        let embedder = Metered {
            inner: HashEmbedder::new(32).unwrap(),
            calls: AtomicUsize::new(0),
        };
        let store = seeded(&embedder).await;
        let before = embedder.calls.load(Ordering::SeqCst);

        for weight in [-0.1, 1.01, f64::NAN] {
            let err = hybrid_search(&store, &embedder, "budget", weight, 10)
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::InvalidInput(_)));
        }
        assert_eq!(embedder.calls.load(Ordering::SeqCst), before);
    }
}
