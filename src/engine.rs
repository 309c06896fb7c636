//! The engine facade: one shared store plus the active providers, the
//! scan controller and the conversation history.
//!
//! Providers sit in swappable slots. Every operation takes the provider
//! that is active when it starts and keeps it to the end, so a switch
//! only affects later operations.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use knowledge_engine_core::chunk::ChunkParams;
use knowledge_engine_core::embedding::{embed_query, EmbeddingProvider};
use knowledge_engine_core::llm::{LlmProvider, Role};
use knowledge_engine_core::models::{Chunk, Document, IngestItem, ProviderDescriptor, SearchResult};
use knowledge_engine_core::store::memory::InMemoryStore;
use knowledge_engine_core::store::{ConsistencyReport, Store, StoreStats};
use knowledge_engine_core::{EngineError, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::chat::{AnswerSettings, Answerer, ChatEvent, ChatRequest};
use crate::config::Config;
use crate::conversation::ConversationStore;
use crate::embedding::create_embedder;
use crate::http;
use crate::ingest::{self, IngestReport, ReindexReport};
use crate::llm::create_llm;
use crate::providers::{list_providers, ProviderInfo};
use crate::retrieve::hybrid_search;
use crate::scan::{ScanController, ScanJob, ScanSnapshot};
use crate::sources::{FolderSource, SourceRegistry};

const EVENT_BUFFER: usize = 64;
const SAMPLE_VALUES: usize = 10;

/// Holds the active provider behind a lock so it can be replaced while
/// readers keep the `Arc` they already took.
struct ProviderSlot<T: ?Sized> {
    inner: RwLock<Arc<T>>,
}

impl<T: ?Sized> ProviderSlot<T> {
    fn new(value: Arc<T>) -> Self {
        Self {
            inner: RwLock::new(value),
        }
    }

    fn get(&self) -> Arc<T> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set(&self, value: Arc<T>) -> Arc<T> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *guard, value)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub query: String,
    /// Defaults to `retrieval.final_limit`.
    pub limit: Option<usize>,
    /// Defaults to `retrieval.semantic_weight`.
    pub semantic_weight: Option<f64>,
}

impl SearchQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub total_results: usize,
    /// Chunks left out of semantic ranking because they have no vector
    /// from the active provider.
    pub stale_chunks: usize,
    pub search_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Outcome of embedding a sample text with the active provider.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingTestResult {
    pub success: bool,
    pub provider: String,
    pub dimension: usize,
    pub time_ms: f64,
    /// The first values of the vector.
    pub sample_values: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Engine {
    config: Config,
    params: ChunkParams,
    store: Arc<dyn Store>,
    embedder: ProviderSlot<dyn EmbeddingProvider>,
    llm: ProviderSlot<dyn LlmProvider>,
    conversations: Arc<ConversationStore>,
    scans: ScanController,
    sources: Arc<SourceRegistry>,
    /// Held across "is a scan running" plus the action that depends on it,
    /// so a scan never starts with a provider that is being replaced.
    switch: Mutex<()>,
}

impl Engine {
    /// Build an engine with an in-memory store and the providers named in
    /// `config`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Configuration`] when chunking parameters are invalid
    /// or a provider cannot be activated.
    pub fn new(config: Config) -> Result<Self> {
        let embedder = create_embedder(&config.embedding, &config.embedding.provider)?;
        let llm = create_llm(&config.llm, &config.llm.provider)?;
        Self::with_providers(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(embedder),
            Arc::new(llm),
        )
    }

    pub fn with_providers(
        config: Config,
        store: Arc<dyn Store>,
        embedder: Arc<dyn EmbeddingProvider>,
        llm: Arc<dyn LlmProvider>,
    ) -> Result<Self> {
        let params = ChunkParams::new(config.chunking.chunk_size, config.chunking.overlap)?;
        let sources = SourceRegistry::new();
        for source in &config.sources {
            let added = sources.add(&source.path, source.recursive).and_then(|added| {
                if source.enabled {
                    Ok(added)
                } else {
                    sources.update(&added.path, Some(false), None)
                }
            });
            if let Err(e) = added {
                warn!(path = %source.path.display(), error = %e, "skipping configured source");
            }
        }
        info!(
            embedding = %embedder.descriptor().id,
            dimension = embedder.descriptor().dimension,
            llm = llm.id(),
            "engine ready"
        );
        Ok(Self {
            config,
            params,
            store,
            embedder: ProviderSlot::new(embedder),
            llm: ProviderSlot::new(llm),
            conversations: Arc::new(ConversationStore::new()),
            scans: ScanController::new(),
            sources: Arc::new(sources),
            switch: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn embedding_descriptor(&self) -> ProviderDescriptor {
        self.embedder.get().descriptor().clone()
    }

    pub fn llm_id(&self) -> String {
        self.llm.get().id().to_string()
    }

    pub async fn ingest(&self, item: IngestItem) -> Result<IngestReport> {
        let embedder = self.embedder.get();
        ingest::ingest_item(
            self.store.as_ref(),
            embedder.as_ref(),
            &self.params,
            self.config.embedding.batch_size,
            item,
        )
        .await
    }

    /// Remove a document with its chunks, postings and vectors.
    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        self.store.delete_document(id).await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        self.store.stats().await
    }

    /// Page through indexed documents, newest first.
    pub async fn list_documents(&self, limit: usize, offset: usize) -> Result<Vec<Document>> {
        self.store.list_documents(limit, offset).await
    }

    /// Page through the chunks of one document in reading order.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown document.
    pub async fn document_chunks(&self, id: &str, limit: usize, offset: usize) -> Result<Vec<Chunk>> {
        if self.store.get_document(id).await?.is_none() {
            return Err(EngineError::NotFound(format!("document {id}")));
        }
        let chunks = self.store.get_chunks(id).await?;
        Ok(chunks.into_iter().skip(offset).take(limit).collect())
    }

    /// Run a hybrid search. Failures come back as an empty result list
    /// with `error` set.
    pub async fn search(&self, query: SearchQuery) -> SearchResponse {
        let started = Instant::now();
        let embedder = self.embedder.get();
        let weight = query
            .semantic_weight
            .unwrap_or(self.config.retrieval.semantic_weight);
        let limit = query.limit.unwrap_or(self.config.retrieval.final_limit);

        let outcome = hybrid_search(
            self.store.as_ref(),
            embedder.as_ref(),
            &query.query,
            weight,
            limit,
        )
        .await;
        let search_time_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(outcome) => SearchResponse {
                total_results: outcome.results.len(),
                results: outcome.results,
                stale_chunks: outcome.stale_excluded,
                search_time_ms,
                error: None,
            },
            Err(e) => {
                warn!(query = %query.query, error = %e, "search failed");
                SearchResponse {
                    search_time_ms,
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    fn answerer(&self) -> Answerer {
        let r = &self.config.retrieval;
        let fragment_timeout = Duration::from_secs(self.config.llm.timeout_secs);
        Answerer::new(
            Arc::clone(&self.store),
            self.embedder.get(),
            self.llm.get(),
            AnswerSettings {
                semantic_weight: r.semantic_weight,
                top_k_context: r.top_k_context,
                history_turns: r.history_turns,
                open_timeout: http::retry_deadline(fragment_timeout, self.config.llm.max_retries),
                fragment_timeout,
            },
        )
    }

    /// Answer a question over the indexed documents.
    pub fn chat(&self, request: ChatRequest) -> mpsc::Receiver<ChatEvent> {
        self.answerer().answer(request)
    }

    /// Answer within a stored conversation. The question and the answer,
    /// partial or complete, are appended to it.
    ///
    /// # Errors
    ///
    /// [`EngineError::NotFound`] for an unknown conversation.
    pub fn chat_in_conversation(
        &self,
        conversation_id: &str,
        message: &str,
    ) -> Result<mpsc::Receiver<ChatEvent>> {
        let history = self
            .conversations
            .history(conversation_id, self.config.retrieval.history_turns)?;
        self.conversations
            .append(conversation_id, Role::User, message, Vec::new())?;

        let answerer = self.answerer();
        let conversations = Arc::clone(&self.conversations);
        let id = conversation_id.to_string();
        let request = ChatRequest {
            message: message.to_string(),
            history,
            top_k_context: None,
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        tokio::spawn(async move {
            let outcome = answerer.run(request, &tx).await;
            if outcome.answer.is_empty() && outcome.error.is_none() {
                return;
            }
            if let Err(e) =
                conversations.append(&id, Role::Assistant, &outcome.answer, outcome.sources)
            {
                warn!(conversation = %id, error = %e, "could not record answer");
            }
        });
        Ok(rx)
    }

    pub fn conversations(&self) -> &ConversationStore {
        &self.conversations
    }

    fn scan_job(&self) -> ScanJob {
        ScanJob {
            store: Arc::clone(&self.store),
            embedder: self.embedder.get(),
            params: self.params,
            batch_size: self.config.embedding.batch_size,
            config: self.config.scan.clone(),
            sources: Some(Arc::clone(&self.sources)),
        }
    }

    pub fn start_scan(&self, root: impl Into<PathBuf>) -> Result<u64> {
        let _switch = self.switch.lock().unwrap_or_else(PoisonError::into_inner);
        self.scans.start(root, self.scan_job())
    }

    /// Scan every enabled folder source in one job.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidInput`] when no source is enabled, or
    /// [`EngineError::ScanInProgress`].
    pub fn scan_all(&self) -> Result<u64> {
        let roots = self.sources.enabled_roots();
        if roots.is_empty() {
            return Err(EngineError::InvalidInput(
                "no enabled folder sources".to_string(),
            ));
        }
        let _switch = self.switch.lock().unwrap_or_else(PoisonError::into_inner);
        self.scans.start_roots(roots, self.scan_job())
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn add_source(&self, path: impl AsRef<Path>, recursive: bool) -> Result<FolderSource> {
        self.sources.add(path, recursive)
    }

    pub fn stop_scan(&self) -> bool {
        self.scans.stop()
    }

    pub fn scan_status(&self) -> Arc<ScanSnapshot> {
        self.scans.status()
    }

    pub async fn wait_for_scan(&self) -> Arc<ScanSnapshot> {
        self.scans.wait().await
    }

    /// Activate the embedding provider named `name` from the config.
    ///
    /// Returns how many chunks are now stale. Stored vectors are kept;
    /// stale chunks are left out of semantic ranking until
    /// [`reindex_stale`](Self::reindex_stale).
    ///
    /// # Errors
    ///
    /// [`EngineError::ScanInProgress`] while a scan runs, or
    /// [`EngineError::Configuration`] when the provider cannot be built.
    pub async fn set_embedding_provider(&self, name: &str) -> Result<usize> {
        if self.scans.is_running() {
            return Err(EngineError::ScanInProgress);
        }
        let provider = create_embedder(&self.config.embedding, name)?;
        self.activate_embedding_provider(Arc::new(provider)).await
    }

    /// Activate an already constructed embedding provider.
    pub async fn activate_embedding_provider(
        &self,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<usize> {
        let descriptor = provider.descriptor().clone();
        let previous = {
            let _switch = self.switch.lock().unwrap_or_else(PoisonError::into_inner);
            if self.scans.is_running() {
                return Err(EngineError::ScanInProgress);
            }
            self.embedder.set(provider)
        };
        let stale = self.store.stale_count(&descriptor).await?;
        info!(
            from = %previous.descriptor().id,
            to = %descriptor.id,
            dimension = descriptor.dimension,
            stale,
            "embedding provider switched"
        );
        Ok(stale)
    }

    /// Every provider this build knows, with its status.
    pub fn providers(&self) -> Vec<ProviderInfo> {
        list_providers(
            &self.config,
            &self.embedding_descriptor().id,
            &self.llm_id(),
        )
    }

    /// Embed `text` with the active provider and report timing and a
    /// sample of the vector. Failures are reported, not returned.
    pub async fn test_embedding(&self, text: &str) -> EmbeddingTestResult {
        let embedder = self.embedder.get();
        let provider = embedder.descriptor().id.clone();
        let started = Instant::now();
        match embed_query(embedder.as_ref(), text).await {
            Ok(vector) => EmbeddingTestResult {
                success: true,
                provider,
                dimension: vector.len(),
                time_ms: started.elapsed().as_secs_f64() * 1000.0,
                sample_values: vector.iter().take(SAMPLE_VALUES).copied().collect(),
                error: None,
            },
            Err(e) => {
                warn!(provider = %provider, error = %e, "embedding test failed");
                EmbeddingTestResult {
                    success: false,
                    provider,
                    dimension: 0,
                    time_ms: 0.0,
                    sample_values: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Activate the chat provider named `name` for subsequent turns.
    pub fn set_llm_provider(&self, name: &str) -> Result<()> {
        let provider = create_llm(&self.config.llm, name)?;
        self.activate_llm_provider(Arc::new(provider));
        Ok(())
    }

    pub fn activate_llm_provider(&self, provider: Arc<dyn LlmProvider>) {
        let id = provider.id().to_string();
        let previous = self.llm.set(provider);
        info!(from = previous.id(), to = %id, "llm provider switched");
    }

    /// Re-embed stale chunks with the active provider.
    pub async fn reindex_stale(&self) -> Result<ReindexReport> {
        if self.scans.is_running() {
            return Err(EngineError::ScanInProgress);
        }
        let embedder = self.embedder.get();
        ingest::reindex_stale(
            self.store.as_ref(),
            embedder.as_ref(),
            self.config.embedding.batch_size,
        )
        .await
    }

    pub async fn check_consistency(&self) -> Result<ConsistencyReport> {
        self.store.check_consistency().await
    }

    /// Rebuild both indices from the chunk records. Returns what was
    /// inconsistent before the rebuild.
    pub async fn repair_indexes(&self) -> Result<ConsistencyReport> {
        let report = self.store.repair_indexes().await?;
        if !report.is_consistent() {
            warn!(
                missing_lexical = report.missing_lexical.len(),
                orphan_lexical = report.orphan_lexical.len(),
                missing_vectors = report.missing_vectors.len(),
                orphan_vectors = report.orphan_vectors.len(),
                "indexes repaired"
            );
        }
        Ok(report)
    }
}
