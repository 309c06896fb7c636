//! Local ONNX embeddings via fastembed.
//!
//! The model is downloaded from Hugging Face on first use, cached, and
//! loaded when the provider is activated. After that, embeddings run
//! entirely offline.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use knowledge_engine_core::embedding::{validate_batch, EmbeddingProvider};
use knowledge_engine_core::models::{CostClass, ProviderDescriptor};
use knowledge_engine_core::{EngineError, Result};

use crate::config::EmbeddingConfig;

const PROVIDER: &str = "local";

#[derive(Clone)]
pub struct LocalEmbedder {
    descriptor: ProviderDescriptor,
    batch_size: usize,
    model: Arc<Mutex<fastembed::TextEmbedding>>,
}

impl std::fmt::Debug for LocalEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEmbedder")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

fn resolve_model(name: &str) -> Result<(fastembed::EmbeddingModel, usize)> {
    use fastembed::EmbeddingModel as M;
    match name {
        "all-minilm-l6-v2" => Ok((M::AllMiniLML6V2, 384)),
        "bge-small-en-v1.5" => Ok((M::BGESmallENV15, 384)),
        "bge-base-en-v1.5" => Ok((M::BGEBaseENV15, 768)),
        "bge-large-en-v1.5" => Ok((M::BGELargeENV15, 1024)),
        "nomic-embed-text-v1.5" => Ok((M::NomicEmbedTextV15, 768)),
        "multilingual-e5-small" => Ok((M::MultilingualE5Small, 384)),
        other => Err(EngineError::Configuration(format!(
            "Unknown local embedding model: '{other}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small"
        ))),
    }
}

impl LocalEmbedder {
    /// Load the model. Fails with [`EngineError::Configuration`] if the
    /// model name is unknown or the model cannot be initialized.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let name = config.local.model.as_str();
        let (model, dims) = resolve_model(name)?;
        let embedding = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(model).with_show_download_progress(false),
        )
        .map_err(|e| {
            EngineError::Configuration(format!("failed to load local model {name}: {e}"))
        })?;

        Ok(Self {
            descriptor: ProviderDescriptor::new(format!("local:{name}"), dims, CostClass::Free),
            batch_size: config.batch_size,
            model: Arc::new(Mutex::new(embedding)),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let model = Arc::clone(&self.model);
        let batch_size = self.batch_size;
        let owned = texts.to_vec();

        let vectors = tokio::task::spawn_blocking(move || {
            let mut model = model.lock().unwrap_or_else(PoisonError::into_inner);
            model.embed(owned, Some(batch_size))
        })
        .await
        .map_err(|e| EngineError::Provider {
            provider: PROVIDER.to_string(),
            message: format!("embedding task failed: {e}"),
        })?
        .map_err(|e| EngineError::Provider {
            provider: PROVIDER.to_string(),
            message: e.to_string(),
        })?;

        validate_batch(&self.descriptor, texts.len(), &vectors)?;
        Ok(vectors)
    }
}
