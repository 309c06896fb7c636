//! Embedding provider implementations and selection.
//!
//! The configured backends form a closed set, [`AnyEmbedder`]:
//! - **[`HashEmbedder`]**: offline feature hashing, deterministic, the default.
//! - **[`OpenAiEmbedder`]**: OpenAI embeddings API with retry and backoff.
//! - **[`OllamaEmbedder`]**: a local Ollama instance's `/api/embed` endpoint.
//! - **`LocalEmbedder`**: fastembed ONNX models (feature `local-embeddings-fastembed`).
//! - **[`DisabledEmbedder`]**: dimension 0; semantic search is unavailable.
//!
//! # Provider Selection
//!
//! Use [`create_embedder`] to instantiate a provider by name:
//!
//! ```rust
//! # use knowledge_engine::config::EmbeddingConfig;
//! # use knowledge_engine::embedding::create_embedder;
//! use knowledge_engine_core::embedding::EmbeddingProvider;
//!
//! let config = EmbeddingConfig::default(); // provider = "hash"
//! let provider = create_embedder(&config, &config.provider).unwrap();
//! assert_eq!(provider.descriptor().dimension, 384);
//! ```
//!
//! Construction is where credentials and model files are checked, so a
//! misconfigured provider fails at activation rather than mid-batch.

mod hash;
#[cfg(feature = "local-embeddings-fastembed")]
mod local;
mod ollama;
mod openai;

use async_trait::async_trait;
use knowledge_engine_core::embedding::EmbeddingProvider;
use knowledge_engine_core::models::ProviderDescriptor;
use knowledge_engine_core::{EngineError, Result};

use crate::config::EmbeddingConfig;

pub use hash::HashEmbedder;
#[cfg(feature = "local-embeddings-fastembed")]
pub use local::LocalEmbedder;
pub use ollama::OllamaEmbedder;
pub use openai::OpenAiEmbedder;

/// Placeholder used when `embedding.provider = "disabled"`.
#[derive(Debug, Clone)]
pub struct DisabledEmbedder {
    descriptor: ProviderDescriptor,
}

impl Default for DisabledEmbedder {
    fn default() -> Self {
        Self {
            descriptor: ProviderDescriptor::disabled(),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for DisabledEmbedder {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(EngineError::Configuration(
            "embedding provider is disabled".to_string(),
        ))
    }
}

/// Generates a match over all `AnyEmbedder` variants, binding the inner
/// provider and evaluating the given expression for each arm.
macro_rules! delegate_embedder {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            AnyEmbedder::Hash($p) => $expr,
            AnyEmbedder::OpenAi($p) => $expr,
            AnyEmbedder::Ollama($p) => $expr,
            #[cfg(feature = "local-embeddings-fastembed")]
            AnyEmbedder::Local($p) => $expr,
            AnyEmbedder::Disabled($p) => $expr,
        }
    };
}

#[derive(Debug, Clone)]
pub enum AnyEmbedder {
    Hash(HashEmbedder),
    OpenAi(OpenAiEmbedder),
    Ollama(OllamaEmbedder),
    #[cfg(feature = "local-embeddings-fastembed")]
    Local(LocalEmbedder),
    Disabled(DisabledEmbedder),
}

#[async_trait]
impl EmbeddingProvider for AnyEmbedder {
    fn descriptor(&self) -> &ProviderDescriptor {
        delegate_embedder!(self, |p| p.descriptor())
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        delegate_embedder!(self, |p| p.embed_batch(texts).await)
    }
}

/// Create the embedding provider named `provider`.
///
/// # Supported Providers
///
/// | Name | Provider |
/// |------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
/// | `"local"` | `LocalEmbedder` (feature `local-embeddings-fastembed`) |
/// | `"disabled"` | [`DisabledEmbedder`] |
///
/// # Errors
///
/// [`EngineError::Configuration`] for unknown names, missing credentials,
/// unknown local models, or a build without the needed feature.
pub fn create_embedder(config: &EmbeddingConfig, provider: &str) -> Result<AnyEmbedder> {
    match provider {
        "hash" => Ok(AnyEmbedder::Hash(HashEmbedder::new(config.hash.dims)?)),
        "openai" => Ok(AnyEmbedder::OpenAi(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(AnyEmbedder::Ollama(OllamaEmbedder::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(AnyEmbedder::Local(LocalEmbedder::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(EngineError::Configuration(
            "Local embedding provider requires --features local-embeddings-fastembed".to_string(),
        )),
        "disabled" => Ok(AnyEmbedder::Disabled(DisabledEmbedder::default())),
        other => Err(EngineError::Configuration(format!(
            "Unknown embedding provider: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_providers() {
        let config = EmbeddingConfig::default();
        let hash = create_embedder(&config, "hash").unwrap();
        assert_eq!(hash.descriptor().id, "hash:384");

        let disabled = create_embedder(&config, "disabled").unwrap();
        assert!(!disabled.descriptor().is_enabled());

        let ollama = create_embedder(&config, "ollama").unwrap();
        assert_eq!(ollama.descriptor().dimension, 768);
    }

    #[test]
    fn test_unknown_provider_is_configuration_error() {
        let config = EmbeddingConfig::default();
        assert!(matches!(
            create_embedder(&config, "word2vec"),
            Err(EngineError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_refuses_to_embed() {
        let e = DisabledEmbedder::default();
        assert!(e.embed_batch(&["x".to_string()]).await.is_err());
    }
}
