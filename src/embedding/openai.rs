//! OpenAI embeddings API.
//!
//! Calls `POST {url}/embeddings` with the configured model. Requires the
//! `OPENAI_API_KEY` environment variable at construction time.

use std::time::Duration;

use async_trait::async_trait;
use knowledge_engine_core::embedding::{validate_batch, EmbeddingProvider};
use knowledge_engine_core::models::{CostClass, ProviderDescriptor};
use knowledge_engine_core::{EngineError, Result};
use serde::Deserialize;

use crate::config::EmbeddingConfig;
use crate::http;

const PROVIDER: &str = "openai";

#[derive(Clone)]
pub struct OpenAiEmbedder {
    descriptor: ProviderDescriptor,
    model: String,
    url: String,
    api_key: String,
    max_retries: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiEmbedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbedder")
            .field("descriptor", &self.descriptor)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl OpenAiEmbedder {
    /// # Errors
    ///
    /// [`EngineError::Configuration`] if `OPENAI_API_KEY` is not set.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            EngineError::Configuration("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let oc = &config.openai;
        if oc.model.trim().is_empty() {
            return Err(EngineError::Configuration(
                "embedding.openai.model must be set".to_string(),
            ));
        }
        Ok(Self {
            descriptor: ProviderDescriptor::new(
                format!("openai:{}", oc.model),
                oc.dims,
                CostClass::Metered,
            ),
            model: oc.model.clone(),
            url: oc.url.trim_end_matches('/').to_string(),
            api_key,
            max_retries: config.max_retries,
            client: http::client(PROVIDER, Duration::from_secs(config.timeout_secs))?,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self
            .client
            .post(format!("{}/embeddings", self.url))
            .bearer_auth(&self.api_key)
            .json(&body);
        let response = http::send(PROVIDER, request).await?;
        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| http::classify_reqwest(PROVIDER, &e))?;
        Ok(parsed.into_vectors())
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl EmbeddingResponse {
    /// Vectors in request order.
    fn into_vectors(mut self) -> Vec<Vec<f32>> {
        self.data.sort_by_key(|d| d.index);
        self.data.into_iter().map(|d| d.embedding).collect()
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbedder {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors =
            http::with_retry(PROVIDER, self.max_retries, || self.request(texts)).await?;
        validate_batch(&self.descriptor, texts.len(), &vectors)?;
        Ok(vectors)
    }
}
