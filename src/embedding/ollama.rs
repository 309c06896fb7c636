//! Embeddings from a local Ollama server.
//!
//! Calls `POST {url}/api/embed`. Requires Ollama to be running with the
//! model pulled (e.g. `ollama pull nomic-embed-text`).

use std::time::Duration;

use async_trait::async_trait;
use knowledge_engine_core::embedding::{validate_batch, EmbeddingProvider};
use knowledge_engine_core::models::{CostClass, ProviderDescriptor};
use knowledge_engine_core::{EngineError, Result};
use serde::Deserialize;

use crate::config::EmbeddingConfig;
use crate::http;

const PROVIDER: &str = "ollama";

#[derive(Debug, Clone)]
pub struct OllamaEmbedder {
    descriptor: ProviderDescriptor,
    model: String,
    url: String,
    max_retries: u32,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let oc = &config.ollama;
        if oc.model.trim().is_empty() {
            return Err(EngineError::Configuration(
                "embedding.ollama.model must be set".to_string(),
            ));
        }
        Ok(Self {
            descriptor: ProviderDescriptor::new(
                format!("ollama:{}", oc.model),
                oc.dims,
                CostClass::Free,
            ),
            model: oc.model.clone(),
            url: oc.url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
            client: http::client(PROVIDER, Duration::from_secs(config.timeout_secs))?,
        })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let request = self.client.post(format!("{}/api/embed", self.url)).json(&body);
        let response = http::send(PROVIDER, request).await?;
        let parsed: EmbedResponse = response
            .json()
            .await
            .map_err(|e| http::classify_reqwest(PROVIDER, &e))?;
        Ok(parsed.embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbedder {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing;

    #[tokio::test]
    async fn test_embed_batch_against_mock() {
        let url = testing::spawn_mock_server(vec![testing::json(
            "200 OK",
            r#"{"model":"nomic-embed-text","embeddings":[[1.0,0.0,0.0]]}"#,
        )])
        .await;
        let mut config = EmbeddingConfig::default();
        config.ollama.url = url;
        config.ollama.dims = 3;
        config.max_retries = 0;

        let e = OllamaEmbedder::new(&config).unwrap();
        assert_eq!(e.descriptor().id, "ollama:nomic-embed-text");
        let out = e.embed_batch(&["hello".to_string()]).await.unwrap();
        assert_eq!(out, vec![vec![1.0, 0.0, 0.0]]);
    }

    #[tokio::test]
    async fn test_missing_model_is_permanent() {
        let url = testing::spawn_mock_server(vec![testing::json(
            "404 Not Found",
            r#"{"error":"model \"nomic-embed-text\" not found, try pulling it first"}"#,
        )])
        .await;
        let mut config = EmbeddingConfig::default();
        config.ollama.url = url;
        config.max_retries = 3;

        let e = OllamaEmbedder::new(&config).unwrap();
        let err = e.embed_batch(&["hello".to_string()]).await.unwrap_err();
        assert!(!err.is_retryable());
    }
}
