//! OpenAI chat completions with SSE streaming.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use knowledge_engine_core::llm::{ChatMessage, ChatStream, LlmProvider};
use knowledge_engine_core::{EngineError, Result, TransientKind};
use serde::Deserialize;

use crate::config::LlmConfig;
use crate::http;

const PROVIDER: &str = "openai";

#[derive(Clone)]
pub struct OpenAiChat {
    id: String,
    model: String,
    url: String,
    api_key: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    max_retries: u32,
    client: reqwest::Client,
}

impl std::fmt::Debug for OpenAiChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChat")
            .field("id", &self.id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl OpenAiChat {
    /// # Errors
    ///
    /// [`EngineError::Configuration`] if `OPENAI_API_KEY` is not set.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            EngineError::Configuration("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &LlmConfig, api_key: String) -> Result<Self> {
        let oc = &config.openai;
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            id: format!("openai:{}", oc.model),
            model: oc.model.clone(),
            url: oc.url.trim_end_matches('/').to_string(),
            api_key,
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout,
            max_retries: config.max_retries,
            client: http::streaming_client(PROVIDER, timeout)?,
        })
    }

    async fn open(&self, body: &serde_json::Value) -> Result<reqwest::Response> {
        let request = self
            .client
            .post(format!("{}/chat/completions", self.url))
            .bearer_auth(&self.api_key)
            .json(body);
        tokio::time::timeout(self.timeout, http::send(PROVIDER, request))
            .await
            .map_err(|_| {
                EngineError::transient(PROVIDER, TransientKind::Timeout, "no response headers")
            })?
    }
}

#[async_trait]
impl LlmProvider for OpenAiChat {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
        });
        let response = http::with_retry(PROVIDER, self.max_retries, || self.open(&body)).await?;
        Ok(sse_to_stream(response))
    }
}

/// Convert an SSE response body into a stream of content fragments.
pub(crate) fn sse_to_stream(response: reqwest::Response) -> ChatStream {
    let events = response.bytes_stream().eventsource();
    let mapped = events.filter_map(|event| {
        futures::future::ready(match event {
            Ok(event) => parse_sse_event(&event.data),
            Err(e) => Some(Err(EngineError::transient(
                PROVIDER,
                TransientKind::Network,
                format!("stream interrupted: {e}"),
            ))),
        })
    });
    Box::pin(mapped)
}

fn parse_sse_event(data: &str) -> Option<Result<String>> {
    if data == "[DONE]" {
        return None;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            if let Some(err) = chunk.error {
                return Some(Err(EngineError::Provider {
                    provider: PROVIDER.to_string(),
                    message: err.message,
                }));
            }
            let content = chunk
                .choices
                .first()
                .and_then(|c| c.delta.content.as_deref())
                .unwrap_or_default();
            if content.is_empty() {
                None
            } else {
                Some(Ok(content.to_owned()))
            }
        }
        Err(e) => Some(Err(EngineError::Provider {
            provider: PROVIDER.to_string(),
            message: format!("failed to parse SSE data: {e}"),
        })),
    }
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct StreamError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing;

    #[test]
    fn test_parse_content_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(parse_sse_event(data).unwrap().unwrap(), "Hello");
    }

    #[test]
    fn test_parse_done_and_empty() {
        assert!(parse_sse_event("[DONE]").is_none());
        assert!(parse_sse_event(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).is_none());
    }

    #[test]
    fn test_parse_error_event() {
        let data = r#"{"error":{"message":"server overloaded"}}"#;
        assert!(parse_sse_event(data).unwrap().is_err());
    }

    #[tokio::test]
    async fn test_stream_against_mock() {
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: [DONE]\n\n",
        );
        let url = testing::spawn_mock_server(vec![testing::response(
            "200 OK",
            "text/event-stream",
            body,
        )])
        .await;

        let mut config = LlmConfig::default();
        config.openai.url = url;
        let chat = OpenAiChat::with_api_key(&config, "sk-test".into()).unwrap();
        let mut stream = chat
            .chat_stream(&[ChatMessage::user("hi")])
            .await
            .unwrap();

        let mut out = String::new();
        while let Some(fragment) = stream.next().await {
            out.push_str(&fragment.unwrap());
        }
        assert_eq!(out, "Hello");
    }
}
