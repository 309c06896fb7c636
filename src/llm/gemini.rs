//! Google Gemini `streamGenerateContent` with SSE streaming.
//!
//! Gemini has no system role in `contents`: the system prompt goes into
//! `systemInstruction`, and assistant turns are sent with role `model`.

use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use knowledge_engine_core::llm::{ChatMessage, ChatStream, LlmProvider, Role};
use knowledge_engine_core::{EngineError, Result, TransientKind};
use serde::Deserialize;

use crate::config::LlmConfig;
use crate::http;

const PROVIDER: &str = "gemini";

#[derive(Clone)]
pub struct GeminiChat {
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

impl std::fmt::Debug for GeminiChat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiChat")
            .field("id", &self.id)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

impl GeminiChat {
    /// # Errors
    ///
    /// [`EngineError::Configuration`] if `GEMINI_API_KEY` is not set.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY").map_err(|_| {
            EngineError::Configuration("GEMINI_API_KEY environment variable not set".to_string())
        })?;
        Self::with_api_key(config, api_key)
    }

    pub fn with_api_key(config: &LlmConfig, api_key: String) -> Result<Self> {
        let gc = &config.gemini;
        if gc.model.trim().is_empty() {
            return Err(EngineError::Configuration(
                "llm.gemini.model must be set".to_string(),
            ));
        }
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            id: format!("gemini:{}", gc.model),
            model: gc.model.clone(),
            url: gc.url.trim_end_matches('/').to_string(),
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
            .post(format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.url, self.model
            ))
            .header("x-goog-api-key", &self.api_key)
            .json(body);
        tokio::time::timeout(self.timeout, http::send(PROVIDER, request))
            .await
            .map_err(|_| {
                EngineError::transient(PROVIDER, TransientKind::Timeout, "no response headers")
            })?
    }
}

#[async_trait]
impl LlmProvider for GeminiChat {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream> {
        let body = request_body(messages, self.temperature, self.max_tokens);
        let response = http::with_retry(PROVIDER, self.max_retries, || self.open(&body)).await?;
        Ok(sse_to_stream(response))
    }
}

fn request_body(messages: &[ChatMessage], temperature: f32, max_tokens: u32) -> serde_json::Value {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let contents: Vec<serde_json::Value> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = if m.role == Role::Assistant { "model" } else { "user" };
            serde_json::json!({"role": role, "parts": [{"text": m.content}]})
        })
        .collect();

    let mut body = serde_json::json!({
        "contents": contents,
        "generationConfig": {
            "temperature": temperature,
            "maxOutputTokens": max_tokens,
        },
    });
    if !system.is_empty() {
        body["systemInstruction"] = serde_json::json!({
            "parts": [{"text": system.join("\n\n")}],
        });
    }
    body
}

fn sse_to_stream(response: reqwest::Response) -> ChatStream {
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
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(StreamChunk {
            error: Some(err), ..
        }) => Some(Err(EngineError::Provider {
            provider: PROVIDER.to_string(),
            message: err.message,
        })),
        Ok(chunk) => {
            let text: String = chunk
                .candidates
                .first()
                .and_then(|c| c.content.as_ref())
                .map(|c| c.parts.iter().filter_map(|p| p.text.as_deref()).collect())
                .unwrap_or_default();
            (!text.is_empty()).then(|| Ok(text))
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
    candidates: Vec<Candidate>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
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
    fn test_request_body_maps_roles() {
        let messages = vec![
            ChatMessage::system("Use the sources."),
            ChatMessage::user("q1"),
            ChatMessage::assistant("a1"),
            ChatMessage::user("q2"),
        ];
        let body = request_body(&messages, 0.2, 64);
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "Use the sources."
        );
        let roles: Vec<&str> = body["contents"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
    }

    #[test]
    fn test_parse_events() {
        let data = r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Hi"}]}}]}"#;
        assert_eq!(parse_sse_event(data).unwrap().unwrap(), "Hi");

        let finished = r#"{"candidates":[{"finishReason":"STOP"}]}"#;
        assert!(parse_sse_event(finished).is_none());

        let err = r#"{"error":{"code":400,"message":"API key not valid"}}"#;
        assert!(parse_sse_event(err).unwrap().is_err());
    }

    #[tokio::test]
    async fn test_stream_against_mock() {
        let body = concat!(
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Good \"}]}}]}\n\n",
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"morning\"}]},\"finishReason\":\"STOP\"}]}\n\n",
        );
        let url = testing::spawn_mock_server(vec![testing::response(
            "200 OK",
            "text/event-stream",
            body,
        )])
        .await;

        let mut config = LlmConfig::default();
        config.gemini.url = url;
        let chat = GeminiChat::with_api_key(&config, "test-key".into()).unwrap();
        assert_eq!(chat.id(), "gemini:gemini-1.5-flash");

        let mut stream = chat.chat_stream(&[ChatMessage::user("hi")]).await.unwrap();
        let mut out = String::new();
        while let Some(fragment) = stream.next().await {
            out.push_str(&fragment.unwrap());
        }
        assert_eq!(out, "Good morning");
    }
}
