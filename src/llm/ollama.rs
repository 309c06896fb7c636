//! Ollama `/api/chat` with newline-delimited JSON streaming.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use knowledge_engine_core::llm::{ChatMessage, ChatStream, LlmProvider};
use knowledge_engine_core::{EngineError, Result, TransientKind};
use serde::Deserialize;

use crate::config::LlmConfig;
use crate::http;

const PROVIDER: &str = "ollama";

#[derive(Debug, Clone)]
pub struct OllamaChat {
    id: String,
    model: String,
    url: String,
    max_tokens: u32,
    temperature: f32,
    timeout: Duration,
    max_retries: u32,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let oc = &config.ollama;
        if oc.model.trim().is_empty() {
            return Err(EngineError::Configuration(
                "llm.ollama.model must be set".to_string(),
            ));
        }
        let timeout = Duration::from_secs(config.timeout_secs);
        Ok(Self {
            id: format!("ollama:{}", oc.model),
            model: oc.model.clone(),
            url: oc.url.trim_end_matches('/').to_string(),
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
            .post(format!("{}/api/chat", self.url))
            .json(body);
        tokio::time::timeout(self.timeout, http::send(PROVIDER, request))
            .await
            .map_err(|_| {
                EngineError::transient(PROVIDER, TransientKind::Timeout, "no response headers")
            })?
    }
}

#[async_trait]
impl LlmProvider for OllamaChat {
    fn id(&self) -> &str {
        &self.id
    }

    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": true,
            "options": {
                "temperature": self.temperature,
                "num_predict": self.max_tokens,
            },
        });
        let response = http::with_retry(PROVIDER, self.max_retries, || self.open(&body)).await?;
        Ok(ndjson_to_stream(response))
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

fn parse_line(line: &[u8]) -> Option<Result<String>> {
    let line = std::str::from_utf8(line).ok()?.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str::<ChatChunk>(line) {
        Ok(ChatChunk {
            error: Some(message),
            ..
        }) => Some(Err(EngineError::Provider {
            provider: PROVIDER.to_string(),
            message,
        })),
        Ok(ChatChunk {
            message: Some(m), ..
        }) if !m.content.is_empty() => Some(Ok(m.content)),
        Ok(_) => None,
        Err(e) => Some(Err(EngineError::Provider {
            provider: PROVIDER.to_string(),
            message: format!("failed to parse stream line: {e}"),
        })),
    }
}

/// Split the response body on newlines and yield the content of each
/// JSON line.
fn ndjson_to_stream(response: reqwest::Response) -> ChatStream {
    let bytes = Box::pin(response.bytes_stream());
    let stream = futures::stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        |(mut bytes, mut buf, finished)| async move {
            if finished {
                return None;
            }
            loop {
                if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buf.drain(..=pos).collect();
                    if let Some(item) = parse_line(&line) {
                        return Some((item, (bytes, buf, false)));
                    }
                    continue;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        let err = EngineError::transient(
                            PROVIDER,
                            TransientKind::Network,
                            format!("stream interrupted: {e}"),
                        );
                        return Some((Err(err), (bytes, buf, true)));
                    }
                    None => {
                        let rest = std::mem::take(&mut buf);
                        return parse_line(&rest).map(|item| (item, (bytes, buf, true)));
                    }
                }
            }
        },
    );
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::testing;

    #[test]
    fn test_parse_lines() {
        let line = br#"{"message":{"role":"assistant","content":"Hi"},"done":false}"#;
        assert_eq!(parse_line(line).unwrap().unwrap(), "Hi");

        let done = br#"{"message":{"role":"assistant","content":""},"done":true}"#;
        assert!(parse_line(done).is_none());

        let err = br#"{"error":"model not found"}"#;
        assert!(parse_line(err).unwrap().is_err());

        assert!(parse_line(b"  \n").is_none());
    }

    #[tokio::test]
    async fn test_stream_against_mock() {
        let body = concat!(
            "{\"message\":{\"role\":\"assistant\",\"content\":\"Good \"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"morning\"},\"done\":false}\n",
            "{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true}",
        );
        let url = testing::spawn_mock_server(vec![testing::response(
            "200 OK",
            "application/x-ndjson",
            body,
        )])
        .await;

        let mut config = LlmConfig::default();
        config.ollama.url = url;
        let chat = OllamaChat::new(&config).unwrap();
        let mut stream = chat.chat_stream(&[ChatMessage::user("hi")]).await.unwrap();

        let mut out = String::new();
        while let Some(fragment) = stream.next().await {
            out.push_str(&fragment.unwrap());
        }
        assert_eq!(out, "Good morning");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_errors() {
        let mut config = LlmConfig::default();
        config.ollama.url = "http://127.0.0.1:1".to_string();
        config.max_retries = 0;
        let chat = OllamaChat::new(&config).unwrap();
        let result = chat.chat_stream(&[ChatMessage::user("hello")]).await;
        assert!(result.is_err());
    }
}
