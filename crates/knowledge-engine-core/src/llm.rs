//! Chat model provider trait.
//!
//! Parallel to [`EmbeddingProvider`](crate::embedding::EmbeddingProvider):
//! concrete backends live in the app crate, the answerer only sees this
//! trait and a stream of text fragments.

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use futures_core::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }
}

/// Incremental answer text. Each item is one fragment as it arrives.
pub type ChatStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Stable provider id, e.g. `"openai:gpt-4o-mini"`.
    fn id(&self) -> &str;

    /// Start a streaming completion.
    ///
    /// Errors returned here happen before the first fragment; errors
    /// yielded by the stream happen mid-answer.
    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream>;
}
