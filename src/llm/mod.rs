//! Chat model providers and selection.
//!
//! Like embeddings, the configured chat backends form a closed set,
//! [`AnyLlm`], chosen by name with [`create_llm`].

mod gemini;
mod ollama;
mod openai;

use async_trait::async_trait;
use knowledge_engine_core::llm::{ChatMessage, ChatStream, LlmProvider};
use knowledge_engine_core::{EngineError, Result};

use crate::config::LlmConfig;

pub use gemini::GeminiChat;
pub use ollama::OllamaChat;
pub use openai::OpenAiChat;

/// Used when `llm.provider = "disabled"`: every request fails with a
/// configuration error, search keeps working.
#[derive(Debug, Clone, Default)]
pub struct DisabledLlm;

#[async_trait]
impl LlmProvider for DisabledLlm {
    fn id(&self) -> &str {
        "disabled"
    }

    async fn chat_stream(&self, _messages: &[ChatMessage]) -> Result<ChatStream> {
        Err(EngineError::Configuration(
            "no LLM provider configured (set llm.provider)".to_string(),
        ))
    }
}

macro_rules! delegate_llm {
    ($self:expr, |$p:ident| $expr:expr) => {
        match $self {
            AnyLlm::OpenAi($p) => $expr,
            AnyLlm::Ollama($p) => $expr,
            AnyLlm::Gemini($p) => $expr,
            AnyLlm::Disabled($p) => $expr,
        }
    };
}

#[derive(Debug, Clone)]
pub enum AnyLlm {
    OpenAi(OpenAiChat),
    Ollama(OllamaChat),
    Gemini(GeminiChat),
    Disabled(DisabledLlm),
}

#[async_trait]
impl LlmProvider for AnyLlm {
    fn id(&self) -> &str {
        delegate_llm!(self, |p| p.id())
    }

    async fn chat_stream(&self, messages: &[ChatMessage]) -> Result<ChatStream> {
        delegate_llm!(self, |p| p.chat_stream(messages).await)
    }
}

/// Create the chat provider named `provider`: `openai`, `ollama`,
/// `gemini` or `disabled`.
pub fn create_llm(config: &LlmConfig, provider: &str) -> Result<AnyLlm> {
    match provider {
        "openai" => Ok(AnyLlm::OpenAi(OpenAiChat::new(config)?)),
        "ollama" => Ok(AnyLlm::Ollama(OllamaChat::new(config)?)),
        "gemini" => Ok(AnyLlm::Gemini(GeminiChat::new(config)?)),
        "disabled" => Ok(AnyLlm::Disabled(DisabledLlm)),
        other => Err(EngineError::Configuration(format!(
            "Unknown llm provider: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_llm() {
        let config = LlmConfig::default();
        assert_eq!(create_llm(&config, "disabled").unwrap().id(), "disabled");
        assert_eq!(create_llm(&config, "ollama").unwrap().id(), "ollama:llama3.2");
        assert!(create_llm(&config, "gpt-5").is_err());
    }

    #[tokio::test]
    async fn test_disabled_llm_fails_fast() {
        let err = DisabledLlm.chat_stream(&[]).await.err().unwrap();
        assert!(matches!(err, EngineError::Configuration(_)));
    }
}
