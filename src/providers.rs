//! Catalog of the providers this build can activate, with their status
//! under the current configuration and environment.

use serde::Serialize;

use crate::config::{Config, EMBEDDING_PROVIDERS, LLM_PROVIDERS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Embedding,
    Llm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Available,
    ApiKeyMissing,
    /// Not compiled into this build.
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderInfo {
    pub kind: ProviderKind,
    pub name: String,
    pub model: Option<String>,
    /// Known up front for embedding providers with configured dims.
    pub dimension: Option<usize>,
    pub status: ProviderStatus,
}

/// Provider name of an id such as `openai:text-embedding-3-small`.
pub fn provider_name(id: &str) -> &str {
    id.split_once(':').map_or(id, |(name, _)| name)
}

/// List every provider. `active_embedding` and `active_llm` are the ids
/// of the providers in use.
pub fn list_providers(config: &Config, active_embedding: &str, active_llm: &str) -> Vec<ProviderInfo> {
    list_with(config, active_embedding, active_llm, |var| {
        std::env::var(var).is_ok_and(|v| !v.is_empty())
    })
}

fn list_with(
    config: &Config,
    active_embedding: &str,
    active_llm: &str,
    has_key: impl Fn(&str) -> bool,
) -> Vec<ProviderInfo> {
    let status = |name: &str, active: &str, key: Option<&str>, built: bool| {
        if name == provider_name(active) {
            ProviderStatus::Active
        } else if !built {
            ProviderStatus::Unavailable
        } else if key.is_some_and(|var| !has_key(var)) {
            ProviderStatus::ApiKeyMissing
        } else {
            ProviderStatus::Available
        }
    };

    let e = &config.embedding;
    let mut out: Vec<ProviderInfo> = EMBEDDING_PROVIDERS
        .iter()
        .map(|&name| {
            let (model, dimension, key, built) = match name {
                "hash" => (None, Some(e.hash.dims), None, true),
                "openai" => (
                    Some(e.openai.model.clone()),
                    Some(e.openai.dims),
                    Some("OPENAI_API_KEY"),
                    true,
                ),
                "ollama" => (Some(e.ollama.model.clone()), Some(e.ollama.dims), None, true),
                "local" => (
                    Some(e.local.model.clone()),
                    None,
                    None,
                    cfg!(feature = "local-embeddings-fastembed"),
                ),
                _ => (None, None, None, true),
            };
            ProviderInfo {
                kind: ProviderKind::Embedding,
                name: name.to_string(),
                model,
                dimension,
                status: status(name, active_embedding, key, built),
            }
        })
        .collect();

    let l = &config.llm;
    out.extend(LLM_PROVIDERS.iter().map(|&name| {
        let (model, key) = match name {
            "openai" => (Some(l.openai.model.clone()), Some("OPENAI_API_KEY")),
            "ollama" => (Some(l.ollama.model.clone()), None),
            "gemini" => (Some(l.gemini.model.clone()), Some("GEMINI_API_KEY")),
            _ => (None, None),
        };
        ProviderInfo {
            kind: ProviderKind::Llm,
            name: name.to_string(),
            model,
            dimension: None,
            status: status(name, active_llm, key, true),
        }
    }));
    out
}
