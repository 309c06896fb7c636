use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level configuration. Every section has defaults, so an empty file
/// (or no file at all) yields a working offline setup.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    /// Folders registered at startup for `scan_all`.
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            overlap: default_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    512
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_semantic_weight")]
    pub semantic_weight: f64,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_top_k_context")]
    pub top_k_context: usize,
    #[serde(default = "default_history_turns")]
    pub history_turns: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            semantic_weight: default_semantic_weight(),
            final_limit: default_final_limit(),
            top_k_context: default_top_k_context(),
            history_turns: default_history_turns(),
        }
    }
}

fn default_semantic_weight() -> f64 {
    0.7
}
fn default_final_limit() -> usize {
    12
}
fn default_top_k_context() -> usize {
    3
}
fn default_history_turns() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    /// `hash`, `local`, `openai`, `ollama` or `disabled`.
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub hash: HashEmbeddingConfig,
    #[serde(default)]
    pub openai: OpenAiEmbeddingConfig,
    #[serde(default)]
    pub ollama: OllamaEmbeddingConfig,
    #[serde(default)]
    pub local: LocalEmbeddingConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            hash: HashEmbeddingConfig::default(),
            openai: OpenAiEmbeddingConfig::default(),
            ollama: OllamaEmbeddingConfig::default(),
            local: LocalEmbeddingConfig::default(),
        }
    }
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct HashEmbeddingConfig {
    #[serde(default = "default_hash_dims")]
    pub dims: usize,
}

impl Default for HashEmbeddingConfig {
    fn default() -> Self {
        Self {
            dims: default_hash_dims(),
        }
    }
}

fn default_hash_dims() -> usize {
    384
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiEmbeddingConfig {
    #[serde(default = "default_openai_embedding_model")]
    pub model: String,
    #[serde(default = "default_openai_embedding_dims")]
    pub dims: usize,
    #[serde(default = "default_openai_url")]
    pub url: String,
}

impl Default for OpenAiEmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_openai_embedding_model(),
            dims: default_openai_embedding_dims(),
            url: default_openai_url(),
        }
    }
}

fn default_openai_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}
fn default_openai_embedding_dims() -> usize {
    1536
}
fn default_openai_url() -> String {
    "https://api.openai.com/v1".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OllamaEmbeddingConfig {
    #[serde(default = "default_ollama_embedding_model")]
    pub model: String,
    #[serde(default = "default_ollama_embedding_dims")]
    pub dims: usize,
    #[serde(default = "default_ollama_url")]
    pub url: String,
}

impl Default for OllamaEmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_ollama_embedding_model(),
            dims: default_ollama_embedding_dims(),
            url: default_ollama_url(),
        }
    }
}

fn default_ollama_embedding_model() -> String {
    "nomic-embed-text".to_string()
}
fn default_ollama_embedding_dims() -> usize {
    768
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LocalEmbeddingConfig {
    #[serde(default = "default_local_model")]
    pub model: String,
}

impl Default for LocalEmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_local_model(),
        }
    }
}

fn default_local_model() -> String {
    "all-minilm-l6-v2".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    /// `openai`, `ollama` or `disabled`.
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Bound on the wait for each streamed fragment.
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_llm_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub openai: OpenAiLlmConfig,
    #[serde(default)]
    pub ollama: OllamaLlmConfig,
    #[serde(default)]
    pub gemini: GeminiLlmConfig,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_llm_timeout_secs(),
            max_retries: default_llm_max_retries(),
            openai: OpenAiLlmConfig::default(),
            ollama: OllamaLlmConfig::default(),
            gemini: GeminiLlmConfig::default(),
        }
    }
}

fn default_llm_provider() -> String {
    "disabled".to_string()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.7
}
fn default_llm_timeout_secs() -> u64 {
    60
}
fn default_llm_max_retries() -> u32 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct OpenAiLlmConfig {
    #[serde(default = "default_openai_chat_model")]
    pub model: String,
    #[serde(default = "default_openai_url")]
    pub url: String,
}

impl Default for OpenAiLlmConfig {
    fn default() -> Self {
        Self {
            model: default_openai_chat_model(),
            url: default_openai_url(),
        }
    }
}

fn default_openai_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct OllamaLlmConfig {
    #[serde(default = "default_ollama_chat_model")]
    pub model: String,
    #[serde(default = "default_ollama_url")]
    pub url: String,
}

impl Default for OllamaLlmConfig {
    fn default() -> Self {
        Self {
            model: default_ollama_chat_model(),
            url: default_ollama_url(),
        }
    }
}

fn default_ollama_chat_model() -> String {
    "llama3.2".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeminiLlmConfig {
    #[serde(default = "default_gemini_model")]
    pub model: String,
    #[serde(default = "default_gemini_url")]
    pub url: String,
}

impl Default for GeminiLlmConfig {
    fn default() -> Self {
        Self {
            model: default_gemini_model(),
            url: default_gemini_url(),
        }
    }
}

fn default_gemini_model() -> String {
    "gemini-1.5-flash".to_string()
}

fn default_gemini_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ScanConfig {
    #[serde(default = "default_recursive")]
    pub recursive: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Directory names never descended into.
    #[serde(default = "default_skip_dirs")]
    pub skip_dirs: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            recursive: default_recursive(),
            max_file_bytes: default_max_file_bytes(),
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            skip_dirs: default_skip_dirs(),
        }
    }
}

fn default_recursive() -> bool {
    true
}
fn default_max_file_bytes() -> u64 {
    50 * 1024 * 1024
}
fn default_include_globs() -> Vec<String> {
    ["md", "markdown", "txt", "rst", "org", "csv", "json", "html", "htm"]
        .iter()
        .map(|ext| format!("**/*.{ext}"))
        .collect()
}
fn default_skip_dirs() -> Vec<String> {
    [
        "node_modules",
        "__pycache__",
        ".git",
        ".svn",
        ".venv",
        "venv",
        "target",
        ".cache",
        "$RECYCLE.BIN",
        "System Volume Information",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub const EMBEDDING_PROVIDERS: &[&str] = &["hash", "local", "openai", "ollama", "disabled"];
pub const LLM_PROVIDERS: &[&str] = &["openai", "ollama", "gemini", "disabled"];

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be > 0");
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            bail!(
                "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.overlap,
                self.chunking.chunk_size
            );
        }

        if self.retrieval.final_limit < 1 {
            bail!("retrieval.final_limit must be >= 1");
        }
        if self.retrieval.top_k_context < 1 {
            bail!("retrieval.top_k_context must be >= 1");
        }
        if !(0.0..=1.0).contains(&self.retrieval.semantic_weight) {
            bail!("retrieval.semantic_weight must be in [0.0, 1.0]");
        }

        if !EMBEDDING_PROVIDERS.contains(&self.embedding.provider.as_str()) {
            bail!(
                "Unknown embedding provider: '{}'. Must be one of: {}.",
                self.embedding.provider,
                EMBEDDING_PROVIDERS.join(", ")
            );
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be > 0");
        }
        let dims = match self.embedding.provider.as_str() {
            "hash" => Some(self.embedding.hash.dims),
            "openai" => Some(self.embedding.openai.dims),
            "ollama" => Some(self.embedding.ollama.dims),
            _ => None,
        };
        if dims == Some(0) {
            bail!(
                "embedding.{}.dims must be > 0",
                self.embedding.provider
            );
        }

        if !LLM_PROVIDERS.contains(&self.llm.provider.as_str()) {
            bail!(
                "Unknown llm provider: '{}'. Must be one of: {}.",
                self.llm.provider,
                LLM_PROVIDERS.join(", ")
            );
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            bail!("llm.temperature must be in [0.0, 2.0]");
        }
        if self.llm.timeout_secs == 0 || self.embedding.timeout_secs == 0 {
            bail!("timeout_secs must be > 0");
        }

        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.chunking.chunk_size, 512);
        assert_eq!(config.chunking.overlap, 50);
        assert_eq!(config.embedding.provider, "hash");
        assert_eq!(config.llm.provider, "disabled");
        assert_eq!(config.scan.max_file_bytes, 52_428_800);
    }

    #[test]
    fn test_sources_table() {
        let config: Config = toml::from_str(
            r#"
            [[sources]]
            path = "/home/me/notes"

            [[sources]]
            path = "/home/me/archive"
            recursive = false
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.sources.len(), 2);
        assert!(config.sources[0].recursive && config.sources[0].enabled);
        assert!(!config.sources[1].recursive);
        assert!(!config.sources[1].enabled);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [retrieval]
            semantic_weight = 0.0

            [embedding]
            provider = "openai"

            [embedding.openai]
            dims = 3072
            "#,
        )
        .unwrap();
        config.validate().unwrap();
        assert_eq!(config.retrieval.semantic_weight, 0.0);
        assert_eq!(config.retrieval.top_k_context, 3);
        assert_eq!(config.embedding.openai.dims, 3072);
        assert_eq!(config.embedding.openai.model, "text-embedding-3-small");
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = Config::default();
        config.retrieval.semantic_weight = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.chunking.overlap = 512;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.embedding.provider = "word2vec".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.llm.provider = "magic".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ke.toml");
        std::fs::write(&path, "[chunking]\nchunk_size = 128\noverlap = 16\n").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.chunking.chunk_size, 128);

        std::fs::write(&path, "[chunking]\nchunk_size = 0\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
