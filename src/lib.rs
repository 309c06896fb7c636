//! # Knowledge Engine
//!
//! A local-first personal knowledge engine: index your notes and
//! documents, search them with hybrid (semantic + BM25) ranking, and ask
//! questions that are answered with streamed, cited sources.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌──────────────────┐
//! │   Scan   │──▶│ Chunk+Embed  │──▶│ Store            │
//! │  walker  │   │  (ingest)    │   │ BM25 + vectors   │
//! └──────────┘   └──────────────┘   └────────┬─────────┘
//!                                            │
//!                          ┌─────────────────┤
//!                          ▼                 ▼
//!                    ┌──────────┐     ┌─────────────┐
//!                    │  Search  │     │ Chat (RAG)  │
//!                    │  hybrid  │     │ SSE/NDJSON  │
//!                    └──────────┘     └─────────────┘
//! ```
//!
//! Runtime-agnostic logic (models, chunking, both indices, the hybrid
//! ranker and the provider traits) lives in `knowledge-engine-core`.
//! This crate adds the concrete providers, the scan job, the answerer
//! and the [`Engine`](engine::Engine) facade that ties them together.
//!
//! ## Quick Start
//!
//! ```bash
//! ke scan ~/notes                                # index a folder
//! ke search "budget report" --path ~/notes       # hybrid search
//! ke ask "when is the budget due?" --path ~/notes
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`embedding`] | Embedding providers (hash, local, OpenAI, Ollama) |
//! | [`llm`] | Streaming chat providers (OpenAI, Ollama, Gemini) |
//! | [`ingest`] | Chunk, embed and store one document |
//! | [`scan`] | Background folder scan with progress |
//! | [`chat`] | Retrieval-augmented answers with citations |
//! | [`conversation`] | Conversation history |
//! | [`engine`] | The facade over all of the above |
//! | [`progress`] | Scan progress rendering for the CLI |
//! | [`providers`] | Provider catalog with status |
//! | [`sources`] | Registered folders for scanning all at once |

pub mod chat;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod engine;
pub mod http;
pub mod ingest;
pub mod llm;
pub mod progress;
pub mod providers;
pub mod retrieve;
pub mod scan;
pub mod sources;

pub use engine::{Engine, SearchQuery, SearchResponse};
