//! # Knowledge Engine Core
//!
//! Runtime-agnostic logic for Knowledge Engine: data models, the error
//! taxonomy, chunking, the lexical (BM25) and vector indices, the store
//! abstraction, hybrid ranking, and the embedding/LLM provider traits.
//!
//! This crate contains no tokio, HTTP, or filesystem I/O. Concrete
//! providers, the scan job and the streaming answerer live in the
//! `knowledge-engine` app crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod lexical;
pub mod llm;
pub mod models;
pub mod search;
pub mod store;
pub mod vector;

pub use error::{EngineError, Result, TransientKind};
