//! Offline feature-hashing embedder.
//!
//! Each lowercase term and each adjacent term pair is hashed (SHA-256,
//! first 8 bytes) into one of `dims` buckets with a hash-derived sign, and
//! the result is L2-normalized. No model, no network, same output on every
//! machine, so it is the default provider and the one tests rely on.

use async_trait::async_trait;
use knowledge_engine_core::embedding::{l2_normalize, EmbeddingProvider};
use knowledge_engine_core::lexical::tokenize;
use knowledge_engine_core::models::{CostClass, ProviderDescriptor};
use knowledge_engine_core::{EngineError, Result};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone)]
pub struct HashEmbedder {
    descriptor: ProviderDescriptor,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Result<Self> {
        if dims == 0 {
            return Err(EngineError::Configuration(
                "embedding.hash.dims must be > 0".to_string(),
            ));
        }
        Ok(Self {
            descriptor: ProviderDescriptor::new(format!("hash:{dims}"), dims, CostClass::Free),
        })
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let dims = self.descriptor.dimension;
        let mut v = vec![0.0f32; dims];
        let terms = tokenize(text);

        for term in &terms {
            add_feature(&mut v, term.as_bytes(), 1.0);
        }
        for pair in terms.windows(2) {
            let joined = format!("{} {}", pair[0], pair[1]);
            add_feature(&mut v, joined.as_bytes(), 0.5);
        }

        l2_normalize(&mut v);
        v
    }
}

fn add_feature(v: &mut [f32], feature: &[u8], weight: f32) {
    let digest = Sha256::digest(feature);
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    let h = u64::from_le_bytes(bytes);
    let bucket = (h % v.len() as u64) as usize;
    let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
    v[bucket] += sign * weight;
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}
