//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, plus pure helper functions for batch validation and
//! similarity computation.
//!
//! Concrete provider implementations (hash, OpenAI, Ollama, fastembed)
//! live in the `knowledge-engine` app crate.

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::models::ProviderDescriptor;

/// Trait for embedding providers.
///
/// Implementations must return exactly one vector per input text, in input
/// order, each of length `descriptor().dimension`. Credential and model
/// problems are reported when the provider is constructed, not from
/// [`embed_batch`](EmbeddingProvider::embed_batch).
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the provider identity and output dimensionality.
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Embed a batch of texts.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Embed a single query string.
pub async fn embed_query<P: EmbeddingProvider + ?Sized>(provider: &P, text: &str) -> Result<Vec<f32>> {
    let mut vectors = provider.embed_batch(&[text.to_string()]).await?;
    validate_batch(provider.descriptor(), 1, &vectors)?;
    Ok(vectors.remove(0))
}

/// Check that a provider response matches the request shape.
///
/// # Errors
///
/// [`EngineError::Provider`] when the vector count differs from `expected`,
/// [`EngineError::DimensionMismatch`] when any vector has the wrong length.
pub fn validate_batch(
    descriptor: &ProviderDescriptor,
    expected: usize,
    vectors: &[Vec<f32>],
) -> Result<()> {
    if vectors.len() != expected {
        return Err(EngineError::Provider {
            provider: descriptor.id.clone(),
            message: format!("expected {expected} vectors, got {}", vectors.len()),
        });
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != descriptor.dimension) {
        return Err(EngineError::DimensionMismatch {
            expected: descriptor.dimension,
            actual: bad.len(),
        });
    }
    Ok(())
}

/// Scale a vector to unit length in place. Zero vectors are left alone.
pub fn l2_normalize(v: &mut [f32]) {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`:
/// - `1.0` = identical direction
/// - `0.0` = orthogonal (unrelated)
/// - `-1.0` = opposite direction
///
/// Returns `0.0` for empty vectors or vectors of different lengths;
/// callers that must not compare across dimensions check first.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::CostClass;

    struct Fixed {
        desc: ProviderDescriptor,
        out: Vec<Vec<f32>>,
    }

    #[async_trait]
    impl EmbeddingProvider for Fixed {
        fn descriptor(&self) -> &ProviderDescriptor {
            &self.desc
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(self.out.clone())
        }
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_opposite() {
        let sim = cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]);
        assert!((sim + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_empty_and_different_lengths() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let mut v = vec![3.0, 4.0];
        l2_normalize(&mut v);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);

        let mut zero = vec![0.0, 0.0];
        l2_normalize(&mut zero);
        assert_eq!(zero, vec![0.0, 0.0]);
    }

    #[test]
    fn test_validate_batch() {
        let desc = ProviderDescriptor::new("p", 3, CostClass::Free);
        assert!(validate_batch(&desc, 1, &[vec![0.0; 3]]).is_ok());
        assert!(matches!(
            validate_batch(&desc, 2, &[vec![0.0; 3]]),
            Err(EngineError::Provider { .. })
        ));
        assert!(matches!(
            validate_batch(&desc, 1, &[vec![0.0; 4]]),
            Err(EngineError::DimensionMismatch {
                expected: 3,
                actual: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_embed_query_rejects_wrong_dimension() {
        let p = Fixed {
            desc: ProviderDescriptor::new("p", 2, CostClass::Free),
            out: vec![vec![1.0, 0.0, 0.0]],
        };
        assert!(embed_query(&p, "hi").await.is_err());

        let ok = Fixed {
            desc: ProviderDescriptor::new("p", 2, CostClass::Free),
            out: vec![vec![1.0, 0.0]],
        };
        assert_eq!(embed_query(&ok, "hi").await.unwrap(), vec![1.0, 0.0]);
    }
}
