//! Offline feature-hashing embedder.
//!
//! Maps word unigrams and character trigrams into a fixed number of signed
//! buckets via SHA-256, then L2-normalises. Needs no model download or
//! network, and identical text always produces an identical vector, which
//! makes it the embedder of choice for tests and air-gapped installs.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{l2_normalize, Embedder};
use crate::error::Result;

pub const HASHING_MODEL: &str = "hashing-v1";

const WORD_WEIGHT: f32 = 1.0;
const TRIGRAM_WEIGHT: f32 = 0.5;

pub struct HashingEmbedder {
    dims: usize,
}

impl HashingEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    /// Embed one text synchronously.
    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims];
        for word in tokenize(text) {
            self.add_feature(&mut vector, "w", &word, WORD_WEIGHT);
            let padded: Vec<char> = format!("^{}$", word).chars().collect();
            for gram in padded.windows(3) {
                let gram: String = gram.iter().collect();
                self.add_feature(&mut vector, "t", &gram, TRIGRAM_WEIGHT);
            }
        }
        l2_normalize(&mut vector);
        vector
    }

    fn add_feature(&self, vector: &mut [f32], kind: &str, feature: &str, weight: f32) {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_bytes());
        hasher.update([0u8]);
        hasher.update(feature.as_bytes());
        let digest = hasher.finalize();

        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % self.dims as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign * weight;
    }
}

/// Lowercased alphanumeric tokens.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn model_name(&self) -> &str {
        HASHING_MODEL
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn identical_text_identical_vector() {
        let e = HashingEmbedder::new(128);
        assert_eq!(e.embed_one("SAVE15 discount"), e.embed_one("SAVE15 discount"));
    }

    #[test]
    fn vectors_are_normalised() {
        let e = HashingEmbedder::new(64);
        let v = e.embed_one("Discount codes apply at checkout");
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert_eq!(v.len(), 64);
    }

    #[test]
    fn related_text_scores_higher() {
        let e = HashingEmbedder::new(256);
        let query = e.embed_one("discount codes");
        let related = e.embed_one("The discount code SAVE15 gives 15% off");
        let unrelated = e.embed_one("Shipping takes three business days");
        assert!(
            cosine_similarity(&query, &related) > cosine_similarity(&query, &unrelated)
        );
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashingEmbedder::new(16);
        assert!(e.embed_one("  ").iter().all(|x| *x == 0.0));
    }
}
