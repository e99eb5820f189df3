use super::{EmbeddingClient, EmbeddingClientError};
use async_trait::async_trait;
use sha2::{Digest, Sha256};

/// Deterministic local embedding client based on signed feature hashing.
///
/// Every lowercase alphanumeric token is hashed into one of `dimension` slots with a sign taken
/// from the digest, and the result is L2-normalized. Text without any alphanumeric token is
/// hashed as a single feature so the vector never has zero magnitude.
pub struct HashEmbeddingClient {
    dimension: usize,
}

impl HashEmbeddingClient {
    /// Construct a client producing vectors of `dimension` floats.
    pub const fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0_f32; self.dimension];

        let mut tokens = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty())
            .map(str::to_lowercase)
            .peekable();

        if tokens.peek().is_none() {
            self.accumulate(&mut embedding, text);
        } else {
            for token in tokens {
                self.accumulate(&mut embedding, &token);
            }
        }

        let mut norm = magnitude(&embedding);
        if norm == 0.0 {
            // Opposite-signed collisions can cancel out completely.
            self.accumulate(&mut embedding, text);
            norm = magnitude(&embedding);
        }

        if norm > 0.0 {
            for value in &mut embedding {
                *value /= norm;
            }
        }

        embedding
    }

    fn accumulate(&self, embedding: &mut [f32], feature: &str) {
        let digest = Sha256::digest(feature.as_bytes());
        let mut slot_bytes = [0_u8; 8];
        slot_bytes.copy_from_slice(&digest[..8]);
        let slot = (u64::from_le_bytes(slot_bytes) % self.dimension as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        embedding[slot] += sign;
    }
}

fn magnitude(vector: &[f32]) -> f32 {
    vector.iter().map(|value| value * value).sum::<f32>().sqrt()
}

#[async_trait]
impl EmbeddingClient for HashEmbeddingClient {
    async fn generate_embeddings(
        &self,
        texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingClientError> {
        if self.dimension == 0 {
            return Err(EmbeddingClientError::GenerationFailed(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }

        if texts.is_empty() {
            return Err(EmbeddingClientError::GenerationFailed(
                "no texts provided".to_string(),
            ));
        }

        Ok(texts.iter().map(|text| self.encode(text)).collect())
    }
}
