use std::hash::{Hash, Hasher};

use twox_hash::XxHash64;

use airgap_core::traits::Embedder;
use airgap_core::Result;

/// Feature-hashing embedder over lowercase words and char trigrams.
///
/// Needs no model files, so it backs tests and air-gapped machines without
/// weights. Texts that share vocabulary land close together.
pub struct HashEmbedder {
    dim: usize,
    model_id: String,
}

impl HashEmbedder {
    pub fn new(dim: usize) -> Self {
        Self { dim: dim.max(1), model_id: format!("hash:xxh64:d{}", dim.max(1)) }
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0f32; self.dim];
        let lower = text.to_lowercase();
        for word in lower.split(|c: char| !c.is_alphanumeric()).filter(|w| !w.is_empty()) {
            self.bump(&mut v, ("w", word), 1.0);
            let chars: Vec<char> = word.chars().collect();
            for tri in chars.windows(3) {
                self.bump(&mut v, ("t", tri), 0.5);
            }
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt().max(1e-6);
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    fn bump<T: Hash>(&self, v: &mut [f32], feature: T, weight: f32) {
        let mut hasher = XxHash64::with_seed(0);
        feature.hash(&mut hasher);
        let h = hasher.finish();
        let idx = (h as usize) % self.dim;
        // sign bit keeps unrelated features from only ever adding up
        let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
        v[idx] += sign * weight;
    }
}

impl Embedder for HashEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn max_len(&self) -> usize {
        usize::MAX
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| x * y).sum()
    }

    #[test]
    fn related_texts_score_higher() {
        let e = HashEmbedder::new(256);
        let q = e.embed("how do I purify water");
        let near = e.embed("boiling is the simplest way to purify water");
        let far = e.embed("tomato seedlings need six hours of sun");
        assert!(cosine(&q, &near) > cosine(&q, &far));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let e = HashEmbedder::new(8);
        assert!(e.embed("").iter().all(|x| *x == 0.0));
    }
}
