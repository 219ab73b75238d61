use std::sync::Arc;

use tracing::debug;

use airgap_core::config::RetrievalSettings;
use airgap_core::traits::Embedder;
use airgap_core::types::{Query, RetrievalResult, ScoredChunk, Turn};
use airgap_core::{Error, Result};
use airgap_vector::VectorIndex;

/// Ranks indexed chunks against a question.
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    threshold: f32,
}

impl Retriever {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>, settings: &RetrievalSettings) -> Result<Self> {
        Self::with_threshold(embedder, index, settings.similarity_threshold)
    }

    /// Any finite non-negative threshold is accepted; above 1 nothing can match.
    pub fn with_threshold(embedder: Arc<dyn Embedder>, index: Arc<VectorIndex>, threshold: f32) -> Result<Self> {
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(Error::Configuration(format!("similarity threshold must be finite and >= 0, got {threshold}")));
        }
        if let Some(dim) = index.dimension() {
            if dim != embedder.dim() {
                return Err(Error::DimensionMismatch { expected: dim, actual: embedder.dim() });
            }
        }
        Ok(Self { embedder, index, threshold })
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Top-`k` chunks scoring at least the threshold, best first.
    ///
    /// Only the question is embedded; `history` is accepted so callers can pass
    /// a conversation through unchanged, but never shifts the query vector.
    pub fn retrieve(&self, question: &str, k: usize, _history: &[Turn]) -> Result<RetrievalResult> {
        if k == 0 || self.index.is_empty() {
            return Ok(RetrievalResult::default());
        }
        let vector = self.embedder.embed_one(question)?;
        let hits: Vec<ScoredChunk> = self
            .index
            .query(&vector, k)?
            .into_iter()
            .filter(|(_, score)| *score >= self.threshold)
            .map(|(entry, score)| ScoredChunk { chunk: entry.chunk, metadata: entry.metadata, score })
            .collect();
        debug!("Retrieved {} of top-{} chunks above {:.2}", hits.len(), k, self.threshold);
        Ok(RetrievalResult { hits })
    }

    pub fn retrieve_query(&self, query: &Query) -> Result<RetrievalResult> {
        self.retrieve(&query.question, query.top_k, &query.history)
    }
}
