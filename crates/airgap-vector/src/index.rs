use std::collections::HashSet;

use parking_lot::RwLock;
use tracing::debug;

use airgap_core::types::{DocumentSummary, IndexEntry};
use airgap_core::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AddOutcome {
    pub added: usize,
    pub duplicates: usize,
}

#[derive(Debug, Default)]
struct Inner {
    dim: Option<usize>,
    entries: Vec<IndexEntry>,
    norms: Vec<f32>,
    ids: HashSet<String>,
}

impl Inner {
    fn rebuild_ids(&mut self) {
        self.ids = self.entries.iter().map(|e| e.chunk.id.clone()).collect();
    }
}

/// In-memory exact cosine index.
///
/// Entries keep insertion order, which breaks score ties. Every batch is
/// validated before the write guard mutates anything, so readers see either
/// none or all of it.
#[derive(Debug, Default)]
pub struct VectorIndex {
    inner: RwLock<Inner>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty index whose dimension is already fixed.
    pub fn with_dimension(dim: usize) -> Self {
        Self { inner: RwLock::new(Inner { dim: Some(dim), ..Default::default() }) }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.inner.read().dim
    }

    pub fn count(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn add(&self, entries: Vec<IndexEntry>) -> Result<AddOutcome> {
        if entries.is_empty() {
            return Ok(AddOutcome::default());
        }
        let mut inner = self.inner.write();

        let dim = inner.dim.unwrap_or(entries[0].embedding.len());
        if dim == 0 {
            return Err(Error::DimensionMismatch { expected: 1, actual: 0 });
        }
        for e in &entries {
            if e.embedding.len() != dim {
                return Err(Error::DimensionMismatch { expected: dim, actual: e.embedding.len() });
            }
            if e.embedding.iter().any(|x| !x.is_finite()) {
                return Err(Error::Storage(format!("non-finite embedding for chunk {}", e.chunk.id)));
            }
        }

        let mut outcome = AddOutcome::default();
        inner.dim = Some(dim);
        for e in entries {
            if !inner.ids.insert(e.chunk.id.clone()) {
                outcome.duplicates += 1;
                continue;
            }
            let norm = l2(&e.embedding);
            inner.norms.push(norm);
            inner.entries.push(e);
            outcome.added += 1;
        }
        debug!("Index add: {} added, {} duplicates, {} total", outcome.added, outcome.duplicates, inner.entries.len());
        Ok(outcome)
    }

    /// Top-`k` entries by cosine similarity, best first.
    pub fn query(&self, vector: &[f32], k: usize) -> Result<Vec<(IndexEntry, f32)>> {
        let inner = self.inner.read();
        if k == 0 || inner.entries.is_empty() {
            return Ok(vec![]);
        }
        if let Some(dim) = inner.dim {
            if vector.len() != dim {
                return Err(Error::DimensionMismatch { expected: dim, actual: vector.len() });
            }
        }
        let qn = l2(vector);
        let mut scored: Vec<(usize, f32)> = inner
            .entries
            .iter()
            .zip(&inner.norms)
            .enumerate()
            .map(|(i, (e, &n))| (i, cosine_with_norms(vector, qn, &e.embedding, n)))
            .collect();
        // stable: equal scores stay in insertion order
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        Ok(scored.into_iter().map(|(i, s)| (inner.entries[i].clone(), s)).collect())
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.inner.read().ids.contains(chunk_id)
    }

    pub fn contains_document(&self, doc_id: &str) -> bool {
        self.inner.read().entries.iter().any(|e| e.chunk.doc_id == doc_id)
    }

    /// Indexed documents in first-ingested order.
    pub fn documents(&self) -> Vec<DocumentSummary> {
        let inner = self.inner.read();
        let mut out: Vec<DocumentSummary> = Vec::new();
        for e in &inner.entries {
            match out.iter_mut().find(|d| d.doc_id == e.chunk.doc_id) {
                Some(d) => d.chunks += 1,
                None => out.push(DocumentSummary {
                    doc_id: e.chunk.doc_id.clone(),
                    filename: e.filename().to_string(),
                    chunks: 1,
                }),
            }
        }
        out
    }

    /// Drop every chunk of `doc_id`; returns how many were removed.
    pub fn remove_document(&self, doc_id: &str) -> usize {
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        let (entries, norms): (Vec<IndexEntry>, Vec<f32>) = std::mem::take(&mut inner.entries)
            .into_iter()
            .zip(std::mem::take(&mut inner.norms))
            .filter(|(e, _)| e.chunk.doc_id != doc_id)
            .unzip();
        inner.entries = entries;
        inner.norms = norms;
        let removed = before - inner.entries.len();
        if removed > 0 {
            inner.rebuild_ids();
        }
        removed
    }

    /// Empty the index and forget its dimension.
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }

    /// Copy of all entries in insertion order.
    pub fn snapshot(&self) -> Vec<IndexEntry> {
        self.inner.read().entries.clone()
    }
}

fn l2(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine_with_norms(a: &[f32], an: f32, b: &[f32], bn: f32) -> f32 {
    if an == 0.0 || bn == 0.0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    dot / (an * bn)
}

/// Cosine similarity; zero when either vector has zero length.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    cosine_with_norms(a, l2(a), b, l2(b))
}
