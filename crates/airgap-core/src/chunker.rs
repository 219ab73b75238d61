//! Overlapping fixed-size chunking.
//!
//! Sizes are counted in chars. A window ends on the last whitespace in its
//! second half when there is one, otherwise at the hard limit, so a chunk is
//! never longer than `chunk_size`. Chunks are exact slices of the source text:
//! dropping each chunk's `overlap_prev` leading chars and concatenating gives
//! the original text back.

use crate::types::{Chunk, Document};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    pub fn new(chunk_size: usize, overlap: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(Error::Configuration("chunk_size must be > 0".into()));
        }
        if overlap >= chunk_size {
            return Err(Error::Configuration(format!(
                "overlap ({overlap}) must be smaller than chunk_size ({chunk_size})"
            )));
        }
        Ok(Self { chunk_size, overlap })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap(&self) -> usize {
        self.overlap
    }

    pub fn chunk(&self, document: &Document) -> Vec<Chunk> {
        self.chunk_text(&document.id, &document.text)
    }

    pub fn chunk_text(&self, doc_id: &str, text: &str) -> Vec<Chunk> {
        let chars: Vec<char> = text.chars().collect();
        let n = chars.len();
        let mut chunks = Vec::new();
        if n == 0 {
            return chunks;
        }

        let mut start = 0usize;
        let mut prev_end = 0usize;
        loop {
            let end = self.window_end(&chars, start);
            let ordinal = chunks.len();
            chunks.push(Chunk {
                id: Chunk::make_id(doc_id, start, end),
                doc_id: doc_id.to_string(),
                ordinal,
                text: chars[start..end].iter().collect(),
                start,
                end,
                overlap_prev: prev_end.saturating_sub(start),
            });
            if end == n {
                break;
            }
            start = self.next_start(&chars, start, end);
            prev_end = end;
        }
        chunks
    }

    fn window_end(&self, chars: &[char], start: usize) -> usize {
        let hard_end = (start + self.chunk_size).min(chars.len());
        if hard_end == chars.len() {
            return hard_end;
        }
        // Cut after the last whitespace in the back half of the window.
        let floor = start + self.chunk_size / 2;
        (floor.max(start + 1)..hard_end)
            .rev()
            .find(|&i| chars[i - 1].is_whitespace())
            .unwrap_or(hard_end)
    }

    fn next_start(&self, chars: &[char], start: usize, end: usize) -> usize {
        let mut next = end.saturating_sub(self.overlap).max(start + 1);
        let mid_word = |i: usize| i > 0 && !chars[i - 1].is_whitespace() && !chars[i].is_whitespace();
        if mid_word(next) {
            // Prefer starting on a word boundary while still overlapping the previous chunk.
            if let Some(i) = (next + 1..end).find(|&i| chars[i - 1].is_whitespace()) {
                next = i;
            }
        }
        next
    }
}

/// Rebuild the source text from an ordered run of chunks of one document.
pub fn reassemble(chunks: &[Chunk]) -> String {
    let mut out = String::new();
    for c in chunks {
        out.extend(c.text.chars().skip(c.overlap_prev));
    }
    out
}
