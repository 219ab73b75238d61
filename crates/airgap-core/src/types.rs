//! Domain types shared by the ingestion and question-answering paths.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

pub type ChunkId = String;
pub type DocId = String;
pub type Meta = BTreeMap<String, String>;

/// Declared source format of an uploaded document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    PlainText,
    Markdown,
    Csv,
    Json,
    Xml,
    Yaml,
    Pdf,
}

impl DocumentFormat {
    /// Guess a format from a file extension, case-insensitively.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "txt" | "text" | "log" => Some(Self::PlainText),
            "md" | "markdown" => Some(Self::Markdown),
            "csv" | "tsv" => Some(Self::Csv),
            "json" => Some(Self::Json),
            "xml" => Some(Self::Xml),
            "yaml" | "yml" => Some(Self::Yaml),
            "pdf" => Some(Self::Pdf),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PlainText => "text",
            Self::Markdown => "markdown",
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Xml => "xml",
            Self::Yaml => "yaml",
            Self::Pdf => "pdf",
        }
    }

    /// Formats the core can decode without an external extractor.
    pub fn is_text(self) -> bool {
        !matches!(self, Self::Pdf)
    }
}

/// Where a document came from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceMeta {
    pub filename: String,
    pub page_count: Option<u32>,
    pub format: DocumentFormat,
}

/// An uploaded document after text extraction.
///
/// - `id`: blake3 digest of `text`, so identical content always maps to the same id
/// - `text`: extracted plain text
/// - `source`: filename, page count, and declared format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Document {
    pub id: DocId,
    pub text: String,
    pub source: SourceMeta,
}

impl Document {
    pub fn new(text: impl Into<String>, source: SourceMeta) -> Self {
        let text = text.into();
        let id = content_hash(&text);
        Self { id, text, source }
    }

    /// Metadata copied onto every index entry derived from this document.
    pub fn entry_metadata(&self) -> Meta {
        let mut meta = Meta::new();
        meta.insert("filename".to_string(), self.source.filename.clone());
        meta.insert("format".to_string(), self.source.format.as_str().to_string());
        if let Some(pages) = self.source.page_count {
            meta.insert("page_count".to_string(), pages.to_string());
        }
        meta
    }
}

/// A bounded span of a document used as the retrieval unit.
///
/// `start`/`end` are char offsets into the parent text. `overlap_prev` is how
/// many leading chars repeat the tail of the previous chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chunk {
    pub id: ChunkId,
    pub doc_id: DocId,
    pub ordinal: usize,
    pub text: String,
    pub start: usize,
    pub end: usize,
    pub overlap_prev: usize,
}

impl Chunk {
    /// Stable identity of the `start..end` char span of `doc_id`.
    ///
    /// The span pins the chunk text (the document id is its content hash), so a
    /// different chunking of the same document never reuses an id.
    pub fn make_id(doc_id: &str, start: usize, end: usize) -> ChunkId {
        content_hash(&format!("{doc_id}:{start}:{end}"))
    }
}

/// A chunk with its embedding and source metadata, as stored in the index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
    pub metadata: Meta,
}

impl IndexEntry {
    pub fn id(&self) -> &str {
        &self.chunk.id
    }

    pub fn filename(&self) -> &str {
        self.metadata.get("filename").map_or("", String::as_str)
    }
}

/// One prior exchange in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Turn {
    pub question: String,
    pub answer: String,
}

/// An ephemeral question against the corpus.
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub question: String,
    pub history: Vec<Turn>,
    pub top_k: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub metadata: Meta,
    pub score: f32,
}

/// Ranked retrieval output, highest similarity first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetrievalResult {
    pub hits: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn citations(&self) -> Vec<Citation> {
        self.hits
            .iter()
            .map(|h| Citation {
                doc_id: h.chunk.doc_id.clone(),
                filename: h.metadata.get("filename").cloned().unwrap_or_default(),
                ordinal: h.chunk.ordinal,
                score: h.score,
            })
            .collect()
    }
}

/// Provenance of a passage shown next to an answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub doc_id: DocId,
    pub filename: String,
    pub ordinal: usize,
    pub score: f32,
}

/// The assembled prompt plus flags describing any degradation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub text: String,
    pub context_included: bool,
    pub truncated: bool,
    pub chunks_used: usize,
    pub token_estimate: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestSummary {
    pub doc_id: DocId,
    pub chunks_added: usize,
    pub duplicates_skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DocumentSummary {
    pub doc_id: DocId,
    pub filename: String,
    pub chunks: usize,
}

/// Hex blake3 digest used for document and chunk identity.
pub fn content_hash(s: &str) -> String {
    blake3::hash(s.as_bytes()).to_hex().to_string()
}
