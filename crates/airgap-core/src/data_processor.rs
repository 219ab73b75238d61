use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::types::{Document, DocumentFormat, SourceMeta};
use crate::{Error, Result};

/// Turn uploaded bytes with a declared format into a [`Document`].
///
/// Text-like formats are decoded as UTF-8, falling back to lossy decoding for
/// stray invalid bytes. Formats that need an external extractor (PDF) are
/// rejected so callers hand in extracted text instead.
pub fn decode_document(bytes: &[u8], format: DocumentFormat, filename: &str) -> Result<Document> {
    if !format.is_text() {
        return Err(Error::UnsupportedFormat(format!(
            "{filename}: {} requires text extraction before ingestion",
            format.as_str()
        )));
    }
    let text = match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).to_string(),
    };
    let text = text.strip_prefix('\u{feff}').map(str::to_string).unwrap_or(text);
    Ok(Document::new(
        text,
        SourceMeta { filename: filename.to_string(), page_count: None, format },
    ))
}

#[derive(Default)]
pub struct DataProcessor {
    limit: Option<usize>,
}

impl DataProcessor {
    pub fn new() -> Self { Self::default() }

    pub fn with_limit(limit: usize) -> Self { Self { limit: Some(limit) } }

    /// Load every supported text file under `data_dir` (or `data_dir` itself if it is a file).
    pub fn process_path(&self, path: &Path) -> Result<Vec<Document>> {
        let mut files = if path.is_file() { vec![path.to_path_buf()] } else { self.list_text_files(path) };
        if files.is_empty() {
            info!("No text files found under {}", path.display());
            return Ok(vec![]);
        }
        if let Some(limit) = self.limit {
            if files.len() > limit {
                files.truncate(limit);
                info!("Limited to first {} files", limit);
            }
        }
        let mut documents = Vec::with_capacity(files.len());
        for (file_index, file_path) in files.iter().enumerate() {
            debug!("Reading file {}/{}: {}", file_index + 1, files.len(), file_path.display());
            documents.push(self.read_document(file_path)?);
        }
        info!("Loaded {} documents from {}", documents.len(), path.display());
        Ok(documents)
    }

    pub fn read_document(&self, file_path: &Path) -> Result<Document> {
        let format = DocumentFormat::from_path(file_path).ok_or_else(|| {
            Error::UnsupportedFormat(format!("unknown extension: {}", file_path.display()))
        })?;
        let bytes = fs::read(file_path)?;
        decode_document(&bytes, format, &file_name(file_path))
    }

    fn list_text_files(&self, root: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().to_path_buf())
            .filter(|p| DocumentFormat::from_path(p).is_some_and(DocumentFormat::is_text))
            .collect();
        files.sort();
        files
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.to_string_lossy().to_string())
}
