//! Ingestion and question answering behind one facade.

use std::sync::Arc;

use tracing::{debug, info, warn};

use airgap_core::chunker::Chunker;
use airgap_core::config::Settings;
use airgap_core::data_processor::decode_document;
use airgap_core::traits::Embedder;
use airgap_core::types::{
    Citation, Document, DocumentFormat, DocumentSummary, IndexEntry, IngestSummary, PromptContext, Turn,
};
use airgap_core::{Error, Result};
use airgap_infer::{CompletionEngine, InferenceClient, ModelFamily, TokenStream};
use airgap_vector::{LanceStore, VectorIndex};

use crate::prompt::{estimate_tokens, PromptBuilder};
use crate::retriever::Retriever;

/// Per-question switches; defaults come from the settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AskOptions {
    pub use_rag: bool,
    pub top_k: usize,
    /// Wrap the prompt in this family's chat template before generation.
    pub chat_template: Option<ModelFamily>,
}

impl AskOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self { use_rag: settings.prompt.use_rag, top_k: settings.retrieval.top_k, chat_template: None }
    }
}

/// A streaming answer with the provenance of the passages it was given.
pub struct Answer {
    pub tokens: TokenStream,
    pub citations: Vec<Citation>,
    pub context_included: bool,
    pub truncated: bool,
    /// Exact text sent to the model.
    pub prompt: String,
}

pub struct RagPipeline {
    settings: Settings,
    chunker: Chunker,
    embedder: Arc<dyn Embedder>,
    index: Arc<VectorIndex>,
    retriever: Retriever,
    prompts: PromptBuilder,
    client: InferenceClient,
    store: Option<LanceStore>,
}

impl RagPipeline {
    /// Assemble a pipeline over an existing in-memory index.
    pub fn new(
        settings: Settings,
        embedder: Arc<dyn Embedder>,
        index: Arc<VectorIndex>,
        engine: Arc<dyn CompletionEngine>,
    ) -> Result<Self> {
        settings.validate()?;
        let chunker = Chunker::new(settings.chunking.chunk_size, settings.chunking.chunk_overlap)?;
        let retriever = Retriever::new(Arc::clone(&embedder), Arc::clone(&index), &settings.retrieval)?;
        let prompts = PromptBuilder::new(settings.prompt.clone());
        let client = InferenceClient::new(engine, settings.generation.clone());
        Ok(Self { settings, chunker, embedder, index, retriever, prompts, client, store: None })
    }

    /// Open the persisted index under `settings.index`, loading the configured embedder.
    pub async fn open(settings: Settings, engine: Arc<dyn CompletionEngine>) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = Arc::from(airgap_embed::load_embedder(&settings.embedding)?);
        Self::open_with(settings, embedder, engine).await
    }

    pub async fn open_with(
        settings: Settings,
        embedder: Arc<dyn Embedder>,
        engine: Arc<dyn CompletionEngine>,
    ) -> Result<Self> {
        let store = LanceStore::open(&settings.index.path, &settings.index.table).await?;
        let index = store.load_for(embedder.model_id(), embedder.dim()).await?;
        info!("Opened index at {} ({} chunks)", settings.index.path.display(), index.count());
        let mut pipeline = Self::new(settings, embedder, Arc::new(index), engine)?;
        pipeline.store = Some(store);
        Ok(pipeline)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn client(&self) -> &InferenceClient {
        &self.client
    }

    /// Chunk, embed, and index one document. Re-ingesting identical text adds nothing.
    ///
    /// A document already indexed under a different chunking is replaced as a
    /// whole, so one document never mixes spans from two chunk configurations.
    pub fn ingest(&self, document: &Document) -> Result<IngestSummary> {
        let chunks = self.chunker.chunk(document);
        if chunks.is_empty() {
            warn!("Document {} has no text, nothing indexed", document.source.filename);
            return Ok(IngestSummary { doc_id: document.id.clone(), ..Default::default() });
        }
        let known = chunks.iter().filter(|c| self.index.contains(&c.id)).count();
        if known == chunks.len() {
            info!("{} already indexed ({} chunks)", document.source.filename, known);
            return Ok(IngestSummary { doc_id: document.id.clone(), chunks_added: 0, duplicates_skipped: known });
        }
        let rechunk = self.index.contains_document(&document.id);

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts)?;
        if vectors.len() != chunks.len() {
            return Err(Error::EmbeddingUnavailable(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        let dim = self.embedder.dim();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dim) {
            return Err(Error::DimensionMismatch { expected: dim, actual: bad.len() });
        }

        if rechunk {
            let removed = self.index.remove_document(&document.id);
            info!("Re-chunking {}: replacing {} stale chunks", document.source.filename, removed);
        }
        let metadata = document.entry_metadata();
        let entries: Vec<IndexEntry> = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, embedding)| IndexEntry { chunk, embedding, metadata: metadata.clone() })
            .collect();
        let outcome = self.index.add(entries)?;

        let summary = IngestSummary {
            doc_id: document.id.clone(),
            chunks_added: outcome.added,
            duplicates_skipped: outcome.duplicates,
        };
        info!(
            "Ingested {}: {} chunks added, {} duplicates skipped",
            document.source.filename, summary.chunks_added, summary.duplicates_skipped
        );
        Ok(summary)
    }

    /// Decode uploaded bytes of a declared format and ingest them.
    pub fn ingest_bytes(&self, bytes: &[u8], format: DocumentFormat, filename: &str) -> Result<IngestSummary> {
        self.ingest(&decode_document(bytes, format, filename)?)
    }

    pub fn ask(&self, question: &str, history: &[Turn]) -> Result<Answer> {
        self.ask_with(question, history, &AskOptions::from_settings(&self.settings))
    }

    pub fn ask_with(&self, question: &str, history: &[Turn], options: &AskOptions) -> Result<Answer> {
        let (context, citations) = if options.use_rag {
            let retrieval = self.retriever.retrieve(question, options.top_k, history)?;
            let context =
                self.prompts.build(question, &retrieval, history, self.settings.prompt.max_context_tokens);
            let mut citations = retrieval.citations();
            citations.truncate(context.chunks_used);
            (context, citations)
        } else {
            let context = PromptContext {
                text: question.to_string(),
                context_included: false,
                truncated: false,
                chunks_used: 0,
                token_estimate: estimate_tokens(question),
            };
            (context, Vec::new())
        };
        if options.use_rag && !context.context_included {
            warn!("No retrieved context fits the prompt; asking without context");
        } else if context.truncated {
            warn!("Prompt context truncated to {} chunks", context.chunks_used);
        }

        let prompt = match options.chat_template {
            Some(family) => family.format_prompt(&context.text),
            None => context.text,
        };
        let params = self.client.params_for(&prompt);
        debug!("Prompt ~{} tokens, output budget {}", estimate_tokens(&prompt), params.max_tokens);
        let tokens = self.client.generate(&prompt, &params)?;

        Ok(Answer {
            tokens,
            citations,
            context_included: context.context_included,
            truncated: context.truncated,
            prompt,
        })
    }

    pub fn documents(&self) -> Vec<DocumentSummary> {
        self.index.documents()
    }

    /// Documents whose id, id prefix, or filename equals `name`.
    pub fn find_documents(&self, name: &str) -> Vec<DocumentSummary> {
        self.index
            .documents()
            .into_iter()
            .filter(|d| d.doc_id == name || d.filename == name || (name.len() >= 8 && d.doc_id.starts_with(name)))
            .collect()
    }

    /// Remove every document matching `name`; returns the number of chunks dropped.
    pub fn remove_document(&self, name: &str) -> Result<usize> {
        let matches = self.find_documents(name);
        if matches.is_empty() {
            return Err(Error::NotFound(format!("no indexed document matches '{name}'")));
        }
        let removed: usize = matches.iter().map(|d| self.index.remove_document(&d.doc_id)).sum();
        info!("Removed {} document(s) matching '{}' ({} chunks)", matches.len(), name, removed);
        Ok(removed)
    }

    /// Drop the whole corpus from memory; call [`persist`](Self::persist) to make it durable.
    pub fn reset(&self) {
        self.index.clear();
        info!("Corpus reset");
    }

    pub async fn persist(&self) -> Result<()> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::Configuration("pipeline was not opened with an index store".to_string()))?;
        store.persist(&self.index, self.embedder.model_id()).await?;
        Ok(())
    }
}
