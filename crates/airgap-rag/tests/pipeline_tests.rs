use std::sync::{Arc, Mutex};

use airgap_core::config::{EmbeddingBackend, Settings};
use airgap_core::traits::Embedder;
use airgap_core::types::{Document, DocumentFormat, SourceMeta, Turn};
use airgap_core::{Error, Result};
use airgap_embed::HashEmbedder;
use airgap_infer::{CompletionEngine, EngineSession, GenerationParams, ModelFamily};
use airgap_rag::{AskOptions, RagPipeline, Retriever};
use airgap_vector::VectorIndex;

/// Replies with fixed tokens and remembers the last prompt it was given.
struct EchoEngine {
    reply: Vec<&'static str>,
    last_prompt: Mutex<String>,
}

impl EchoEngine {
    fn new(reply: Vec<&'static str>) -> Arc<Self> {
        Arc::new(Self { reply, last_prompt: Mutex::new(String::new()) })
    }
}

impl CompletionEngine for EchoEngine {
    fn name(&self) -> &str {
        "echo"
    }

    fn start(&self, prompt: &str, _params: &GenerationParams) -> Result<EngineSession> {
        *self.last_prompt.lock().unwrap() = prompt.to_string();
        let tokens: Vec<Result<String>> = self.reply.iter().map(|t| Ok(t.to_string())).collect();
        Ok(EngineSession { tokens: Box::new(tokens.into_iter()), cancel: Arc::new(|| {}) })
    }
}

fn settings() -> Settings {
    let mut s = Settings::default();
    s.embedding.backend = EmbeddingBackend::Hash;
    s.embedding.dim = 128;
    s.chunking.chunk_size = 300;
    s.chunking.chunk_overlap = 50;
    s.prompt.system_prompt = "Answer from context.".to_string();
    s
}

fn doc(text: &str, filename: &str) -> Document {
    Document::new(text, SourceMeta { filename: filename.to_string(), page_count: None, format: DocumentFormat::PlainText })
}

fn pipeline(engine: Arc<EchoEngine>) -> RagPipeline {
    let s = settings();
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(s.embedding.dim));
    RagPipeline::new(s, embedder, Arc::new(VectorIndex::new()), engine).unwrap()
}

const WATER: &str = "Rainwater collected from a metal roof should be filtered through sand and charcoal, then boiled for one full minute before drinking.";
const GARDEN: &str = "Tomatoes and peppers need six to eight hours of direct sun; plant beans nearby to fix nitrogen in the soil.";

#[test]
fn thousand_char_document_chunks_and_retrieves_itself() {
    let p = pipeline(EchoEngine::new(vec![]));
    let text: String = (0..1000).map(|i| char::from(b'a' + (i % 26) as u8)).collect();
    let summary = p.ingest(&doc(&text, "letters.txt")).unwrap();
    assert_eq!(summary.chunks_added, 4);
    assert_eq!(summary.duplicates_skipped, 0);

    let retriever = Retriever::with_threshold(Arc::clone(p.embedder()), Arc::clone(p.index()), 0.0).unwrap();
    let chunks = airgap_core::chunker::Chunker::new(300, 50).unwrap().chunk_text(&summary.doc_id, &text);
    for chunk in &chunks {
        let result = retriever.retrieve(&chunk.text, 3, &[]).unwrap();
        assert_eq!(result.hits[0].chunk.id, chunk.id, "chunk {} should rank itself first", chunk.ordinal);
    }
}

#[test]
fn reingesting_the_same_document_is_a_no_op() {
    let p = pipeline(EchoEngine::new(vec![]));
    let first = p.ingest(&doc(WATER, "water.txt")).unwrap();
    let second = p.ingest(&doc(WATER, "copy-of-water.txt")).unwrap();
    assert_eq!(first.doc_id, second.doc_id);
    assert_eq!(second.chunks_added, 0);
    assert_eq!(second.duplicates_skipped, first.chunks_added);
    assert_eq!(p.documents().len(), 1);
}

#[test]
fn unsatisfiable_threshold_returns_nothing() {
    let p = pipeline(EchoEngine::new(vec![]));
    p.ingest(&doc(WATER, "water.txt")).unwrap();
    let retriever = Retriever::with_threshold(Arc::clone(p.embedder()), Arc::clone(p.index()), 1.01).unwrap();
    assert!(retriever.retrieve(WATER, 5, &[]).unwrap().is_empty());
    assert!(Retriever::with_threshold(Arc::clone(p.embedder()), Arc::clone(p.index()), f32::NAN).is_err());
}

#[test]
fn history_never_changes_retrieval() {
    let p = pipeline(EchoEngine::new(vec![]));
    p.ingest(&doc(WATER, "water.txt")).unwrap();
    p.ingest(&doc(GARDEN, "garden.txt")).unwrap();
    let retriever = Retriever::new(Arc::clone(p.embedder()), Arc::clone(p.index()), &settings().retrieval).unwrap();
    let history = vec![Turn { question: "tomatoes sun peppers".into(), answer: "beans nitrogen".into() }];
    assert_eq!(
        retriever.retrieve("how long to boil rainwater", 2, &history).unwrap(),
        retriever.retrieve("how long to boil rainwater", 2, &[]).unwrap()
    );
}

#[test]
fn ask_streams_answer_with_citations() {
    let engine = EchoEngine::new(vec!["Boil", " it", " one", " minute."]);
    let p = pipeline(Arc::clone(&engine));
    p.ingest(&doc(WATER, "water.txt")).unwrap();
    p.ingest(&doc(GARDEN, "garden.txt")).unwrap();

    let answer = p.ask("How long should rainwater be boiled?", &[]).unwrap();
    assert!(answer.context_included);
    assert!(!answer.truncated);
    assert_eq!(answer.citations[0].filename, "water.txt");
    assert!(answer.prompt.starts_with("Answer from context.\n\nContext:\n"));
    assert!(answer.prompt.ends_with("Human: How long should rainwater be boiled?\n\nAssistant:"));
    assert_eq!(*engine.last_prompt.lock().unwrap(), answer.prompt);

    let text: String = answer.tokens.map(|t| t.unwrap()).collect();
    assert_eq!(text, "Boil it one minute.");
}

#[test]
fn tiny_budget_falls_back_to_bare_question() {
    let engine = EchoEngine::new(vec!["ok"]);
    let mut s = settings();
    s.prompt.max_context_tokens = 1;
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(s.embedding.dim));
    let p = RagPipeline::new(s, embedder, Arc::new(VectorIndex::new()), engine).unwrap();
    p.ingest(&doc(WATER, "water.txt")).unwrap();

    let answer = p.ask("Is rainwater safe?", &[]).unwrap();
    assert!(!answer.context_included);
    assert!(answer.truncated);
    assert_eq!(answer.prompt, "Is rainwater safe?");
    assert!(answer.citations.is_empty());
}

#[test]
fn rag_off_sends_the_question_alone() {
    let p = pipeline(EchoEngine::new(vec!["hi"]));
    p.ingest(&doc(WATER, "water.txt")).unwrap();
    let options = AskOptions { use_rag: false, ..AskOptions::from_settings(p.settings()) };
    let answer = p.ask_with("hello there", &[], &options).unwrap();
    assert_eq!(answer.prompt, "hello there");
    assert!(answer.citations.is_empty());
}

#[test]
fn chat_template_wraps_prompt() {
    let p = pipeline(EchoEngine::new(vec![]));
    let options = AskOptions { use_rag: false, chat_template: Some(ModelFamily::Mistral), ..AskOptions::from_settings(p.settings()) };
    let answer = p.ask_with("hello", &[], &options).unwrap();
    assert_eq!(answer.prompt, "<s>[INST] hello [/INST]");
}

#[test]
fn one_answer_at_a_time() {
    let p = pipeline(EchoEngine::new(vec!["a"]));
    let first = p.ask("q", &[]).unwrap();
    assert!(matches!(p.ask("q", &[]), Err(Error::Busy)));
    drop(first);
    assert!(p.ask("q", &[]).is_ok());
}

#[test]
fn remove_by_filename_and_reset() {
    let p = pipeline(EchoEngine::new(vec![]));
    p.ingest(&doc(WATER, "water.txt")).unwrap();
    let garden = p.ingest(&doc(GARDEN, "garden.txt")).unwrap();

    assert!(p.remove_document("water.txt").unwrap() > 0);
    assert!(matches!(p.remove_document("water.txt"), Err(Error::NotFound(_))));
    assert_eq!(p.find_documents(&garden.doc_id[..12]).len(), 1);

    p.reset();
    assert!(p.documents().is_empty());
}

#[test]
fn pdf_bytes_are_rejected() {
    let p = pipeline(EchoEngine::new(vec![]));
    let err = p.ingest_bytes(b"%PDF-1.4", DocumentFormat::Pdf, "manual.pdf").unwrap_err();
    assert!(matches!(err, Error::UnsupportedFormat(_)));
}

#[tokio::test]
async fn persisted_corpus_survives_reopen() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let mut s = settings();
    s.index.path = tmp.path().join("index");

    let p = RagPipeline::open(s.clone(), EchoEngine::new(vec![])).await?;
    p.ingest(&doc(WATER, "water.txt"))?;
    p.ingest(&doc(GARDEN, "garden.txt"))?;
    p.persist().await?;
    let before = p.documents();
    drop(p);

    let reopened = RagPipeline::open(s.clone(), EchoEngine::new(vec![])).await?;
    assert_eq!(reopened.documents(), before);
    reopened.reset();
    reopened.persist().await?;
    drop(reopened);

    let empty = RagPipeline::open(s, EchoEngine::new(vec![])).await?;
    assert!(empty.documents().is_empty());
    Ok(())
}

#[test]
fn persist_without_store_is_a_configuration_error() {
    let p = pipeline(EchoEngine::new(vec![]));
    let rt = tokio::runtime::Runtime::new().unwrap();
    assert!(matches!(rt.block_on(p.persist()), Err(Error::Configuration(_))));
}

#[test]
fn changing_chunk_config_replaces_the_old_chunking() {
    let text: String = (0..1000).map(|i| if i % 7 == 6 { ' ' } else { char::from(b'a' + (i % 26) as u8) }).collect();
    let document = doc(&text, "letters.txt");
    let s = settings();
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(s.embedding.dim));
    let index = Arc::new(VectorIndex::new());

    let wide = RagPipeline::new(s.clone(), Arc::clone(&embedder), Arc::clone(&index), EchoEngine::new(vec![])).unwrap();
    let first = wide.ingest(&document).unwrap();
    assert!(first.chunks_added > 1);

    let mut narrow_settings = s;
    narrow_settings.chunking.chunk_size = 100;
    narrow_settings.chunking.chunk_overlap = 10;
    let narrow =
        RagPipeline::new(narrow_settings, Arc::clone(&embedder), Arc::clone(&index), EchoEngine::new(vec![])).unwrap();
    let second = narrow.ingest(&document).unwrap();
    assert_eq!(second.duplicates_skipped, 0, "spans from another chunking are not duplicates");

    let expected = airgap_core::chunker::Chunker::new(100, 10).unwrap().chunk(&document);
    assert_eq!(second.chunks_added, expected.len());
    assert_eq!(index.count(), expected.len(), "old chunks are gone");
    let stored: Vec<_> = index.snapshot().into_iter().map(|e| e.chunk).collect();
    assert_eq!(stored, expected);
    assert_eq!(airgap_core::chunker::reassemble(&stored), text);

    let again = narrow.ingest(&document).unwrap();
    assert_eq!((again.chunks_added, again.duplicates_skipped), (0, expected.len()));
}

/// Claims one dimension and returns vectors of another.
struct LyingEmbedder;

impl Embedder for LyingEmbedder {
    fn model_id(&self) -> &str {
        "lying"
    }
    fn dim(&self) -> usize {
        8
    }
    fn max_len(&self) -> usize {
        64
    }
    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|_| vec![0.5; 4]).collect())
    }
}

#[test]
fn vectors_must_match_the_embedder_dimension() {
    let index = Arc::new(VectorIndex::new());
    let p = RagPipeline::new(settings(), Arc::new(LyingEmbedder), Arc::clone(&index), EchoEngine::new(vec![])).unwrap();
    let err = p.ingest(&doc(WATER, "water.txt")).unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 8, actual: 4 }));
    assert!(index.is_empty());
    assert_eq!(index.dimension(), None);
}
