use std::fs;
use std::io::Write;
use tempfile::TempDir;

use airgap_core::chunker::{reassemble, Chunker};
use airgap_core::config::{Config, EmbeddingBackend};
use airgap_core::data_processor::DataProcessor;
use airgap_core::types::DocumentFormat;
use airgap_core::Error;
use proptest::prelude::*;

#[test]
fn process_directory_single_small_file() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    let file_path = dir.join("a.txt");
    let mut f = fs::File::create(&file_path).unwrap();
    writeln!(f, "Short text").unwrap();

    let processor = DataProcessor::new();
    let docs = processor.process_path(dir).expect("process");

    assert_eq!(docs.len(), 1, "one file becomes one document");
    assert_eq!(docs[0].text.trim(), "Short text");
    assert_eq!(docs[0].source.filename, "a.txt");
}

#[test]
fn process_directory_limited_two_files_limit_one() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(dir.join("a.txt"), "alpha bravo").unwrap();
    fs::write(dir.join("b.md"), "charlie delta").unwrap();
    fs::write(dir.join("skip.pdf"), "%PDF").unwrap();

    let all = DataProcessor::new().process_path(dir).expect("process");
    assert_eq!(all.len(), 2, "pdf files are not picked up from directories");

    let limited = DataProcessor::with_limit(1).process_path(dir).expect("process limited");
    assert_eq!(limited.len(), 1, "limited to one source document");
    assert_eq!(limited[0].source.filename, "a.txt");
}

#[test]
fn structured_text_files_are_ingested_as_text() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(dir.join("a.xml"), "<pump>hand</pump>").unwrap();
    fs::write(dir.join("b.yml"), "seeds: [kale, beans]").unwrap();
    fs::write(dir.join("c.YAML"), "water: rain").unwrap();

    let docs = DataProcessor::new().process_path(dir).expect("process");
    let formats: Vec<DocumentFormat> = docs.iter().map(|d| d.source.format).collect();
    assert_eq!(formats, vec![DocumentFormat::Xml, DocumentFormat::Yaml, DocumentFormat::Yaml]);
    assert_eq!(docs[1].text, "seeds: [kale, beans]");
}

#[test]
fn config_layers_defaults_file_and_env_overlay() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path();
    fs::write(
        dir.join("config.toml"),
        r#"
[chunking]
chunk_size = 300
chunk_overlap = 50

[embedding]
backend = "hash"
dim = 64

[index]
path = "store"
"#,
    )
    .unwrap();
    fs::write(dir.join("config.test.toml"), "[retrieval]\ntop_k = 7\n").unwrap();

    let config = Config::load_from(dir, "test").expect("load");
    let settings = config.settings().expect("settings");
    assert_eq!(settings.chunking.chunk_size, 300);
    assert_eq!(settings.chunking.chunk_overlap, 50);
    assert_eq!(settings.embedding.backend, EmbeddingBackend::Hash);
    assert_eq!(settings.embedding.dim, 64);
    assert_eq!(settings.retrieval.top_k, 7);
    assert_eq!(settings.index.path, dir.join("store"));
    // untouched sections keep their defaults
    assert_eq!(settings.generation.n_ctx, 2048);

    let size: usize = config.get("chunking.chunk_size").expect("get");
    assert_eq!(size, 300);
}

#[test]
fn invalid_config_fails_before_anything_starts() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("config.toml"), "[chunking]\nchunk_size = 100\nchunk_overlap = 100\n").unwrap();
    let config = Config::load_from(tmp.path(), "none").expect("load");
    assert!(matches!(config.settings(), Err(Error::Configuration(_))));
}

proptest! {
    #[test]
    fn chunks_reassemble_to_source(text in "[a-z \\n.é]{0,400}", size in 1usize..64, overlap_frac in 0.0f64..1.0) {
        let overlap = ((size as f64) * overlap_frac) as usize % size;
        let chunker = Chunker::new(size, overlap).unwrap();
        let chunks = chunker.chunk_text("doc", &text);

        prop_assert_eq!(reassemble(&chunks), text.clone());
        for (i, c) in chunks.iter().enumerate() {
            prop_assert_eq!(c.ordinal, i);
            prop_assert!(c.text.chars().count() <= size);
            prop_assert!(!c.text.is_empty());
            if i > 0 {
                prop_assert!(c.start > chunks[i - 1].start);
                prop_assert_eq!(c.overlap_prev, chunks[i - 1].end - c.start);
            }
        }
    }
}
