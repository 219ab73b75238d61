use airgap_core::chunker::Chunker;
use airgap_core::traits::Embedder;
use airgap_core::types::{Document, DocumentFormat, IndexEntry, SourceMeta};
use airgap_core::Error;
use airgap_embed::HashEmbedder;
use airgap_vector::{LanceStore, VectorIndex};

fn indexed_document(embedder: &HashEmbedder, text: &str, filename: &str) -> Vec<IndexEntry> {
    let doc = Document::new(
        text,
        SourceMeta { filename: filename.to_string(), page_count: Some(3), format: DocumentFormat::Markdown },
    );
    let chunks = Chunker::new(40, 8).unwrap().chunk(&doc);
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder.embed_batch(&texts).unwrap();
    chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, embedding)| IndexEntry { chunk, embedding, metadata: doc.entry_metadata() })
        .collect()
}

#[tokio::test]
async fn persist_then_load_round_trips_exactly() -> airgap_core::Result<()> {
    let tmp = tempfile::tempdir()?;
    let embedder = HashEmbedder::new(32);
    let index = VectorIndex::new();
    index.add(indexed_document(&embedder, "Rain barrels need a fine mesh screen to keep mosquitoes out. Clean it monthly.", "water.md"))?;
    index.add(indexed_document(&embedder, "Rotate crops yearly; légumes fix nitrogen 🌱 for the next season.", "garden.md"))?;

    let store = LanceStore::open(tmp.path(), "chunks").await?;
    let info = store.persist(&index, embedder.model_id()).await?;
    assert_eq!(info.dimension, 32);
    assert_eq!(info.metric, "cosine");

    let (loaded, loaded_info) = store.load().await?.expect("store has a snapshot");
    assert_eq!(loaded_info, info);
    assert_eq!(loaded.snapshot(), index.snapshot());

    let q = embedder.embed_one("mosquito screen")?;
    assert_eq!(loaded.query(&q, 3)?, index.query(&q, 3)?);
    Ok(())
}

#[tokio::test]
async fn later_snapshot_replaces_earlier_one() -> airgap_core::Result<()> {
    let tmp = tempfile::tempdir()?;
    let embedder = HashEmbedder::new(16);
    let store = LanceStore::open(tmp.path(), "chunks").await?;

    let index = VectorIndex::new();
    index.add(indexed_document(&embedder, "first document text here", "a.txt"))?;
    let first = store.persist(&index, embedder.model_id()).await?;
    index.add(indexed_document(&embedder, "second document text there", "b.txt"))?;
    let second = store.persist(&index, embedder.model_id()).await?;
    assert!(second.generation > first.generation);
    assert_ne!(second.active_table, first.active_table);

    let loaded = store.load_for(embedder.model_id(), 16).await?;
    assert_eq!(loaded.documents().len(), 2);
    Ok(())
}

#[tokio::test]
async fn empty_and_fresh_stores_load_empty() -> airgap_core::Result<()> {
    let tmp = tempfile::tempdir()?;
    let store = LanceStore::open(tmp.path(), "chunks").await?;
    assert!(store.load().await?.is_none());
    assert!(store.load_for("hash:xxh64:d8", 8).await?.is_empty());

    store.persist(&VectorIndex::new(), "hash:xxh64:d8").await?;
    let (loaded, info) = store.load().await?.expect("meta written");
    assert!(loaded.is_empty());
    assert!(info.active_table.is_empty());
    Ok(())
}

#[tokio::test]
async fn mismatched_embedder_requires_reindex() -> airgap_core::Result<()> {
    let tmp = tempfile::tempdir()?;
    let embedder = HashEmbedder::new(16);
    let store = LanceStore::open(tmp.path(), "chunks").await?;
    let index = VectorIndex::new();
    index.add(indexed_document(&embedder, "some text to index", "a.txt"))?;
    store.persist(&index, embedder.model_id()).await?;

    let err = store.load_for("candle:other:d32", 32).await.unwrap_err();
    assert!(matches!(err, Error::DimensionMismatch { expected: 16, actual: 32 }));
    let err = store.load_for("candle:other:d16", 16).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(_)));
    Ok(())
}
