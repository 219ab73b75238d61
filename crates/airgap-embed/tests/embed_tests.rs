use airgap_core::config::{EmbeddingBackend, EmbeddingSettings};
use airgap_core::traits::Embedder;
use airgap_core::Error;
use airgap_embed::{load_embedder, HashEmbedder};

fn hash_settings(dim: usize) -> EmbeddingSettings {
    EmbeddingSettings { backend: EmbeddingBackend::Hash, dim, ..Default::default() }
}

#[test]
fn hash_embedder_shapes_and_determinism() {
    let embedder = load_embedder(&hash_settings(128)).expect("embedder");
    let texts = vec!["hello world".to_string(), "hello world".to_string()];
    let embs = embedder.embed_batch(&texts).expect("embed_batch");
    assert_eq!(embs.len(), 2);
    let (v1, v2) = (&embs[0], &embs[1]);

    assert_eq!(v1.len(), 128);
    let norm: f32 = v1.iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() <= 1e-3, "vector is L2-normalized (norm={norm})");
    assert_eq!(v1, v2);
    assert_eq!(embedder.model_id(), "hash:xxh64:d128");
}

#[test]
fn batch_composition_does_not_change_vectors() {
    let e = HashEmbedder::new(64);
    let single = e.embed_one("water filter maintenance").unwrap();
    let batch = e
        .embed_batch(&["unrelated".to_string(), "water filter maintenance".to_string()])
        .unwrap();
    assert_eq!(single, batch[1]);
}

#[test]
fn empty_batch_gives_empty_output() {
    let e = HashEmbedder::new(16);
    assert!(e.embed_batch(&[]).unwrap().is_empty());
}

#[test]
fn missing_model_dir_is_unavailable() {
    let tmp = tempfile::TempDir::new().unwrap();
    let settings = EmbeddingSettings {
        backend: EmbeddingBackend::Candle,
        model_dir: tmp.path().join("absent"),
        ..Default::default()
    };
    match load_embedder(&settings) {
        Err(Error::EmbeddingUnavailable(_)) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("loading from a missing directory must fail"),
    }
}
