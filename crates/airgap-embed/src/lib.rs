//! Sentence embedders: a candle BERT-family model and a hashing fallback.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use airgap_core::config::{EmbeddingBackend, EmbeddingSettings};
use airgap_core::traits::Embedder;
use airgap_core::{Error, Result};

pub mod device;
pub mod hash;
pub mod pool;
pub mod tokenize;

pub use hash::HashEmbedder;
pub use pool::masked_mean_l2;

pub(crate) fn candle_err(e: candle_core::Error) -> Error {
    Error::EmbeddingUnavailable(e.to_string())
}

pub struct CandleEmbedder {
    model: BertModel,
    tokenizer: Tokenizer,
    device: Device,
    model_id: String,
    dim: usize,
    max_len: usize,
    batch_size: usize,
    pad_id: u32,
}

impl CandleEmbedder {
    /// Load the model from `settings.model_dir`, retrying once before giving up.
    pub fn load(settings: &EmbeddingSettings) -> Result<Self> {
        match Self::try_load(settings) {
            Ok(e) => Ok(e),
            Err(first) => {
                warn!("Embedding model load failed ({first}), retrying once");
                Self::try_load(settings).map_err(|e| match e {
                    Error::EmbeddingUnavailable(_) => e,
                    other => Error::EmbeddingUnavailable(other.to_string()),
                })
            }
        }
    }

    fn try_load(settings: &EmbeddingSettings) -> Result<Self> {
        let model_dir = &settings.model_dir;
        if !model_dir.is_dir() {
            return Err(Error::EmbeddingUnavailable(format!(
                "model directory not found: {}",
                model_dir.display()
            )));
        }
        let device = device::select_device();
        info!("Loading embedding model {} from {}", settings.model, model_dir.display());

        let tokenizer_path = model_dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_path).map_err(|e| {
            Error::EmbeddingUnavailable(format!("failed to load tokenizer from {}: {e}", tokenizer_path.display()))
        })?;
        let pad_id = tokenizer.token_to_id("[PAD]").unwrap_or(0);

        let config_path = model_dir.join("config.json");
        let config: BertConfig = serde_json::from_str(&std::fs::read_to_string(&config_path)?)
            .map_err(|e| Error::EmbeddingUnavailable(format!("bad model config {}: {e}", config_path.display())))?;
        let dim = config.hidden_size;

        let weights = load_weights(model_dir, &device)?;
        let vb = VarBuilder::from_tensors(weights, DType::F32, &device);
        let model = BertModel::load(vb, &config).map_err(candle_err)?;
        let max_len = settings.max_len.min(config.max_position_embeddings);
        info!("Embedding model ready (dim={dim}, max_len={max_len})");

        Ok(Self {
            model,
            tokenizer,
            device,
            model_id: format!("candle:{}:d{dim}", settings.model),
            dim,
            max_len,
            batch_size: settings.batch_size.max(1),
            pad_id,
        })
    }

    fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let (input_ids, attention_mask) =
            tokenize::tokenize_batch(&self.tokenizer, texts, self.max_len, self.pad_id, &self.device)?;
        let token_type_ids = input_ids.zeros_like().map_err(candle_err)?;
        let hidden = self
            .model
            .forward(&input_ids, &token_type_ids, Some(&attention_mask))
            .map_err(candle_err)?;
        let pooled = masked_mean_l2(&hidden, &attention_mask).map_err(candle_err)?;
        let rows: Vec<Vec<f32>> = pooled
            .to_device(&Device::Cpu)
            .and_then(|t| t.to_dtype(DType::F32))
            .and_then(|t: Tensor| t.to_vec2())
            .map_err(candle_err)?;
        if rows.iter().any(|r| r.len() != self.dim) {
            return Err(Error::EmbeddingUnavailable(format!("model produced vectors not of dim {}", self.dim)));
        }
        Ok(rows)
    }
}

impl Embedder for CandleEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn max_len(&self) -> usize {
        self.max_len
    }

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let start = Instant::now();
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            out.extend(self.embed_chunk(batch)?);
        }
        debug!("Embedded {} texts in {:?}", texts.len(), start.elapsed());
        Ok(out)
    }
}

fn load_weights(model_dir: &Path, device: &Device) -> Result<HashMap<String, Tensor>> {
    let safetensors = model_dir.join("model.safetensors");
    if safetensors.exists() {
        debug!("Reading weights from {}", safetensors.display());
        return candle_core::safetensors::load(&safetensors, device).map_err(candle_err);
    }
    let pickle: PathBuf = model_dir.join("pytorch_model.bin");
    if pickle.exists() {
        debug!("Reading weights from {}", pickle.display());
        let weights = candle_core::pickle::read_all(&pickle).map_err(candle_err)?;
        return Ok(weights.into_iter().collect());
    }
    Err(Error::EmbeddingUnavailable(format!(
        "no model.safetensors or pytorch_model.bin in {}",
        model_dir.display()
    )))
}

/// Build the embedder selected by `settings.backend`.
pub fn load_embedder(settings: &EmbeddingSettings) -> Result<Box<dyn Embedder>> {
    match settings.backend {
        EmbeddingBackend::Hash => {
            info!("Using hash embedder (dim={})", settings.dim);
            Ok(Box::new(HashEmbedder::new(settings.dim)))
        }
        EmbeddingBackend::Candle => Ok(Box::new(CandleEmbedder::load(settings)?)),
    }
}
