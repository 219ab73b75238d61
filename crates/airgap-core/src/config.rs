use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use crate::{Error, Result};

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Your task is to answer questions based solely on the provided context.
If the context doesn't contain enough information to answer the question, say so.
Do not use any external knowledge or make assumptions beyond what's given in the context.";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    /// candle BERT-family sentence model loaded from `model_dir`
    Candle,
    /// deterministic hashing embedder, no model files required
    Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingSettings {
    pub backend: EmbeddingBackend,
    pub model: String,
    pub model_dir: PathBuf,
    pub max_len: usize,
    pub batch_size: usize,
    /// Output dimension of the hash backend; the candle backend reads it from the model config.
    pub dim: usize,
}

impl Default for EmbeddingSettings {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::Candle,
            model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            model_dir: PathBuf::from("models/all-MiniLM-L6-v2"),
            max_len: 256,
            batch_size: 32,
            dim: 384,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkingSettings {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self { chunk_size: 1000, chunk_overlap: 200 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetrievalSettings {
    pub top_k: usize,
    pub similarity_threshold: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self { top_k: 3, similarity_threshold: 0.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PromptSettings {
    pub max_context_tokens: usize,
    pub history_turns: usize,
    pub system_prompt: String,
    pub use_rag: bool,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            max_context_tokens: 1500,
            history_turns: 4,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            use_rag: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IndexSettings {
    pub path: PathBuf,
    pub table: String,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self { path: PathBuf::from("data/index"), table: "chunks".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationSettings {
    /// llama.cpp-compatible completion binary.
    pub binary: PathBuf,
    /// Registry name of the model used when `model_path` is unset.
    pub model: String,
    /// Explicit model file; overrides the registry lookup of `model`.
    pub model_path: Option<PathBuf>,
    pub models: BTreeMap<String, PathBuf>,
    pub n_ctx: usize,
    pub n_batch: usize,
    pub max_output_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub stop: Vec<String>,
    pub token_timeout_secs: u64,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        let models = [
            ("Llama", "models/llama-3-8b-instruct.Q4_K_M.gguf"),
            ("Mistral", "models/mistral-7b-instruct-v0.2.Q4_K_M.gguf"),
            ("Gemma", "models/gemma-2b-it.Q4_K_M.gguf"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), PathBuf::from(v)))
        .collect();
        Self {
            binary: PathBuf::from("llama-cli"),
            model: "Mistral".to_string(),
            model_path: None,
            models,
            n_ctx: 2048,
            n_batch: 512,
            max_output_tokens: 512,
            temperature: 0.7,
            top_p: 0.95,
            repeat_penalty: 1.1,
            stop: vec!["Question:".into(), "Human:".into(), "\n\nQuestion:".into(), "\n\nHuman:".into()],
            token_timeout_secs: 30,
        }
    }
}

impl GenerationSettings {
    /// Model file for `name`, honouring the explicit `model_path` override for the default model.
    pub fn model_file(&self, name: &str) -> Option<PathBuf> {
        if name == self.model {
            if let Some(p) = &self.model_path {
                return Some(p.clone());
            }
        }
        self.models.get(name).cloned()
    }
}

/// Every option the pipeline consumes, validated once at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub embedding: EmbeddingSettings,
    pub chunking: ChunkingSettings,
    pub retrieval: RetrievalSettings,
    pub prompt: PromptSettings,
    pub index: IndexSettings,
    pub generation: GenerationSettings,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.chunk_size == 0 {
            return Err(Error::Configuration("chunking.chunk_size must be > 0".into()));
        }
        if c.chunk_overlap >= c.chunk_size {
            return Err(Error::Configuration(format!(
                "chunking.chunk_overlap ({}) must be < chunk_size ({})",
                c.chunk_overlap, c.chunk_size
            )));
        }
        if self.retrieval.top_k == 0 {
            return Err(Error::Configuration("retrieval.top_k must be > 0".into()));
        }
        let t = self.retrieval.similarity_threshold;
        if !(0.0..=1.0).contains(&t) {
            return Err(Error::Configuration(format!("retrieval.similarity_threshold ({t}) must be in [0, 1]")));
        }
        if self.prompt.max_context_tokens == 0 {
            return Err(Error::Configuration("prompt.max_context_tokens must be > 0".into()));
        }
        let g = &self.generation;
        if g.temperature.is_nan() || g.temperature < 0.0 {
            return Err(Error::Configuration(format!("generation.temperature ({}) must be >= 0", g.temperature)));
        }
        if g.max_output_tokens == 0 || g.n_ctx == 0 {
            return Err(Error::Configuration("generation.max_output_tokens and n_ctx must be > 0".into()));
        }
        if g.token_timeout_secs == 0 {
            return Err(Error::Configuration("generation.token_timeout_secs must be > 0".into()));
        }
        if self.embedding.batch_size == 0 || self.embedding.max_len == 0 || self.embedding.dim == 0 {
            return Err(Error::Configuration("embedding.batch_size, max_len and dim must be > 0".into()));
        }
        Ok(())
    }

    /// Resolve relative paths against `base` after `~`/`$VAR` expansion.
    pub fn resolve_paths(&mut self, base: &Path) {
        let fix = |p: &PathBuf| resolve_with_base(base, p.to_string_lossy());
        self.embedding.model_dir = fix(&self.embedding.model_dir);
        self.index.path = fix(&self.index.path);
        self.generation.model_path = self.generation.model_path.as_ref().map(fix);
        for path in self.generation.models.values_mut() {
            *path = fix(path);
        }
    }
}

pub struct Config {
    figment: Figment,
    base: PathBuf,
}

impl Config {
    /// Load from the current directory, selecting the overlay file from `RUST_ENV`.
    pub fn load() -> Result<Self> {
        let env_name = env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
        Self::load_from(Path::new("."), &env_name)
    }

    pub fn load_from(dir: &Path, env_name: &str) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(dir.join("config.toml")));
        match env_name {
            "dev" | "development" => figment = figment.merge(Toml::file(dir.join("config.dev.toml"))),
            "prod" | "production" => figment = figment.merge(Toml::file(dir.join("config.prod.toml"))),
            "test" | "testing" => figment = figment.merge(Toml::file(dir.join("config.test.toml"))),
            _ => {}
        }
        figment = figment.merge(Env::prefixed("APP_").split("__"));
        Ok(Self { figment, base: dir.to_path_buf() })
    }

    pub fn get<T>(&self, key: &str) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.figment
            .extract_inner(key)
            .map_err(|e| Error::Configuration(format!("Failed to get '{key}': {e}")))
    }

    /// Extract, path-resolve, and validate the full settings tree.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings: Settings = self
            .figment
            .extract()
            .map_err(|e| Error::Configuration(e.to_string()))?;
        settings.resolve_paths(&self.base);
        settings.validate()?;
        Ok(settings)
    }
}

/// Expand a user-provided path string:
/// - Expands leading '~' to the user's home directory
/// - Expands ${VAR} and $VAR environment variables
/// - Returns a PathBuf without attempting to canonicalize
pub fn expand_path<S: AsRef<str>>(input: S) -> PathBuf {
    let s = input.as_ref();
    let expanded_env = shellexpand::env(s).unwrap_or(std::borrow::Cow::Borrowed(s));
    let expanded = shellexpand::tilde(&expanded_env);
    PathBuf::from(expanded.as_ref())
}

/// Resolve a possibly relative path against a given base directory after expansion.
/// If `p` is absolute, it's returned as-is; otherwise `base.join(p)` is returned.
pub fn resolve_with_base<S: AsRef<str>>(base: &Path, p: S) -> PathBuf {
    let p = expand_path(p);
    if p.is_absolute() { p } else { base.join(p) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Settings::default().validate().expect("defaults validate");
    }

    #[test]
    fn overlap_must_be_smaller_than_chunk() {
        let mut s = Settings::default();
        s.chunking.chunk_overlap = s.chunking.chunk_size;
        assert!(matches!(s.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn threshold_outside_unit_interval_rejected() {
        let mut s = Settings::default();
        s.retrieval.similarity_threshold = 1.01;
        assert!(matches!(s.validate(), Err(Error::Configuration(_))));
        s.retrieval.similarity_threshold = f32::NAN;
        assert!(matches!(s.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn negative_temperature_rejected() {
        let mut s = Settings::default();
        s.generation.temperature = -0.1;
        assert!(s.validate().is_err());
    }

    #[test]
    fn explicit_model_path_overrides_registry() {
        let mut g = GenerationSettings::default();
        g.model_path = Some(PathBuf::from("/opt/m.gguf"));
        assert_eq!(g.model_file("Mistral"), Some(PathBuf::from("/opt/m.gguf")));
        assert_eq!(g.model_file("Gemma"), g.models.get("Gemma").cloned());
        assert_eq!(g.model_file("Nope"), None);
    }
}
