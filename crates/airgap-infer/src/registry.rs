//! Named GGUF models, their chat templates, and output budgeting.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::warn;

use airgap_core::config::GenerationSettings;
use airgap_core::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Llama,
    Mistral,
    Gemma,
    DeepSeek,
    Phi,
    Qwen,
}

impl ModelFamily {
    pub const ALL: [ModelFamily; 6] = [Self::Llama, Self::Mistral, Self::Gemma, Self::DeepSeek, Self::Phi, Self::Qwen];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Llama => "Llama",
            Self::Mistral => "Mistral",
            Self::Gemma => "Gemma",
            Self::DeepSeek => "DeepSeek",
            Self::Phi => "Phi",
            Self::Qwen => "Qwen",
        }
    }

    /// Case-insensitive; accepts version suffixes such as "Llama 3".
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|f| lower.starts_with(&f.as_str().to_ascii_lowercase()))
    }

    /// Chat template with a single `{prompt}` placeholder.
    pub fn template(self) -> &'static str {
        match self {
            Self::Llama => "<|begin_of_text|><|start_header_id|>system<|end_header_id|>\n\nYou are a helpful assistant.<|eot_id|><|start_header_id|>user<|end_header_id|>\n\n{prompt}<|eot_id|><|start_header_id|>assistant<|end_header_id|>\n\n",
            Self::Mistral => "<s>[INST] {prompt} [/INST]",
            Self::Gemma => "<bos><start_of_turn>user\n{prompt}<end_of_turn>\n<start_of_turn>model\n",
            Self::DeepSeek => "<\u{ff5c}begin\u{2581}of\u{2581}sentence\u{ff5c}>User: {prompt}\n\nAssistant: ",
            Self::Phi => "<|user|>\n{prompt}<|end|>\n<|assistant|>\n",
            Self::Qwen => "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n<|im_start|>user\n{prompt}<|im_end|>\n<|im_start|>assistant\n",
        }
    }

    pub fn format_prompt(self, prompt: &str) -> String {
        self.template().replacen("{prompt}", prompt, 1)
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub name: String,
    pub path: Option<PathBuf>,
    pub available: bool,
    pub file_size_mb: Option<f64>,
    pub quantization: Option<String>,
}

/// Quantization level named in a model file, e.g. `q4` for `*.Q4_K_M.gguf`.
pub fn quantization_from_filename(path: &Path) -> String {
    let name = path.file_name().map(|n| n.to_string_lossy().to_lowercase()).unwrap_or_default();
    ["q2", "q3", "q4", "q5", "q6", "q8"]
        .into_iter()
        .find(|q| name.contains(q))
        .unwrap_or("default")
        .to_string()
}

/// Output budget left once a prompt of whitespace-separated words occupies the context.
pub fn dynamic_max_tokens(prompt: &str, max_output_tokens: usize, n_ctx: usize) -> usize {
    let prompt_tokens = prompt.split_whitespace().count();
    max_output_tokens.min(n_ctx.saturating_sub(prompt_tokens)).max(1)
}

pub struct ModelRegistry {
    settings: GenerationSettings,
}

impl ModelRegistry {
    pub fn new(settings: GenerationSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    /// Every configured model name, plus the default when it only has an explicit path.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.settings.models.keys().cloned().collect();
        if !names.contains(&self.settings.model) {
            names.push(self.settings.model.clone());
        }
        names
    }

    pub fn info(&self, name: &str) -> ModelInfo {
        let path = self.settings.model_file(name);
        let meta = path.as_deref().and_then(|p| std::fs::metadata(p).ok()).filter(|m| m.is_file());
        let available = meta.is_some();
        ModelInfo {
            name: name.to_string(),
            file_size_mb: meta.map(|m| m.len() as f64 / (1024.0 * 1024.0)),
            quantization: path.as_deref().filter(|_| available).map(quantization_from_filename),
            available,
            path,
        }
    }

    pub fn list(&self) -> Vec<ModelInfo> {
        self.names().iter().map(|n| self.info(n)).collect()
    }

    pub fn available(&self) -> Vec<String> {
        self.list().into_iter().filter(|i| i.available).map(|i| i.name).collect()
    }

    /// Model file for `name`, or `ModelUnavailable` naming the models that do exist.
    pub fn resolve(&self, name: &str) -> Result<PathBuf> {
        let info = self.info(name);
        match info.path {
            Some(path) if info.available => Ok(path),
            Some(path) => {
                warn!("Model {name} configured at {} but the file is missing", path.display());
                Err(Error::ModelUnavailable(format!("{name}: {} not found", path.display())))
            }
            None => Err(Error::ModelUnavailable(format!(
                "{name} is not configured; available models: {}",
                self.available().join(", ")
            ))),
        }
    }
}
