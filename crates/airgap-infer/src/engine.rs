use std::sync::Arc;

use airgap_core::config::GenerationSettings;
use airgap_core::Result;

use crate::registry::dynamic_max_tokens;

/// Sampling parameters for one completion.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub n_ctx: usize,
    pub n_batch: usize,
    pub stop: Vec<String>,
}

impl GenerationParams {
    pub fn from_settings(settings: &GenerationSettings) -> Self {
        Self {
            max_tokens: settings.max_output_tokens,
            temperature: settings.temperature,
            top_p: settings.top_p,
            repeat_penalty: settings.repeat_penalty,
            n_ctx: settings.n_ctx,
            n_batch: settings.n_batch,
            stop: settings.stop.clone(),
        }
    }

    /// Parameters with the output budget shrunk to what fits beside `prompt`.
    pub fn for_prompt(settings: &GenerationSettings, prompt: &str) -> Self {
        let mut params = Self::from_settings(settings);
        params.max_tokens = dynamic_max_tokens(prompt, settings.max_output_tokens, settings.n_ctx);
        params
    }
}

/// Stops a running session; must make a blocked token pull return promptly.
pub type Canceller = Arc<dyn Fn() + Send + Sync>;

/// A started completion: blocking token pulls plus a way to cancel them.
pub struct EngineSession {
    pub tokens: Box<dyn Iterator<Item = Result<String>> + Send>,
    pub cancel: Canceller,
}

/// Opaque text-completion backend.
pub trait CompletionEngine: Send + Sync {
    fn name(&self) -> &str;
    fn start(&self, prompt: &str, params: &GenerationParams) -> Result<EngineSession>;
}
