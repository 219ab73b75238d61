//! Bounded prompt assembly.
//!
//! Token counts are estimated as `ceil(words / 0.75)`. Passages enter in
//! relevance order until the first one that does not fit, so the least
//! relevant passages are the ones dropped and none is ever cut mid-way.

use airgap_core::config::PromptSettings;
use airgap_core::types::{PromptContext, RetrievalResult, Turn};

pub fn estimate_tokens(text: &str) -> usize {
    let words = text.split_whitespace().count();
    // words / 0.75 == words * 4 / 3
    (words * 4).div_ceil(3)
}

pub struct PromptBuilder {
    settings: PromptSettings,
}

impl PromptBuilder {
    pub fn new(settings: PromptSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &PromptSettings {
        &self.settings
    }

    pub fn build(&self, question: &str, retrieval: &RetrievalResult, history: &[Turn], max_tokens: usize) -> PromptContext {
        let mut budget = max_tokens.saturating_sub(estimate_tokens(question));

        let mut passages: Vec<&str> = Vec::new();
        for hit in &retrieval.hits {
            let cost = estimate_tokens(&hit.chunk.text);
            if cost > budget {
                break;
            }
            budget -= cost;
            passages.push(&hit.chunk.text);
        }
        let truncated = passages.len() < retrieval.hits.len();

        if passages.is_empty() {
            return PromptContext {
                text: question.to_string(),
                context_included: false,
                truncated,
                chunks_used: 0,
                token_estimate: estimate_tokens(question),
            };
        }

        // Most recent turns claim the remaining budget first.
        let recent = &history[history.len().saturating_sub(self.settings.history_turns)..];
        let mut kept = 0;
        for turn in recent.iter().rev() {
            let cost = estimate_tokens(&turn.question) + estimate_tokens(&turn.answer);
            if cost > budget {
                break;
            }
            budget -= cost;
            kept += 1;
        }
        let turns = &recent[recent.len() - kept..];

        let mut text = String::new();
        text.push_str(&self.settings.system_prompt);
        text.push_str("\n\nContext:\n");
        text.push_str(&passages.join("\n\n"));
        text.push_str("\n\n");
        for turn in turns {
            text.push_str("Human: ");
            text.push_str(&turn.question);
            text.push_str("\nAssistant: ");
            text.push_str(&turn.answer);
            text.push('\n');
        }
        text.push_str("Human: ");
        text.push_str(question);
        text.push_str("\n\nAssistant:");

        PromptContext {
            token_estimate: estimate_tokens(&text),
            text,
            context_included: true,
            truncated,
            chunks_used: passages.len(),
        }
    }
}
