//! Retrieval-augmented question answering over an ingested corpus.

pub mod pipeline;
pub mod prompt;
pub mod retriever;

pub use pipeline::{Answer, AskOptions, RagPipeline};
pub use prompt::{estimate_tokens, PromptBuilder};
pub use retriever::Retriever;
