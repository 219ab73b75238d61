//! Streaming text completion against a locally hosted model.

pub mod client;
pub mod engine;
pub mod process;
pub mod registry;
pub mod stop;

pub use client::{InferenceClient, TokenStream};
pub use engine::{Canceller, CompletionEngine, EngineSession, GenerationParams};
pub use process::ProcessEngine;
pub use registry::{ModelFamily, ModelInfo, ModelRegistry};
pub use stop::StopMatcher;
