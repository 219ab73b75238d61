#![warn(unused_imports)]
#![warn(unused_variables)]

//! airgap-core
//!
//! Domain types, configuration, error taxonomy, and the chunker shared by the
//! embedding, vector, inference, and pipeline crates.

pub mod chunker;
pub mod config;
pub mod data_processor;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{Error, Result};
