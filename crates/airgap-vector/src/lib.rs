//! Exact cosine vector index with LanceDB snapshot persistence.

pub mod index;
pub mod schema;
pub mod store;
pub mod table;

pub use index::{cosine, AddOutcome, VectorIndex};
pub use store::{LanceStore, StoreInfo};

pub(crate) fn storage_err<E: std::fmt::Display>(e: E) -> airgap_core::Error {
    airgap_core::Error::Storage(e.to_string())
}
