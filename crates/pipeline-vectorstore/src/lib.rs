//! pipeline-vectorstore
//!
//! The `VectorStore` trait: fixed-dimension vectors keyed by chunk key,
//! with a metadata payload and top-k query with an optional filter.
//! `InMemoryVectorStore` backs every test; `QdrantVectorStore` is the
//! production REST driver.

pub mod error;
pub mod memory;
pub mod qdrant;
pub mod store_trait;

pub use error::VectorStoreError;
pub use memory::InMemoryVectorStore;
pub use qdrant::QdrantVectorStore;
pub use store_trait::{SearchResult, VectorStore};
