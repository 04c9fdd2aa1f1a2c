//! pipeline-domain: the five persisted entities and their canonical key
//! constructors.
//!
//! Each module corresponds to a document store collection and exposes:
//! - the canonical input string constructor (`*_canonical_input`),
//! - the primary key derivation (`*_key`, via `pipeline_core::hashing`),
//! - the entity type with its immutable fields and its `LifecycleFields`
//!   (when the collection carries stage state).

pub mod archive;
pub mod chunk;
pub mod error;
pub mod message;
pub mod summary;
pub mod thread;

pub use archive::Archive;
pub use chunk::Chunk;
pub use error::DomainError;
pub use message::Message;
pub use summary::Summary;
pub use thread::Thread;
