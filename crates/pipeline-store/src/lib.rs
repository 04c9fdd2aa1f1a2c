//! pipeline-store
//!
//! The collection-oriented document store: five collections
//! (`archives`/`messages`/`threads`/`chunks`/`summaries`) behind a single
//! `DocumentStore` trait, with two functionally equivalent
//! implementations: `InMemoryDocumentStore` (used by every test in the
//! pipeline) and `pg::PgDocumentStore` (Diesel + r2d2 over Postgres).
//!
//! Modules:
//! - `model`: `Collection`, `StoredDocument`, `Filter`/`FilterValue`,
//!   `MutablePatch`.
//! - `store_trait`: the `DocumentStore` trait.
//! - `memory`: in-memory implementation.
//! - `pg`: Postgres implementation, pool utilities and migrations.
//! - `error`: `StoreError` and its conversion to `pipeline_core::CoreError`.
//! - `config`: loading `DATABASE_URL` from the environment.

pub mod config;
pub mod error;
pub mod memory;
pub mod migrations;
pub mod model;
pub mod pg;
pub mod schema;
pub mod store_trait;

pub use config::{init_dotenv, DbConfig};
pub use error::StoreError;
pub use memory::InMemoryDocumentStore;
pub use model::{Collection, Filter, FilterValue, MutablePatch, StoredDocument};
pub use pg::{build_dev_pool_from_env, build_pool, ConnectionProvider, PgDocumentStore, PgPool, PoolProvider};
pub use store_trait::DocumentStore;
