//! Hashing and JSON canonicalization.
//!
//! Role in the pipeline:
//! - Idempotency of every collection depends on canonical serialization.
//! - `to_canonical_json` guarantees stable ordering for JSON objects.
//! - `hash_str`/`hash_value` produce full SHA-256 digests (hex, 64 chars).
//! - `derive_key` applies the document primary key rule:
//!   `hex(sha256(canonical(inputs)))[:16]`.

pub mod canonical_json;
pub mod hash;

pub use canonical_json::to_canonical_json;
pub use hash::{derive_key, hash_bytes, hash_str, hash_value};
