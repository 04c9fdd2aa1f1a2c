//! `archives` collection.
//!
//! Key from `source + file hash`; produced by the ingest stage.

use crate::error::DomainError;
use chrono::{DateTime, Utc};
use pipeline_core::hashing::{derive_key, hash_bytes};
use pipeline_core::status::{DocumentStatus, LifecycleFields};
use serde::{Deserialize, Serialize};

/// Normalizes a source name for use in the canonical key: lowercase
/// and trimmed.
pub fn normalize_source_name(source: &str) -> String {
    source.trim().to_lowercase()
}

/// Canonical form for an archive's primary key: `"{source_name}|{sha256_of_file_bytes}"`.
pub fn archive_canonical_input(source: &str, file_hash: &str) -> String {
    format!("{}|{}", normalize_source_name(source), file_hash.trim().to_lowercase())
}

pub fn archive_key(source: &str, file_hash: &str) -> String {
    derive_key(&archive_canonical_input(source, file_hash))
}

/// Derives the `file_hash` (full SHA-256) from the raw file bytes.
pub fn file_hash_of(bytes: &[u8]) -> String {
    hash_bytes(bytes)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Archive {
    pub key: String,
    pub source: String,
    pub file_hash: String,
    pub storage_id: String,
    pub ingestion_date: DateTime<Utc>,
    pub message_count: Option<u64>,
    pub lifecycle: LifecycleFields,
}

impl Archive {
    /// Builds a new `Archive` in `pending` state, deriving its key from
    /// `(source, file_hash)`. Two ingestions of the same bytes under the
    /// same source always produce the same key.
    pub fn new_pending(source: &str, file_bytes: &[u8], storage_id: impl Into<String>, now: DateTime<Utc>) -> Result<Self, DomainError> {
        if source.trim().is_empty() {
            return Err(DomainError::ValidationError("archive source must not be empty".into()));
        }
        let file_hash = file_hash_of(file_bytes);
        let key = archive_key(source, &file_hash);
        Ok(Self {
            key,
            source: normalize_source_name(source),
            file_hash,
            storage_id: storage_id.into(),
            ingestion_date: now,
            message_count: None,
            lifecycle: LifecycleFields::new_pending(now),
        })
    }

    pub fn status(&self) -> DocumentStatus {
        self.lifecycle.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_and_source_produce_same_key() {
        let a = Archive::new_pending("ietf-wg-1", b"hello world", "s3://bucket/a", Utc::now()).unwrap();
        let b = Archive::new_pending("IETF-WG-1", b"hello world", "s3://bucket/b", Utc::now()).unwrap();
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn different_bytes_produce_different_keys() {
        let a = Archive::new_pending("s1", b"hello", "x", Utc::now()).unwrap();
        let b = Archive::new_pending("s1", b"world", "x", Utc::now()).unwrap();
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn empty_source_is_rejected() {
        assert!(Archive::new_pending("   ", b"x", "x", Utc::now()).is_err());
    }
}
