//! `chunks` collection.
//!
//! Key from `message key + chunk index`; produced by the chunk stage, with
//! `embedding_generated` exclusively owned by the embed stage.

use pipeline_core::hashing::derive_key;
use pipeline_core::status::LifecycleFields;
use serde::{Deserialize, Serialize};

pub fn chunk_canonical_input(message_key: &str, chunk_index: usize) -> String {
    format!("{}|{}", message_key, chunk_index)
}

pub fn chunk_key(message_key: &str, chunk_index: usize) -> String {
    derive_key(&chunk_canonical_input(message_key, chunk_index))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub key: String,
    pub archive_id: String,
    pub message_id: String,
    pub thread_id: String,
    pub chunk_index: usize,
    pub text: String,
    pub token_count: usize,
    pub start_offset: Option<usize>,
    pub end_offset: Option<usize>,
    pub embedding_generated: bool,
    pub lifecycle: LifecycleFields,
}

impl Chunk {
    pub fn new(
        archive_id: impl Into<String>,
        message_id: impl Into<String>,
        thread_id: impl Into<String>,
        chunk_index: usize,
        text: impl Into<String>,
        token_count: usize,
        start_offset: Option<usize>,
        end_offset: Option<usize>,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Self {
        let message_id = message_id.into();
        let key = chunk_key(&message_id, chunk_index);
        Self {
            key,
            archive_id: archive_id.into(),
            message_id,
            thread_id: thread_id.into(),
            chunk_index,
            text: text.into(),
            token_count,
            start_offset,
            end_offset,
            embedding_generated: false,
            lifecycle: LifecycleFields::new_pending(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_deterministic_on_message_and_index() {
        let now = chrono::Utc::now();
        let a = Chunk::new("arc", "msg1", "t1", 0, "hello", 1, Some(0), Some(5), now);
        let b = Chunk::new("arc", "msg1", "t1", 0, "different text but same index", 9, None, None, now);
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn different_index_produces_different_key() {
        let now = chrono::Utc::now();
        let a = Chunk::new("arc", "msg1", "t1", 0, "x", 1, None, None, now);
        let b = Chunk::new("arc", "msg1", "t1", 1, "x", 1, None, None, now);
        assert_ne!(a.key, b.key);
    }

    #[test]
    fn new_chunk_has_embedding_generated_false() {
        let now = chrono::Utc::now();
        let c = Chunk::new("arc", "msg1", "t1", 0, "x", 1, None, None, now);
        assert!(!c.embedding_generated);
    }
}
