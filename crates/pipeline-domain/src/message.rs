//! `messages` collection.
//!
//! Key from `archive key + RFC-822 Message-ID`; produced by the parse stage.

use crate::error::DomainError;
use chrono::{DateTime, Utc};
use pipeline_core::hashing::derive_key;
use pipeline_core::status::LifecycleFields;
use serde::{Deserialize, Serialize};

/// Normalizes an RFC-822 Message-ID: lowercase and trimmed (keeps the
/// `<...>` angle brackets as they come from the header).
pub fn normalize_message_id(message_id: &str) -> String {
    message_id.trim().to_lowercase()
}

pub fn message_canonical_input(archive_key: &str, message_id: &str) -> String {
    format!("{}|{}", archive_key, normalize_message_id(message_id))
}

pub fn message_key(archive_key: &str, message_id: &str) -> String {
    derive_key(&message_canonical_input(archive_key, message_id))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub key: String,
    pub archive_id: String,
    pub message_id: String,
    pub thread_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub date: DateTime<Utc>,
    pub participants: Vec<String>,
    pub normalized_body: String,
    pub lifecycle: LifecycleFields,
}

impl Message {
    pub fn new(
        archive_id: impl Into<String>,
        message_id: &str,
        thread_id: impl Into<String>,
        in_reply_to: Option<String>,
        references: Vec<String>,
        date: DateTime<Utc>,
        participants: Vec<String>,
        normalized_body: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self, DomainError> {
        if message_id.trim().is_empty() {
            return Err(DomainError::ValidationError("message_id must not be empty".into()));
        }
        let archive_id = archive_id.into();
        let key = message_key(&archive_id, message_id);
        Ok(Self {
            key,
            archive_id,
            message_id: normalize_message_id(message_id),
            thread_id: thread_id.into(),
            in_reply_to,
            references,
            date,
            participants,
            normalized_body: normalized_body.into(),
            lifecycle: LifecycleFields::new_pending(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_archive_and_message_id_produce_same_key() {
        let a = Message::new("arc1", "<a@x>", "t1", None, vec![], Utc::now(), vec![], "hi", Utc::now()).unwrap();
        let b = Message::new("arc1", "<A@X>", "t1", None, vec![], Utc::now(), vec![], "hi again", Utc::now()).unwrap();
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn different_archive_produces_different_key_for_same_message_id() {
        let a = Message::new("arc1", "<a@x>", "t1", None, vec![], Utc::now(), vec![], "hi", Utc::now()).unwrap();
        let b = Message::new("arc2", "<a@x>", "t1", None, vec![], Utc::now(), vec![], "hi", Utc::now()).unwrap();
        assert_ne!(a.key, b.key);
    }
}
