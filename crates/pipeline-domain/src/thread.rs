//! `threads` collection.
//!
//! Key from the root message's key; produced by the parse stage, updated by
//! orchestrate/summarize (`summary_id`).

use pipeline_core::hashing::derive_key;
use pipeline_core::status::DocumentStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub fn thread_canonical_input(root_message_key: &str) -> String {
    root_message_key.to_string()
}

pub fn thread_key(root_message_key: &str) -> String {
    derive_key(&thread_canonical_input(root_message_key))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub key: String,
    pub archive_id: String,
    pub root_message_key: String,
    pub participants: BTreeSet<String>,
    pub message_count: u64,
    pub summary_id: Option<String>,
    pub status: DocumentStatus,
}

impl Thread {
    pub fn new(archive_id: impl Into<String>, root_message_key: impl Into<String>) -> Self {
        let root_message_key = root_message_key.into();
        let key = thread_key(&root_message_key);
        Self {
            key,
            archive_id: archive_id.into(),
            root_message_key,
            participants: BTreeSet::new(),
            message_count: 0,
            summary_id: None,
            status: DocumentStatus::Pending,
        }
    }

    /// Merges a new message into the thread: adds its participants and
    /// increments `message_count`. Idempotent with respect to repeated
    /// participants (a `BTreeSet`), but `message_count` assumes the
    /// caller has already discarded key duplicates.
    pub fn merge_message(&mut self, participants: impl IntoIterator<Item = String>) {
        for p in participants {
            self.participants.insert(p);
        }
        self.message_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_deterministic_on_root_message_key() {
        let t1 = Thread::new("arc1", "rootkey123");
        let t2 = Thread::new("arc1", "rootkey123");
        assert_eq!(t1.key, t2.key);
    }

    #[test]
    fn merge_message_deduplicates_participants_but_counts_every_message() {
        let mut t = Thread::new("arc1", "root1");
        t.merge_message(vec!["a@x".to_string(), "b@x".to_string()]);
        t.merge_message(vec!["a@x".to_string(), "c@x".to_string()]);
        assert_eq!(t.participants.len(), 3);
        assert_eq!(t.message_count, 2);
    }
}
