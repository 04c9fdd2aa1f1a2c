//! `summaries` collection.
//!
//! Key from `thread key + summary_type`; produced by the summarize stage.

use chrono::{DateTime, Utc};
use pipeline_core::hashing::derive_key;
use serde::{Deserialize, Serialize};

pub fn summary_canonical_input(thread_key: &str, summary_type: &str) -> String {
    format!("{}|{}", thread_key, summary_type.trim().to_lowercase())
}

pub fn summary_key(thread_key: &str, summary_type: &str) -> String {
    derive_key(&summary_canonical_input(thread_key, summary_type))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub key: String,
    pub thread_id: String,
    pub summary_type: String,
    pub content: String,
    pub citations: Vec<String>,
    pub generated_by: String,
    pub generated_at: DateTime<Utc>,
}

impl Summary {
    pub fn new(
        thread_id: impl Into<String>,
        summary_type: &str,
        content: impl Into<String>,
        citations: Vec<String>,
        generated_by: impl Into<String>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        let thread_id = thread_id.into();
        let key = summary_key(&thread_id, summary_type);
        Self {
            key,
            thread_id,
            summary_type: summary_type.trim().to_lowercase(),
            content: content.into(),
            citations,
            generated_by: generated_by.into(),
            generated_at,
        }
    }
}

/// `request_id` for a summarization request: deterministic over
/// `(thread_key, context_chunk_ids, summary_type)`. Duplicate requests
/// are deduplicated by this id in the summarize stage.
pub fn summarization_request_id(thread_key: &str, context_chunk_ids: &[String], summary_type: &str) -> String {
    let mut sorted_ids = context_chunk_ids.to_vec();
    sorted_ids.sort();
    let input = format!("{}|{}|{}", thread_key, sorted_ids.join(","), summary_type.trim().to_lowercase());
    derive_key(&input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_deterministic_on_thread_and_type() {
        let a = Summary::new("t1", "digest", "c1", vec![], "llm", Utc::now());
        let b = Summary::new("t1", "DIGEST", "c2 different", vec!["x".into()], "llm2", Utc::now());
        assert_eq!(a.key, b.key);
    }

    #[test]
    fn request_id_is_order_independent_in_chunk_ids() {
        let a = summarization_request_id("t1", &["c2".to_string(), "c1".to_string()], "digest");
        let b = summarization_request_id("t1", &["c1".to_string(), "c2".to_string()], "digest");
        assert_eq!(a, b);
    }

    #[test]
    fn request_id_differs_for_different_context() {
        let a = summarization_request_id("t1", &["c1".to_string()], "digest");
        let b = summarization_request_id("t1", &["c1".to_string(), "c2".to_string()], "digest");
        assert_ne!(a, b);
    }
}
