//! Interfaces toward external collaborators that sit outside this
//! crate's scope (embedding/LLM inference, archive byte storage,
//! delivery to report sinks): only the contract is this pipeline's
//! responsibility, not the concrete implementation. Each trait ships
//! with an in-memory implementation that backs the tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pipeline_core::CoreError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Store for the raw bytes of an ingested archive. The ingest stage
/// writes; the parse stage reads.
#[async_trait]
pub trait ArchiveBytesStore: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, CoreError>;
    async fn get(&self, storage_id: &str) -> Result<Vec<u8>, CoreError>;
}

#[derive(Default)]
pub struct InMemoryArchiveBytesStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryArchiveBytesStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArchiveBytesStore for InMemoryArchiveBytesStore {
    async fn put(&self, bytes: Vec<u8>) -> Result<String, CoreError> {
        let id = pipeline_core::hashing::hash_bytes(&bytes);
        self.blobs.lock().unwrap().insert(id.clone(), bytes);
        Ok(id)
    }

    async fn get(&self, storage_id: &str) -> Result<Vec<u8>, CoreError> {
        self.blobs
            .lock()
            .unwrap()
            .get(storage_id)
            .cloned()
            .ok_or_else(|| CoreError::PermanentError(format!("no blob for storage_id {storage_id}")))
    }
}

/// Embedding generator. `dimension()` must match the vector store
/// collection; a mismatch is only discovered at `upsert` time, which is
/// already fatal there.
#[async_trait]
pub trait Embedder: Send + Sync {
    fn dimension(&self) -> usize;
    /// Identifier recorded on `embeddings.generated` events and on each
    /// chunk's vector-store payload, so a retrieval or audit can tell
    /// which model produced a given vector.
    fn model_name(&self) -> &str;
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError>;
}

/// Hashing-based deterministic embedder, useful for tests: two
/// identical texts produce the same vector, with no dependency on a
/// real model.
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hashing-embedder"
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CoreError> {
        Ok(texts.iter().map(|t| hash_to_vector(t, self.dimension)).collect())
    }
}

fn hash_to_vector(text: &str, dimension: usize) -> Vec<f32> {
    let digest = pipeline_core::hashing::hash_str(text);
    let bytes: Vec<u8> = digest
        .as_bytes()
        .chunks(2)
        .filter_map(|c| std::str::from_utf8(c).ok().and_then(|s| u8::from_str_radix(s, 16).ok()))
        .collect();
    (0..dimension)
        .map(|i| {
            let b = bytes[i % bytes.len()];
            (b as f32 / 255.0) * 2.0 - 1.0
        })
        .collect()
}

/// Result of a summarization call.
#[derive(Debug, Clone)]
pub struct LlmSummary {
    pub content: String,
    pub citations: Vec<String>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

/// LLM backend that generates a summary from an already-assembled
/// context. The exact prompt shape is out of scope here; only the
/// input/output contract matters.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn summarize(&self, context_chunks: &[(String, String)], summary_type: &str) -> Result<LlmSummary, CoreError>;
}

/// Extractive backend: concatenates the text of the cited chunks,
/// without calling any real model. Enough to exercise the summarization
/// contract in tests without external credentials.
pub struct ExtractiveLlmBackend;

#[async_trait]
impl LlmBackend for ExtractiveLlmBackend {
    async fn summarize(&self, context_chunks: &[(String, String)], summary_type: &str) -> Result<LlmSummary, CoreError> {
        let content = context_chunks.iter().map(|(_, text)| text.as_str()).collect::<Vec<_>>().join(" ");
        let citations = context_chunks.iter().map(|(id, _)| id.clone()).collect();
        let prompt_tokens = content.split_whitespace().count() as u64;
        Ok(LlmSummary { content: format!("[{summary_type}] {content}"), citations, prompt_tokens, completion_tokens: prompt_tokens })
    }
}

/// A message already decomposed from an mbox archive: exactly the
/// fields the parse stage needs, before a key is derived for it.
#[derive(Debug, Clone)]
pub struct RawParsedMessage {
    pub message_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub date: DateTime<Utc>,
    pub participants: Vec<String>,
    pub body: String,
}

/// Decomposes an archive into RFC-5322 messages (the concrete
/// mbox/RFC-5322 parsing implementation is out of scope; only the
/// input/output contract is this pipeline's responsibility).
#[async_trait]
pub trait ArchiveDecomposer: Send + Sync {
    async fn decompose(&self, archive_bytes: &[u8]) -> Result<Vec<RawParsedMessage>, CoreError>;
}

/// Pragmatic mbox decomposer: splits records on a line starting with
/// `From ` (the classic mbox separator) and extracts a handful of
/// RFC-822 headers with a line-based parser, not a full RFC 5322
/// implementation (that's explicitly the out-of-scope collaborator).
/// Enough to exercise the parse contract in tests without an external
/// mbox parsing dependency.
pub struct SimpleMboxDecomposer;

#[async_trait]
impl ArchiveDecomposer for SimpleMboxDecomposer {
    async fn decompose(&self, archive_bytes: &[u8]) -> Result<Vec<RawParsedMessage>, CoreError> {
        let text = std::str::from_utf8(archive_bytes).map_err(|e| CoreError::PermanentError(format!("archive is not valid UTF-8: {e}")))?;
        let mut records: Vec<&str> = Vec::new();
        let mut current_start = None;
        for (idx, line) in split_lines_with_offsets(text) {
            if line.starts_with("From ") {
                if let Some(start) = current_start {
                    records.push(&text[start..idx]);
                }
                current_start = Some(idx);
            }
        }
        if let Some(start) = current_start {
            records.push(&text[start..]);
        }

        let mut messages = Vec::with_capacity(records.len());
        for record in records {
            if let Some(msg) = parse_record(record) {
                messages.push(msg);
            }
        }
        Ok(messages)
    }
}

fn split_lines_with_offsets(text: &str) -> impl Iterator<Item = (usize, &str)> {
    let mut offset = 0usize;
    text.split_inclusive('\n').map(move |line| {
        let start = offset;
        offset += line.len();
        (start, line.trim_end_matches('\n'))
    })
}

fn header_value<'a>(header_name: &str, lines: &[&'a str]) -> Option<&'a str> {
    let prefix = format!("{header_name}:");
    lines.iter().find_map(|l| l.strip_prefix(prefix.as_str()).map(str::trim))
}

fn parse_record(record: &str) -> Option<RawParsedMessage> {
    let mut lines_iter = record.lines();
    lines_iter.next(); // the "From ..." separator line
    let header_lines: Vec<&str> = lines_iter.clone().take_while(|l| !l.is_empty()).collect();
    let body: String = lines_iter.skip(header_lines.len() + 1).collect::<Vec<_>>().join("\n");

    let message_id = header_value("Message-ID", &header_lines)?.to_string();
    let in_reply_to = header_value("In-Reply-To", &header_lines).map(str::to_string);
    let references = header_value("References", &header_lines)
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default();
    let from = header_value("From", &header_lines).unwrap_or("unknown").to_string();
    let date = header_value("Date", &header_lines)
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    Some(RawParsedMessage { message_id, in_reply_to, references, date, participants: vec![from], body })
}

#[cfg(test)]
mod mbox_tests {
    use super::*;

    #[tokio::test]
    async fn decomposes_single_message_mbox() {
        let mbox = b"From a@x Mon Jan  1 00:00:00 2024\nFrom: a@x\nMessage-ID: <a@x>\nDate: Mon, 1 Jan 2024 00:00:00 +0000\n\nhello world\n";
        let messages = SimpleMboxDecomposer.decompose(mbox).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, "<a@x>");
        assert_eq!(messages[0].body.trim(), "hello world");
    }

    #[tokio::test]
    async fn decomposes_multiple_messages_separated_by_from_lines() {
        let mbox = b"From a@x Mon Jan  1 00:00:00 2024\nFrom: a@x\nMessage-ID: <a@x>\n\nfirst\nFrom b@x Mon Jan  1 00:00:01 2024\nFrom: b@x\nMessage-ID: <b@x>\nIn-Reply-To: <a@x>\n\nsecond\n";
        let messages = SimpleMboxDecomposer.decompose(mbox).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].in_reply_to.as_deref(), Some("<a@x>"));
    }

    #[tokio::test]
    async fn empty_archive_yields_no_messages() {
        let messages = SimpleMboxDecomposer.decompose(b"").await.unwrap();
        assert!(messages.is_empty());
    }
}

/// Report delivery sink (webhook, etc). Treated as an external
/// collaborator; only the delivery contract is exposed.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn deliver(&self, thread_id: &str, summary_key: &str, content: &str) -> Result<(), CoreError>;
}

#[derive(Debug, Clone)]
pub struct DeliveredReport {
    pub thread_id: String,
    pub summary_key: String,
    pub content: String,
}

#[derive(Default)]
pub struct InMemoryReportSink {
    delivered: Mutex<Vec<DeliveredReport>>,
}

impl InMemoryReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delivered(&self) -> Vec<DeliveredReport> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReportSink for InMemoryReportSink {
    async fn deliver(&self, thread_id: &str, summary_key: &str, content: &str) -> Result<(), CoreError> {
        self.delivered.lock().unwrap().push(DeliveredReport {
            thread_id: thread_id.to_string(),
            summary_key: summary_key.to_string(),
            content: content.to_string(),
        });
        Ok(())
    }
}
