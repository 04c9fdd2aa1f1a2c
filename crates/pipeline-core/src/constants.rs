//! Shared constants for the pipeline.
//!
//! Static values shared by every stage: the event envelope version, key
//! length, and configuration defaults that don't warrant their own module.

/// Event envelope version (see `event::EventEnvelope`).
pub const EVENT_ENVELOPE_VERSION: &str = "1.0";

/// Length, in hex characters, of primary keys derived by
/// `hashing::derive_key`.
pub const KEY_LENGTH_HEX_CHARS: usize = 16;

/// Single topic/exchange all pipeline events are published to.
pub const EVENTS_TOPIC: &str = "copilot.events";

/// Retry helper defaults (see `retry::RetryConfig`).
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BASE_BACKOFF_SECONDS: u64 = 5;
pub const DEFAULT_RETRY_MAX_BACKOFF_SECONDS: u64 = 60;

/// Retry supervisor defaults (see `pipeline-supervisor`).
pub const DEFAULT_STARTUP_REQUEUE_STALL_THRESHOLD_SECONDS: i64 = 300;
pub const DEFAULT_RETRY_SUPERVISOR_INTERVAL_SECONDS: u64 = 15 * 60;
pub const DEFAULT_RETRY_SUPERVISOR_MAX_RETRIES: u32 = 10;
