//! pipeline-stage-logic
//!
//! Pure business logic for the stages, isolated from I/O so it's
//! testable without a real bus/store/vector-store: the three chunking
//! strategies and the orchestration stage's decision policy.

pub mod chunker;
pub mod orchestrate;

pub use chunker::{chunk_fixed_size, chunk_semantic, chunk_token_window, RawChunk};
pub use orchestrate::{assemble_context_window, decide, request_id, OrchestrationDecision, SkipReason, TriggerReason};
