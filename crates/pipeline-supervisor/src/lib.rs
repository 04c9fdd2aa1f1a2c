//! pipeline-supervisor: the two halves of startup and retry recovery —
//! the startup requeue that each stage already knows how to run over
//! itself (`StartupRequeue`, a thin orchestration wrapper) and the
//! periodic retry sweep that operates directly on the document store
//! (`RetrySupervisor`), living outside the stages because it crosses the
//! four eligible collections rather than belonging to just one.

pub mod retry_job;
pub mod startup;

pub use retry_job::RetrySupervisor;
pub use startup::StartupRequeue;
