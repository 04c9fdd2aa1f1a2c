//! Document state machine.
//!
//! ```text
//! pending ──(stage begins)──▶ processing ──(stage succeeds)──▶ completed
//!    │                             │
//!    └─────────(stage fails)───────┴──▶ failed
//!                                       │
//!                           (retry supervisor re-emits)
//!                                       ▼
//!                                   processing
//! ```
//!
//! Transitions are monotonic towards `completed`/`failed`; the only way
//! back to `processing` from `failed` is the retry supervisor re-emitting
//! the originating event. `attempt_count` increments on every entry into
//! `processing`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for DocumentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DocumentStatus::Pending),
            "processing" => Ok(DocumentStatus::Processing),
            "completed" => Ok(DocumentStatus::Completed),
            "failed" => Ok(DocumentStatus::Failed),
            other => Err(format!("unknown document status: {other}")),
        }
    }
}

impl DocumentStatus {
    /// Returns `true` if `self -> next` is a legal transition in the
    /// state machine. Does not validate *who* performs the transition
    /// (that's the calling stage/supervisor's responsibility).
    pub fn can_transition_to(self, next: DocumentStatus) -> bool {
        use DocumentStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Processing) // only the retry supervisor re-emits
        )
    }
}

/// Mutable state shared by every entity in the document store: the
/// status/attempt_count/last_updated trio that the supervisor and stages
/// can rewrite, plus `last_attempt_time` used by the startup requeue to
/// detect stalled documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleFields {
    pub status: DocumentStatus,
    pub attempt_count: u32,
    pub last_attempt_time: Option<chrono::DateTime<chrono::Utc>>,
    pub last_updated: chrono::DateTime<chrono::Utc>,
}

impl LifecycleFields {
    pub fn new_pending(now: chrono::DateTime<chrono::Utc>) -> Self {
        Self { status: DocumentStatus::Pending, attempt_count: 0, last_attempt_time: None, last_updated: now }
    }

    /// Applies the `pending|failed -> processing` transition,
    /// incrementing `attempt_count`. Returns `Err` if the transition
    /// isn't legal.
    pub fn begin_processing(&mut self, now: chrono::DateTime<chrono::Utc>) -> Result<(), String> {
        if !self.status.can_transition_to(DocumentStatus::Processing) {
            return Err(format!("illegal transition {} -> processing", self.status));
        }
        self.status = DocumentStatus::Processing;
        self.attempt_count += 1;
        self.last_attempt_time = Some(now);
        self.last_updated = now;
        Ok(())
    }

    pub fn complete(&mut self, now: chrono::DateTime<chrono::Utc>) -> Result<(), String> {
        if !self.status.can_transition_to(DocumentStatus::Completed) {
            return Err(format!("illegal transition {} -> completed", self.status));
        }
        self.status = DocumentStatus::Completed;
        self.last_updated = now;
        Ok(())
    }

    pub fn fail(&mut self, now: chrono::DateTime<chrono::Utc>) -> Result<(), String> {
        if !self.status.can_transition_to(DocumentStatus::Failed) {
            return Err(format!("illegal transition {} -> failed", self.status));
        }
        self.status = DocumentStatus::Failed;
        self.last_updated = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn legal_transitions_per_state_machine() {
        use DocumentStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn attempt_count_increments_only_on_processing_entry() {
        let mut fields = LifecycleFields::new_pending(Utc::now());
        assert_eq!(fields.attempt_count, 0);
        fields.begin_processing(Utc::now()).unwrap();
        assert_eq!(fields.attempt_count, 1);
        fields.fail(Utc::now()).unwrap();
        assert_eq!(fields.attempt_count, 1);
        fields.begin_processing(Utc::now()).unwrap();
        assert_eq!(fields.attempt_count, 2);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        let mut fields = LifecycleFields::new_pending(Utc::now());
        assert!(fields.complete(Utc::now()).is_err());
    }

    #[test]
    fn last_updated_is_non_decreasing_across_transitions() {
        let t0 = Utc::now();
        let mut fields = LifecycleFields::new_pending(t0);
        let t1 = t0 + chrono::Duration::seconds(1);
        fields.begin_processing(t1).unwrap();
        assert!(fields.last_updated >= t0);
        let t2 = t1 + chrono::Duration::seconds(1);
        fields.complete(t2).unwrap();
        assert!(fields.last_updated >= t1);
    }
}
