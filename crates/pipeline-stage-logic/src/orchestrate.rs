//! The orchestration stage's decision policy: pure, no I/O, so it's
//! deterministically testable without a real vector store.

use pipeline_domain::summary::summarization_request_id;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    SummaryAlreadyExists,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerReason {
    NoExistingSummary,
    CitedChunksChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestrationDecision {
    Skip(SkipReason),
    Trigger(TriggerReason),
}

/// Decides whether a thread needs a new summary.
///
/// Triggers if no prior summary exists, or if any of the chunks that
/// prompted this event are not among those cited by the current summary
/// (i.e. "cited chunks changed").
pub fn decide(existing_summary_citations: Option<&[String]>, triggering_chunk_ids: &[String]) -> OrchestrationDecision {
    match existing_summary_citations {
        None => OrchestrationDecision::Trigger(TriggerReason::NoExistingSummary),
        Some(citations) => {
            let all_cited = triggering_chunk_ids.iter().all(|id| citations.contains(id));
            if all_cited {
                OrchestrationDecision::Skip(SkipReason::SummaryAlreadyExists)
            } else {
                OrchestrationDecision::Trigger(TriggerReason::CitedChunksChanged)
            }
        }
    }
}

/// Assembles the context window: includes chunks in ranking order
/// until the next one would exceed `context_window_tokens`.
pub fn assemble_context_window(ranked_chunks: &[(String, usize)], context_window_tokens: usize) -> Vec<String> {
    let mut included = Vec::new();
    let mut total = 0usize;
    for (chunk_id, token_count) in ranked_chunks {
        if total > 0 && total + token_count > context_window_tokens {
            continue;
        }
        if *token_count > context_window_tokens && total > 0 {
            continue;
        }
        included.push(chunk_id.clone());
        total += token_count;
        if total >= context_window_tokens {
            break;
        }
    }
    included
}

/// Deterministic `request_id` for a summarization request; delegates to
/// the domain key that already combines `(thread_key, context_chunk_ids,
/// summary_type)`.
pub fn request_id(thread_key: &str, context_chunk_ids: &[String], summary_type: &str) -> String {
    summarization_request_id(thread_key, context_chunk_ids, summary_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_existing_summary_triggers() {
        let decision = decide(None, &["c1".to_string()]);
        assert_eq!(decision, OrchestrationDecision::Trigger(TriggerReason::NoExistingSummary));
    }

    #[test]
    fn all_triggering_chunks_already_cited_skips() {
        let citations = vec!["c1".to_string(), "c2".to_string()];
        let decision = decide(Some(&citations), &["c1".to_string()]);
        assert_eq!(decision, OrchestrationDecision::Skip(SkipReason::SummaryAlreadyExists));
    }

    #[test]
    fn new_uncited_chunk_triggers() {
        let citations = vec!["c1".to_string()];
        let decision = decide(Some(&citations), &["c1".to_string(), "c2".to_string()]);
        assert_eq!(decision, OrchestrationDecision::Trigger(TriggerReason::CitedChunksChanged));
    }

    #[test]
    fn context_window_stops_before_exceeding_budget() {
        let ranked = vec![("a".to_string(), 100), ("b".to_string(), 100), ("c".to_string(), 100)];
        let included = assemble_context_window(&ranked, 250);
        assert_eq!(included, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn context_window_always_includes_first_chunk_even_if_oversized() {
        let ranked = vec![("a".to_string(), 9000)];
        let included = assemble_context_window(&ranked, 4096);
        assert_eq!(included, vec!["a".to_string()]);
    }

    #[test]
    fn request_id_is_deterministic_and_order_independent() {
        let a = request_id("t1", &["c2".to_string(), "c1".to_string()], "digest");
        let b = request_id("t1", &["c1".to_string(), "c2".to_string()], "digest");
        assert_eq!(a, b);
    }
}
