//! Queue/subscription naming conventions. Every stage predeclares an
//! input queue bound to the routing key it consumes, plus its own
//! failure queue (`<stage>.failed`) to which the bus routes a poisoned
//! message.

/// Name of a stage's input queue.
pub fn input_queue(stage: &str) -> String {
    format!("{stage}.in")
}

/// Name of a stage's failure queue: declared by each stage, consumed
/// only by the retry supervisor (via the document store, never by
/// subscribing to the queue itself).
pub fn failure_queue(stage: &str) -> String {
    format!("{stage}.failed")
}
