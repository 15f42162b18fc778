//! Message IDs of requests the gateway itself sent to chargers
//!
//! Responses carrying one of these IDs belong to the gateway, not the CSMS:
//! the downstream parser consumes them instead of forwarding.

use dashmap::DashSet;

#[derive(Debug, Default)]
pub struct PendingRequests {
    ids: DashSet<String>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an outgoing gateway request, before it is sent.
    pub fn track(&self, message_id: String) {
        self.ids.insert(message_id);
    }

    /// Drop a request that could not be sent after all.
    pub fn untrack(&self, message_id: &str) {
        self.ids.remove(message_id);
    }

    /// Claim the response for `message_id`. Returns `true` exactly once per
    /// tracked ID; the caller then drops the frame.
    pub fn consume(&self, message_id: &str) -> bool {
        self.ids.remove(message_id).is_some()
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.ids.contains(message_id)
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consume_claims_exactly_once() {
        let pending = PendingRequests::new();
        pending.track("X".to_string());
        assert!(pending.contains("X"));
        assert!(pending.consume("X"));
        assert!(!pending.consume("X"));
        assert!(pending.is_empty());
    }

    #[test]
    fn unknown_ids_are_not_consumed() {
        let pending = PendingRequests::new();
        assert!(!pending.consume("never-sent"));
    }
}
