use std::collections::HashMap;

use crate::{RequestId, DEAD_LETTER_ROUTING_KEY};

/// Maps in-flight request ids to the routing key their reply must reach.
///
/// Owned by exactly one server transport. Entries are written when a request
/// carrying a reply-to property arrives and consumed when the matching reply
/// is sent. An entry whose reply never comes stays until [`clear`] runs at
/// shutdown.
///
/// [`clear`]: CorrelationTable::clear
#[derive(Debug, Default)]
pub struct CorrelationTable {
    // ---
    entries: HashMap<RequestId, String>,
}

impl CorrelationTable {
    // ---

    /// Create an empty table.
    pub fn new() -> Self {
        // ---
        Self::default()
    }

    /// Remember where the reply to `id` goes. A second request reusing the
    /// same id overwrites the first (last write wins).
    pub fn put(&mut self, id: RequestId, reply_to: impl Into<String>) {
        // ---
        self.entries.insert(id, reply_to.into());
    }

    /// Remove and return the reply routing key for `id`, or the dead-letter
    /// routing key when nothing is stored.
    pub fn take_and_remove(&mut self, id: &RequestId) -> String {
        // ---
        self.entries
            .remove(id)
            .unwrap_or_else(|| DEAD_LETTER_ROUTING_KEY.to_string())
    }

    /// Drop every entry. Requests still waiting are abandoned silently.
    pub fn clear(&mut self) {
        // ---
        self.entries.clear();
    }

    /// Number of requests still awaiting a reply.
    pub fn len(&self) -> usize {
        // ---
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_put_and_take() {
        // ---
        let mut table = CorrelationTable::new();
        let id = RequestId::from("client-abc-1");

        table.put(id.clone(), "from-mcp.calc.client-id.client-abc");
        assert_eq!(table.len(), 1);

        assert_eq!(
            table.take_and_remove(&id),
            "from-mcp.calc.client-id.client-abc"
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_missing_id_goes_to_dead_letter() {
        // ---
        let mut table = CorrelationTable::new();
        let id = RequestId::from("never-seen");

        assert_eq!(table.take_and_remove(&id), DEAD_LETTER_ROUTING_KEY);
    }

    #[test]
    fn test_second_take_goes_to_dead_letter() {
        // ---
        let mut table = CorrelationTable::new();
        let id = RequestId::Number(4);

        table.put(id.clone(), "reply.key");
        assert_eq!(table.take_and_remove(&id), "reply.key");
        assert_eq!(table.take_and_remove(&id), DEAD_LETTER_ROUTING_KEY);
    }

    #[test]
    fn test_last_write_wins() {
        // ---
        let mut table = CorrelationTable::new();
        let id = RequestId::from("dup");

        table.put(id.clone(), "first");
        table.put(id.clone(), "second");

        assert_eq!(table.len(), 1);
        assert_eq!(table.take_and_remove(&id), "second");
    }

    #[test]
    fn test_string_and_number_ids_are_distinct() {
        // ---
        let mut table = CorrelationTable::new();

        table.put(RequestId::Number(1), "numeric");
        table.put(RequestId::from("1"), "textual");

        assert_eq!(table.take_and_remove(&RequestId::from("1")), "textual");
        assert_eq!(table.take_and_remove(&RequestId::Number(1)), "numeric");
    }

    #[test]
    fn test_clear() {
        // ---
        let mut table = CorrelationTable::new();
        table.put(RequestId::Number(1), "a");
        table.put(RequestId::Number(2), "b");

        table.clear();

        assert!(table.is_empty());
        assert_eq!(
            table.take_and_remove(&RequestId::Number(1)),
            DEAD_LETTER_ROUTING_KEY
        );
    }
}
