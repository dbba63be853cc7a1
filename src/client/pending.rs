use std::collections::HashMap;

use crate::{ClientId, RequestId};

/// Remembers the application-level id behind every augmented request id.
///
/// Entries are written when a request leaves and forgotten once the matching
/// response has been handed on. An entry whose response never arrives stays
/// until the owning transport closes. A prefixed id this client never sent (or already
/// restored) is still stripped: a numeric remainder comes back as a number,
/// anything else as a string.
#[derive(Debug, Default)]
pub(super) struct IdRestorer {
    // ---
    originals: HashMap<String, RequestId>,
}

impl IdRestorer {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `original` went out on the wire as `wire_id`.
    pub fn register(&mut self, wire_id: &RequestId, original: RequestId) {
        // ---
        if let RequestId::String(wire) = wire_id {
            self.originals.insert(wire.clone(), original);
        }
    }

    /// Map a wire id back to what the application used, or `None` if the id
    /// does not carry this client's prefix.
    pub fn restore(&self, client_id: &ClientId, wire_id: &RequestId) -> Option<RequestId> {
        // ---
        let RequestId::String(wire) = wire_id else {
            return None;
        };

        if let Some(original) = self.originals.get(wire) {
            return Some(original.clone());
        }

        let rest = client_id.strip(wire)?;
        Some(match rest.parse::<i64>() {
            Ok(n) if n.to_string() == rest => RequestId::Number(n),
            _ => RequestId::String(rest.to_string()),
        })
    }

    /// Drop the entry for `wire_id`; returns how many are left.
    pub fn forget(&mut self, wire_id: &RequestId) -> usize {
        // ---
        if let RequestId::String(wire) = wire_id {
            self.originals.remove(wire);
        }
        self.originals.len()
    }

    /// Number of requests still awaiting a response.
    pub fn len(&self) -> usize {
        self.originals.len()
    }

    pub fn clear(&mut self) {
        self.originals.clear();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn client() -> ClientId {
        ClientId::from("client-abc")
    }

    #[test]
    fn test_register_and_restore() {
        // ---
        let mut ids = IdRestorer::new();
        let original = RequestId::Number(1);
        let wire = client().augment(&original);

        ids.register(&wire, original.clone());
        assert_eq!(ids.len(), 1);

        assert_eq!(ids.restore(&client(), &wire), Some(original));
        assert_eq!(ids.len(), 1);

        assert_eq!(ids.forget(&wire), 0);
    }

    #[test]
    fn test_numeric_looking_string_keeps_its_type() {
        // ---
        let mut ids = IdRestorer::new();
        let original = RequestId::from("7");
        let wire = client().augment(&original);

        ids.register(&wire, original.clone());
        assert_eq!(ids.restore(&client(), &wire), Some(original));
    }

    #[test]
    fn test_unknown_prefixed_ids() {
        // ---
        let ids = IdRestorer::new();

        assert_eq!(
            ids.restore(&client(), &RequestId::from("client-abc-42")),
            Some(RequestId::Number(42))
        );
        assert_eq!(
            ids.restore(&client(), &RequestId::from("client-abc-007")),
            Some(RequestId::from("007"))
        );
        assert_eq!(
            ids.restore(&client(), &RequestId::from("client-abc-req-9")),
            Some(RequestId::from("req-9"))
        );
    }

    #[test]
    fn test_foreign_ids_pass() {
        // ---
        let ids = IdRestorer::new();

        assert_eq!(ids.restore(&client(), &RequestId::from("client-xyz-1")), None);
        assert_eq!(ids.restore(&client(), &RequestId::Number(1)), None);
    }

    #[test]
    fn test_clear() {
        // ---
        let mut ids = IdRestorer::new();
        let wire = client().augment(&RequestId::Number(1));
        ids.register(&wire, RequestId::Number(1));

        ids.clear();
        assert_eq!(ids.len(), 0);
    }
}
