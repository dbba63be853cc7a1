//! Routing-key and address derivation.
//!
//! Every name that crosses the broker is derived here so that both wire
//! realizations, the interceptor and the adaptors agree on one grammar:
//!
//! | purpose                | routing key                                   |
//! |------------------------|-----------------------------------------------|
//! | client → server        | `mcp.<server>.request`                        |
//! | server → one client    | `from-mcp.<server>.client-id.<client-id>`     |
//! | uncorrelated replies   | `dlq`                                         |
//!
//! Routing keys are dot-separated words, so server names, exchange names
//! and client identities must never contain `.`, `*` or `#`.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::{RequestId, Result, TransportError};

/// Routing key used for replies that cannot be correlated to a live request.
pub const DEAD_LETTER_ROUTING_KEY: &str = "dlq";

/// Header / application property carrying the reply routing key.
pub const REPLY_TO_HEADER: &str = "routingKeyToReply";

/// Header carrying the publishing client's identity.
pub const CLIENT_ID_HEADER: &str = "clientId";

/// Binding pattern matching every request to any server.
pub const ALL_REQUESTS_PATTERN: &str = "mcp.*.request";

/// Binding pattern matching every reply to any client of any server.
pub const ALL_REPLIES_PATTERN: &str = "from-mcp.*.client-id.*";

/// Routing key all clients of `server_name` publish their requests to.
pub fn request_routing_key(server_name: &str) -> String {
    format!("mcp.{server_name}.request")
}

/// Routing key of one client instance's private reply destination.
pub fn reply_routing_key(server_name: &str, client_id: &ClientId) -> String {
    format!("from-mcp.{server_name}.client-id.{client_id}")
}

/// Durable queue shared by every instance serving `server_name` (AMQP 0-9-1).
pub fn request_queue_name(server_name: &str) -> String {
    format!("mcp-{server_name}-request")
}

/// Exclusive reply queue of one client instance (AMQP 0-9-1).
pub fn reply_queue_name(server_name: &str, client_id: &ClientId) -> String {
    format!("mcp-{server_name}-response-{client_id}")
}

/// Link address of `routing_key` on `exchange` (AMQP 1.0).
pub fn link_address(exchange: &str, routing_key: &str) -> String {
    format!("exchange.{exchange}.{routing_key}")
}

/// Check that `value` can be embedded as one routing-key word.
///
/// `field` names the configuration field in the returned error.
pub fn validate_name(field: &'static str, value: &str) -> Result<()> {
    // ---
    if value.is_empty() {
        return Err(TransportError::validation(field, "must not be empty"));
    }

    if let Some(bad) = value
        .chars()
        .find(|c| matches!(c, '.' | '*' | '#') || c.is_whitespace())
    {
        return Err(TransportError::validation(
            field,
            format!("must not contain {bad:?} (reserved by the routing-key grammar)"),
        ));
    }

    Ok(())
}

/// Identity of one client transport instance.
///
/// Generated once per instance as `client-<uuid-v4>`. Used as the prefix of
/// every outgoing request id and to derive the private reply routing key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(Arc<str>);

impl ClientId {
    // ---

    /// Generate a new unique client identity.
    pub fn generate() -> Self {
        // ---
        Self(format!("client-{}", Uuid::new_v4()).into())
    }

    /// Borrow the identity as a string slice.
    pub fn as_str(&self) -> &str {
        // ---
        &self.0
    }

    /// Rewrite an application-level id into its broker-wide unique form.
    pub fn augment(&self, id: &RequestId) -> RequestId {
        // ---
        RequestId::String(format!("{}-{id}", self.0))
    }

    /// Return what follows `"<client-id>-"` in `wire_id`, if it carries this
    /// client's prefix.
    pub fn strip<'a>(&self, wire_id: &'a str) -> Option<&'a str> {
        // ---
        wire_id.strip_prefix(self.as_str())?.strip_prefix('-')
    }
}

impl From<&str> for ClientId {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for ClientId {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::transport::topic_matches;

    #[test]
    fn test_routing_keys() {
        // ---
        let client = ClientId::from("client-abc");

        assert_eq!(request_routing_key("calc"), "mcp.calc.request");
        assert_eq!(
            reply_routing_key("calc", &client),
            "from-mcp.calc.client-id.client-abc"
        );
        assert_eq!(request_queue_name("calc"), "mcp-calc-request");
        assert_eq!(
            reply_queue_name("calc", &client),
            "mcp-calc-response-client-abc"
        );
        assert_eq!(
            link_address("mcp", "mcp.calc.request"),
            "exchange.mcp.mcp.calc.request"
        );
    }

    #[test]
    fn test_wildcards_cover_derived_keys() {
        // ---
        let client = ClientId::generate();

        assert!(topic_matches(ALL_REQUESTS_PATTERN, &request_routing_key("calc")));
        assert!(topic_matches(
            ALL_REPLIES_PATTERN,
            &reply_routing_key("calc", &client)
        ));
        assert!(!topic_matches(ALL_REQUESTS_PATTERN, DEAD_LETTER_ROUTING_KEY));
        assert!(!topic_matches(ALL_REPLIES_PATTERN, DEAD_LETTER_ROUTING_KEY));
    }

    #[test]
    fn test_generated_ids_are_single_words() {
        // ---
        let a = ClientId::generate();
        let b = ClientId::generate();

        assert_ne!(a, b);
        assert!(a.as_str().starts_with("client-"));
        assert!(validate_name("client_id", a.as_str()).is_ok());
    }

    #[test]
    fn test_augment_and_strip() {
        // ---
        let client = ClientId::from("client-abc");

        let wire = client.augment(&RequestId::Number(1));
        assert_eq!(wire, RequestId::String("client-abc-1".into()));

        assert_eq!(client.strip("client-abc-1"), Some("1"));
        assert_eq!(client.strip("client-abc-req-7"), Some("req-7"));
        assert_eq!(client.strip("client-abcd-1"), None);
        assert_eq!(client.strip("client-xyz-1"), None);
        assert_eq!(client.strip("client-abc"), None);
    }

    #[test]
    fn test_validate_name() {
        // ---
        assert!(validate_name("server_name", "calculator").is_ok());
        assert!(validate_name("server_name", "calc-v2_beta").is_ok());

        for bad in ["", "a.b", "a*", "#", "a b"] {
            let err = validate_name("server_name", bad).unwrap_err();
            assert_eq!(err.field(), Some("server_name"), "input {bad:?}");
        }
    }
}
