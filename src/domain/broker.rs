// src/domain/broker.rs

//! Broker domain abstractions.
//!
//! A [`Broker`] is one live connection to a topic-routing message broker.
//! It knows how to declare a topic exchange, subscribe a queue (or link)
//! bound with a routing pattern, publish an [`Envelope`] and settle the
//! deliveries it hands out. It knows nothing about JSON-RPC, client
//! identities or correlation; those live in the client and server layers.
//!
//! The in-memory broker (`MemoryHub`) defines the reference semantics.
//! The AMQP 0-9-1 and AMQP 1.0 brokers approximate them as closely as their
//! wire protocols allow and document where they deviate.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{BrokerConfig, Result, REPLY_TO_HEADER};

/// String metadata carried next to a message body (AMQP 0-9-1 headers,
/// AMQP 1.0 application properties).
pub type Headers = BTreeMap<String, String>;

/// The broker-level unit of transfer.
///
/// The reply-to routing key travels as the `routingKeyToReply` header on the
/// wire; it is kept in its own field here so the transports never have to
/// look it up by name.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Envelope {
    // ---
    /// Routing key the envelope is published under.
    pub routing_key: String,

    /// UTF-8 JSON text.
    pub body: Bytes,

    /// Routing key where replies to this message are expected.
    pub reply_to: Option<String>,

    /// Metadata pairs, forwarded verbatim by intermediaries.
    pub headers: Headers,
}

impl Envelope {
    // ---

    pub fn new(routing_key: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            reply_to: None,
            headers: Headers::new(),
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Rebuild an envelope from what arrived on the wire, lifting the
    /// reply-to header into [`Envelope::reply_to`].
    pub fn from_wire(routing_key: impl Into<String>, body: impl Into<Bytes>, mut headers: Headers) -> Self {
        // ---
        let reply_to = headers.remove(REPLY_TO_HEADER);
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            reply_to,
            headers,
        }
    }

    /// Headers as they go on the wire, reply-to included.
    pub fn wire_headers(&self) -> Headers {
        // ---
        let mut headers = self.headers.clone();
        if let Some(reply_to) = &self.reply_to {
            headers.insert(REPLY_TO_HEADER.to_string(), reply_to.clone());
        }
        headers
    }
}

/// Settlement of one delivery, implemented by each broker.
#[async_trait::async_trait]
pub trait Settle: Send + Sync {
    /// Positive acknowledgment.
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgment without redelivery.
    async fn reject(&self) -> Result<()>;
}

/// One message handed to a subscriber, to be settled exactly once.
///
/// Dropping a delivery without settling it leaves it to the broker
/// (AMQP 0-9-1 requeues it when the channel closes, AMQP 1.0 releases it).
pub struct Delivery {
    // ---
    pub envelope: Envelope,

    /// Exchange the message was consumed from.
    pub exchange: String,

    settle: Box<dyn Settle>,
}

impl Delivery {
    // ---

    pub fn new(exchange: impl Into<String>, envelope: Envelope, settle: Box<dyn Settle>) -> Self {
        Self {
            envelope,
            exchange: exchange.into(),
            settle,
        }
    }

    pub async fn ack(self) -> Result<()> {
        self.settle.ack().await
    }

    pub async fn reject(self) -> Result<()> {
        self.settle.reject().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Which queue a subscription consumes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueSpec {
    // ---
    /// Named, durable, shared by every consumer that declares it.
    Shared(String),

    /// Named, exclusive to this connection, non-durable, auto-deleted.
    Private(String),

    /// Broker-named, exclusive, non-durable, auto-deleted.
    Anonymous,
}

/// A request to receive the messages published on `exchange` whose routing
/// key matches `binding_key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeSpec {
    // ---
    pub exchange: String,

    /// Topic pattern: `*` matches one word, `#` zero or more.
    pub binding_key: String,

    pub queue: QueueSpec,
}

impl SubscribeSpec {
    pub fn new(exchange: impl Into<String>, binding_key: impl Into<String>, queue: QueueSpec) -> Self {
        Self {
            exchange: exchange.into(),
            binding_key: binding_key.into(),
            queue,
        }
    }
}

/// Per-publication delivery options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Ask the broker to persist the message (delivery mode 2).
    pub durable: bool,
}

impl PublishOptions {
    pub const PERSISTENT: Self = Self { durable: true };
    pub const TRANSIENT: Self = Self { durable: false };
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self::PERSISTENT
    }
}

/// Broker-assigned identity of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Arc<str>);

impl<T> From<T> for SubscriptionId
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        SubscriptionId(value.into())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle returned from a successful subscription.
///
/// The inbox yields deliveries until the subscription is cancelled or the
/// connection goes away. A connection failure is reported as one `Err` item
/// before the channel closes; a clean cancel simply closes the channel.
pub struct SubscriptionHandle {
    // ---
    pub id: SubscriptionId,

    /// Name of the queue (or link address) actually consumed from.
    pub source: String,

    pub inbox: mpsc::UnboundedReceiver<Result<Delivery>>,
}

/// One connection to a topic-routing broker.
///
/// Implementations must ensure that:
/// - once `subscribe()` returns, messages published afterwards whose routing
///   key matches the binding are delivered to the returned inbox;
/// - `publish()` does not wait for subscribers;
/// - `close()` is idempotent and ends every inbox of this connection.
///
/// # Notes
///
/// This trait uses `async_trait`; treat its methods as normal `async fn`s.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    // ---

    /// Identifier used in log lines.
    fn broker_id(&self) -> &str;

    /// Ensure a durable topic exchange named `exchange` exists.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    async fn subscribe(&self, spec: SubscribeSpec) -> Result<SubscriptionHandle>;

    /// Cancel a subscription. Its inbox closes without an error item.
    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()>;

    async fn publish(&self, exchange: &str, envelope: Envelope, options: PublishOptions) -> Result<()>;

    /// Release the publish path, then the connection.
    async fn close(&self) -> Result<()>;
}

/// Shared broker pointer.
pub type BrokerPtr = Arc<dyn Broker>;

/// Opens [`Broker`] connections for one wire protocol.
#[async_trait::async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Short protocol name for log lines.
    fn protocol(&self) -> &'static str;

    /// Open a connection. `connection_id` names it in logs and, where the
    /// protocol supports it, on the broker.
    async fn connect(&self, config: &BrokerConfig, connection_id: &str) -> Result<BrokerPtr>;
}

/// Shared connector pointer.
pub type ConnectorPtr = Arc<dyn BrokerConnector>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_reply_to_travels_as_header() {
        // ---
        let mut headers = Headers::new();
        headers.insert("tenant".into(), "acme".into());

        let env = Envelope::new("mcp.calc.request", "{}")
            .with_headers(headers)
            .with_reply_to("from-mcp.calc.client-id.c1");

        let wire = env.wire_headers();
        assert_eq!(
            wire.get(REPLY_TO_HEADER).map(String::as_str),
            Some("from-mcp.calc.client-id.c1")
        );
        assert_eq!(wire.get("tenant").map(String::as_str), Some("acme"));

        let back = Envelope::from_wire(env.routing_key.clone(), env.body.clone(), wire);
        assert_eq!(back, env);
    }

    #[test]
    fn test_no_reply_to_no_header() {
        // ---
        let env = Envelope::new("dlq", "{}");
        assert!(env.wire_headers().is_empty());
        assert_eq!(Envelope::from_wire("dlq", "{}", Headers::new()).reply_to, None);
    }
}
