//! Message interceptor between two exchanges.
//!
//! Clients publish to the client-facing `in_exchange`; servers consume from
//! the server-facing `out_exchange`. The [`Interceptor`] bridges the two and
//! asks an [`InterceptPolicy`] what to do with every message crossing in
//! either direction:
//!
//! ```text
//!             mcp.*.request                    mcp.*.request
//! clients ---> [in_exchange] ---> policy ---> [out_exchange] ---> servers
//!         <---               <---        <---                <---
//!             from-mcp.*.client-id.*           from-mcp.*.client-id.*
//! ```
//!
//! The policy cannot break correlation: forwarded and transformed messages
//! keep their routing key and headers, and a rejection is published to the
//! reply-to routing key the sender is already listening on.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_lite::FutureExt;

use crate::domain::Lifecycle;
use crate::transport::runner::{spawn_pump, DeliveryConsumer, Session};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    BrokerPtr,
    ConnectorPtr,
    Delivery,
    Envelope,
    Headers,
    InterceptorOptions,
    JsonRpcMessage,
    PublishOptions,
    QueueSpec,
    Result,
    SubscribeSpec,
    TransportError,
    TransportState,
    ALL_REPLIES_PATTERN,
    ALL_REQUESTS_PATTERN,
};

/// JSON-RPC error code used by [`InterceptorDecision::reject_with_error`]
/// when the caller does not pick one.
const POLICY_REJECTED_CODE: i64 = -32001;

/// Direction a message is travelling in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

/// What the interceptor does with one message.
#[derive(Debug, Clone, PartialEq)]
pub enum InterceptorDecision {
    /// Republish the original bytes unchanged.
    Forward,

    /// Republish this message instead of the original, same routing key and
    /// headers.
    Transform(JsonRpcMessage),

    /// Answer the sender with this message and do not forward the original.
    Reject(JsonRpcMessage),

    /// Consume and discard.
    Drop,

    /// The policy failed; the message is forwarded.
    Error(String),
}

impl InterceptorDecision {
    /// Reject `message` with a JSON-RPC error response carrying its id.
    pub fn reject_with_error(message: &JsonRpcMessage, reason: impl Into<String>) -> Self {
        Self::Reject(JsonRpcMessage::error(
            message.id().cloned(),
            POLICY_REJECTED_CODE,
            reason,
        ))
    }
}

/// Strategy deciding the fate of every intercepted message.
///
/// `headers` are the message's wire headers, `routingKeyToReply` included.
/// Returning an error (or panicking) is logged and treated as
/// [`InterceptorDecision::Forward`].
#[async_trait::async_trait]
pub trait InterceptPolicy: Send + Sync {
    async fn on_client_to_server(&self, message: &JsonRpcMessage, headers: &Headers) -> Result<InterceptorDecision>;

    async fn on_server_to_client(&self, message: &JsonRpcMessage, headers: &Headers) -> Result<InterceptorDecision>;
}

/// Policy that forwards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughPolicy;

#[async_trait::async_trait]
impl InterceptPolicy for PassthroughPolicy {
    // ---
    async fn on_client_to_server(&self, _message: &JsonRpcMessage, _headers: &Headers) -> Result<InterceptorDecision> {
        Ok(InterceptorDecision::Forward)
    }

    async fn on_server_to_client(&self, _message: &JsonRpcMessage, _headers: &Headers) -> Result<InterceptorDecision> {
        Ok(InterceptorDecision::Forward)
    }
}

/// Bridges `in_exchange` and `out_exchange` through an [`InterceptPolicy`].
#[derive(Clone)]
pub struct Interceptor {
    inner: Arc<InterceptorInner>,
}

struct InterceptorInner {
    // ---
    options: InterceptorOptions,
    connector: ConnectorPtr,
    policy: Arc<dyn InterceptPolicy>,
    connection_id: String,
    lifecycle: Lifecycle,
    session: tokio::sync::Mutex<Option<Session>>,
}

impl Interceptor {
    // ---

    pub fn new(options: InterceptorOptions, connector: ConnectorPtr, policy: Arc<dyn InterceptPolicy>) -> Self {
        // ---
        let connection_id = format!("interceptor-{}", uuid::Uuid::new_v4());

        Self {
            inner: Arc::new(InterceptorInner {
                options,
                connector,
                policy,
                connection_id,
                lifecycle: Lifecycle::new(),
                session: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Connect, declare both exchanges and start consuming both directions.
    pub async fn start(&self) -> Result<()> {
        // ---
        let inner = &self.inner;
        inner.lifecycle.begin_start()?;

        if let Err(err) = Arc::clone(inner).open().await {
            log_error!("[{}] start failed: {err}", inner.connection_id);
            inner.lifecycle.mark_errored();
            return Err(err);
        }

        if !inner.lifecycle.mark_ready() {
            return Err(TransportError::Closed);
        }

        log_info!(
            "[{}] intercepting {} <-> {}",
            inner.connection_id,
            inner.options.in_exchange,
            inner.options.out_exchange
        );
        Ok(())
    }

    /// Stop consuming and release the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        // ---
        let inner = &self.inner;
        if !inner.lifecycle.begin_close() {
            return Ok(());
        }

        log_info!("[{}] closing interceptor", inner.connection_id);

        let result = inner.release().await;
        inner.lifecycle.mark_closed();
        result
    }

    pub fn state(&self) -> TransportState {
        self.inner.lifecycle.state()
    }
}

impl InterceptorInner {
    // ---

    async fn open(self: Arc<Self>) -> Result<()> {
        // ---
        let broker = self
            .connector
            .connect(&self.options.broker, &self.connection_id)
            .await?;

        let (requests, replies) = match self.subscribe_both(&broker).await {
            Ok(handles) => handles,
            Err(err) => {
                let _ = broker.close().await;
                return Err(err);
            }
        };

        let mut session = Session::new(broker);
        session.subscriptions.push(requests.id.clone());
        session.subscriptions.push(replies.id.clone());

        {
            let mut slot = self.session.lock().await;
            if self.lifecycle.is_closing() {
                drop(slot);
                let _ = session.release().await;
                return Err(TransportError::Closed);
            }
            *slot = Some(session);
        }

        for (handle, direction) in [
            (requests, Direction::ClientToServer),
            (replies, Direction::ServerToClient),
        ] {
            let label = format!("{} {direction:?}", self.connection_id);
            let pump = DirectionPump {
                inner: Arc::clone(&self),
                direction,
            };
            spawn_pump(label, handle, Arc::new(pump));
        }

        Ok(())
    }

    async fn subscribe_both(&self, broker: &BrokerPtr) -> Result<(crate::SubscriptionHandle, crate::SubscriptionHandle)> {
        // ---
        let in_exchange = &self.options.in_exchange;
        let out_exchange = &self.options.out_exchange;

        broker.declare_exchange(in_exchange).await?;
        broker.declare_exchange(out_exchange).await?;

        let requests = broker
            .subscribe(SubscribeSpec::new(
                in_exchange.clone(),
                ALL_REQUESTS_PATTERN,
                QueueSpec::Anonymous,
            ))
            .await?;

        let replies = broker
            .subscribe(SubscribeSpec::new(
                out_exchange.clone(),
                ALL_REPLIES_PATTERN,
                QueueSpec::Anonymous,
            ))
            .await?;

        Ok((requests, replies))
    }

    async fn release(&self) -> Result<()> {
        // ---
        let session = self.session.lock().await.take();
        match session {
            Some(session) => session.release().await,
            None => Ok(()),
        }
    }

    async fn broker(&self) -> Result<BrokerPtr> {
        // ---
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| Arc::clone(&s.broker))
            .ok_or(TransportError::Closed)
    }

    /// Exchange a message travelling in `direction` is forwarded to.
    fn target(&self, direction: Direction) -> &str {
        match direction {
            Direction::ClientToServer => &self.options.out_exchange,
            Direction::ServerToClient => &self.options.in_exchange,
        }
    }

    /// Ask the policy, turning errors and panics into
    /// [`InterceptorDecision::Error`].
    async fn decide(&self, direction: Direction, message: &JsonRpcMessage, headers: &Headers) -> InterceptorDecision {
        // ---
        let verdict = match direction {
            Direction::ClientToServer => self.policy.on_client_to_server(message, headers),
            Direction::ServerToClient => self.policy.on_server_to_client(message, headers),
        };

        match AssertUnwindSafe(verdict).catch_unwind().await {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => InterceptorDecision::Error(err.to_string()),
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "policy panicked".to_string());
                InterceptorDecision::Error(reason)
            }
        }
    }

    /// Carry out `decision` for `delivery`.
    async fn act(&self, direction: Direction, delivery: &Delivery, decision: InterceptorDecision) -> Result<()> {
        // ---
        let original = &delivery.envelope;
        let target = self.target(direction);

        match decision {
            InterceptorDecision::Forward => self.publish(target, original.clone()).await,

            InterceptorDecision::Transform(message) => {
                let envelope = Envelope {
                    body: message.to_bytes()?,
                    ..original.clone()
                };
                self.publish(target, envelope).await
            }

            InterceptorDecision::Reject(message) => match &original.reply_to {
                Some(reply_to) => {
                    log_debug!(
                        "[{}] rejecting {} back to {reply_to}",
                        self.connection_id,
                        original.routing_key
                    );
                    let envelope = Envelope::new(reply_to.clone(), message.to_bytes()?);
                    self.publish(&delivery.exchange, envelope).await
                }
                None => {
                    log_warn!(
                        "[{}] rejected {} carries no reply-to; nothing sent back",
                        self.connection_id,
                        original.routing_key
                    );
                    Ok(())
                }
            },

            InterceptorDecision::Drop => {
                log_debug!("[{}] dropped {}", self.connection_id, original.routing_key);
                Ok(())
            }

            InterceptorDecision::Error(reason) => {
                log_warn!(
                    "[{}] policy failed on {} ({reason}); forwarding",
                    self.connection_id,
                    original.routing_key
                );
                self.publish(target, original.clone()).await
            }
        }
    }

    async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<()> {
        // ---
        let broker = self.broker().await?;
        broker.publish(exchange, envelope, PublishOptions::PERSISTENT).await
    }

    async fn lost(&self, direction: Direction, error: Option<TransportError>) {
        // ---
        if self.lifecycle.is_closing() {
            return;
        }

        let err = error.unwrap_or_else(|| TransportError::connection_msg("subscription ended unexpectedly"));
        log_error!("[{}] {direction:?} subscription failed: {err}", self.connection_id);

        self.lifecycle.begin_close();
        self.lifecycle.mark_errored();
        let _ = self.release().await;
    }
}

struct DirectionPump {
    inner: Arc<InterceptorInner>,
    direction: Direction,
}

#[async_trait::async_trait]
impl DeliveryConsumer for DirectionPump {
    // ---
    async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        // ---
        let inner = &self.inner;

        let message = match JsonRpcMessage::from_slice(&delivery.envelope.body) {
            Ok(message) => message,
            Err(err) => {
                log_warn!(
                    "[{}] undecodable {} rejected: {err}",
                    inner.connection_id,
                    delivery.envelope.routing_key
                );
                return delivery.reject().await;
            }
        };

        let headers = delivery.envelope.wire_headers();
        let decision = inner.decide(self.direction, &message, &headers).await;

        match inner.act(self.direction, &delivery, decision).await {
            Ok(()) => delivery.ack().await,
            Err(err) => {
                log_error!(
                    "[{}] could not act on {}: {err}",
                    inner.connection_id,
                    delivery.envelope.routing_key
                );
                delivery.reject().await?;
                Err(err)
            }
        }
    }

    async fn subscription_lost(&self, error: Option<TransportError>) {
        self.inner.lost(self.direction, error).await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use serde_json::json;

    struct Failing;

    #[async_trait::async_trait]
    impl InterceptPolicy for Failing {
        async fn on_client_to_server(&self, _m: &JsonRpcMessage, _h: &Headers) -> Result<InterceptorDecision> {
            Err(TransportError::message_msg("policy backend down"))
        }

        async fn on_server_to_client(&self, _m: &JsonRpcMessage, _h: &Headers) -> Result<InterceptorDecision> {
            panic!("boom");
        }
    }

    fn inner(policy: Arc<dyn InterceptPolicy>) -> Arc<InterceptorInner> {
        // ---
        let broker = crate::BrokerConfig::builder()
            .hostname("h")
            .username("u")
            .password("p")
            .without_env()
            .build()
            .unwrap();
        let options = InterceptorOptions::new(broker, "in", "out").unwrap();
        let connector = Arc::new(crate::MemoryConnector::new(crate::MemoryHub::new()));

        Interceptor::new(options, connector, policy).inner
    }

    #[tokio::test]
    async fn test_policy_failures_become_error_decisions() {
        // ---
        let inner = inner(Arc::new(Failing));
        let msg = JsonRpcMessage::request(1, "tools/call", json!({}));
        let headers = Headers::new();

        let d = inner.decide(Direction::ClientToServer, &msg, &headers).await;
        assert_eq!(d, InterceptorDecision::Error("message error: policy backend down".into()));

        let d = inner.decide(Direction::ServerToClient, &msg, &headers).await;
        assert_eq!(d, InterceptorDecision::Error("boom".into()));
    }

    #[tokio::test]
    async fn test_passthrough() {
        // ---
        let inner = inner(Arc::new(PassthroughPolicy));
        let msg = JsonRpcMessage::notification("ping", None);

        let d = inner.decide(Direction::ClientToServer, &msg, &Headers::new()).await;
        assert_eq!(d, InterceptorDecision::Forward);
    }

    #[test]
    fn test_reject_with_error_keeps_id() {
        // ---
        let msg = JsonRpcMessage::request("client-abc-1", "tools/call", json!({}));
        let InterceptorDecision::Reject(reply) = InterceptorDecision::reject_with_error(&msg, "denied") else {
            panic!("expected a rejection");
        };

        assert!(reply.is_response());
        assert_eq!(reply.id(), msg.id());
    }

    #[test]
    fn test_targets() {
        // ---
        let inner = inner(Arc::new(PassthroughPolicy));
        assert_eq!(inner.target(Direction::ClientToServer), "out");
        assert_eq!(inner.target(Direction::ServerToClient), "in");
    }
}
