//! Server-side MCP transport.
//!
//! A [`ServerTransport`] consumes the durable request queue shared by every
//! client of its server name. Each request that names a reply routing key is
//! recorded in a [`CorrelationTable`]; `send` looks the reply destination up
//! by id and publishes there, or to the dead-letter routing key when no
//! request is waiting for it.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::domain::Lifecycle;
use crate::transport::runner::{spawn_pump, DeliveryConsumer, Session};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    request_queue_name,
    request_routing_key,
    BrokerPtr,
    ConnectorPtr,
    CorrelationTable,
    Delivery,
    Envelope,
    HandlerPtr,
    JsonRpcMessage,
    McpTransport,
    PublishOptions,
    QueueSpec,
    Result,
    SubscribeSpec,
    TransportError,
    TransportOptions,
    TransportState,
    DEAD_LETTER_ROUTING_KEY,
};

/// MCP transport for the responding side of a session.
///
/// One active instance per server name is assumed: replies are routed from
/// this instance's own correlation table, so a second instance consuming the
/// same request queue can only answer the requests it received itself.
#[derive(Clone)]
pub struct ServerTransport {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    // ---
    options: TransportOptions,
    connector: ConnectorPtr,
    handler: HandlerPtr,
    connection_id: String,
    lifecycle: Lifecycle,
    session: tokio::sync::Mutex<Option<Session>>,
    correlations: Mutex<CorrelationTable>,
}

impl ServerTransport {
    // ---

    pub fn new(options: TransportOptions, connector: ConnectorPtr, handler: HandlerPtr) -> Self {
        // ---
        let connection_id = format!("server-{}-{}", options.server_name, uuid::Uuid::new_v4());

        Self {
            inner: Arc::new(ServerInner {
                options,
                connector,
                handler,
                connection_id,
                lifecycle: Lifecycle::new(),
                session: tokio::sync::Mutex::new(None),
                correlations: Mutex::new(CorrelationTable::new()),
            }),
        }
    }

    /// Number of received requests not yet answered.
    pub fn pending_replies(&self) -> usize {
        self.inner.correlations().len()
    }
}

#[async_trait::async_trait]
impl McpTransport for ServerTransport {
    // ---
    async fn start(&self) -> Result<()> {
        // ---
        let inner = &self.inner;
        inner.lifecycle.begin_start()?;

        if let Err(err) = Arc::clone(inner).open().await {
            log_error!("[{}] start failed: {err}", inner.connection_id);
            inner.lifecycle.mark_errored();
            inner.handler.on_error(&err);
            return Err(err);
        }

        if !inner.lifecycle.mark_ready() {
            return Err(TransportError::Closed);
        }

        log_info!(
            "[{}] serving {} on {}",
            inner.connection_id,
            request_routing_key(&inner.options.server_name),
            inner.options.exchange_name
        );
        Ok(())
    }

    /// Publish a reply (or any other message) toward the client that is
    /// waiting for it.
    ///
    /// The destination is taken out of the correlation table by the
    /// message's id. Messages without an id, and ids no request is waiting
    /// for, go to the dead-letter routing key.
    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        // ---
        let inner = &self.inner;
        inner.lifecycle.require_ready()?;

        let routing_key = match message.id() {
            Some(id) => inner.correlations().take_and_remove(id),
            None => DEAD_LETTER_ROUTING_KEY.to_string(),
        };

        if routing_key == DEAD_LETTER_ROUTING_KEY {
            log_warn!(
                "[{}] no waiting request for id={:?}; publishing to {DEAD_LETTER_ROUTING_KEY}",
                inner.connection_id,
                message.id()
            );
        } else {
            log_debug!("[{}] -> {routing_key} id={:?}", inner.connection_id, message.id());
        }

        let envelope = Envelope::new(routing_key, message.to_bytes()?);

        let broker = inner.broker().await?;
        broker
            .publish(&inner.options.exchange_name, envelope, PublishOptions::PERSISTENT)
            .await
    }

    async fn close(&self) -> Result<()> {
        // ---
        let inner = &self.inner;
        if !inner.lifecycle.begin_close() {
            return Ok(());
        }

        log_info!("[{}] closing server transport", inner.connection_id);

        let result = inner.release().await;
        inner.lifecycle.mark_closed();
        inner.lifecycle.signal_close(inner.handler.as_ref());
        result
    }

    fn state(&self) -> TransportState {
        self.inner.lifecycle.state()
    }
}

impl ServerInner {
    // ---

    fn correlations(&self) -> MutexGuard<'_, CorrelationTable> {
        self.correlations.lock().unwrap_or_else(PoisonError::into_inner)
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

    async fn open(self: Arc<Self>) -> Result<()> {
        // ---
        let broker = self
            .connector
            .connect(&self.options.broker, &self.connection_id)
            .await?;

        let server_name = &self.options.server_name;
        let exchange = &self.options.exchange_name;
        let spec = SubscribeSpec::new(
            exchange.clone(),
            request_routing_key(server_name),
            QueueSpec::Shared(request_queue_name(server_name)),
        );

        let setup = async {
            broker.declare_exchange(exchange).await?;
            broker.subscribe(spec).await
        };

        let handle = match setup.await {
            Ok(handle) => handle,
            Err(err) => {
                let _ = broker.close().await;
                return Err(err);
            }
        };

        let mut session = Session::new(broker);
        session.subscriptions.push(handle.id.clone());

        {
            let mut slot = self.session.lock().await;
            if self.lifecycle.is_closing() {
                drop(slot);
                let _ = session.release().await;
                return Err(TransportError::Closed);
            }
            *slot = Some(session);
        }

        let label = format!("server {}", self.connection_id);
        spawn_pump(label, handle, Arc::clone(&self));
        Ok(())
    }

    /// Forget waiting requests, then give broker resources back.
    async fn release(&self) -> Result<()> {
        // ---
        self.correlations().clear();

        match self.session.lock().await.take() {
            Some(session) => session.release().await,
            None => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl DeliveryConsumer for ServerInner {
    // ---
    async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        // ---
        let message = match JsonRpcMessage::from_slice(&delivery.envelope.body) {
            Ok(message) => message,
            Err(err) => {
                log_warn!("[{}] undecodable request rejected: {err}", self.connection_id);
                self.handler.on_error(&err);
                return delivery.reject().await;
            }
        };

        if let (Some(reply_to), Some(id)) = (&delivery.envelope.reply_to, message.id()) {
            self.correlations().put(id.clone(), reply_to.clone());
        }

        log_debug!(
            "[{}] <- {} id={:?}",
            self.connection_id,
            delivery.envelope.routing_key,
            message.id()
        );

        self.handler.on_message(message);
        delivery.ack().await
    }

    async fn subscription_lost(&self, error: Option<TransportError>) {
        // ---
        if self.lifecycle.is_closing() {
            return;
        }

        let err = error.unwrap_or_else(|| TransportError::connection_msg("request subscription ended unexpectedly"));
        log_error!("[{}] server transport failed: {err}", self.connection_id);

        self.lifecycle.begin_close();
        self.lifecycle.mark_errored();
        self.handler.on_error(&err);

        let _ = self.release().await;
        self.lifecycle.signal_close(self.handler.as_ref());
    }
}
