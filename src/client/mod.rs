//! Client-side MCP transport.
//!
//! A [`ClientTransport`] publishes every outbound message to the server's
//! shared request routing key and consumes replies from a private queue
//! bound to a routing key derived from its own [`ClientId`]. Request ids are
//! prefixed with the client id on the way out so that replies can be
//! demultiplexed across clients, and restored before they reach the handler.

mod pending;

use std::sync::{Arc, Mutex, PoisonError};

use pending::IdRestorer;

use crate::domain::Lifecycle;
use crate::transport::runner::{spawn_pump, DeliveryConsumer, Session};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    reply_queue_name,
    reply_routing_key,
    request_routing_key,
    BrokerPtr,
    ClientId,
    ConnectorPtr,
    Delivery,
    Envelope,
    HandlerPtr,
    JsonRpcMessage,
    McpTransport,
    PublishOptions,
    QueueSpec,
    RequestId,
    Result,
    SubscribeSpec,
    TransportError,
    TransportOptions,
    TransportState,
    CLIENT_ID_HEADER,
};

/// MCP transport for the initiating side of a session.
///
/// Cheap to clone; clones share one connection.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use mcp_amqp_bridge::{
///     create_amqp091_connector, BrokerConfig, ClientTransport, JsonRpcMessage,
///     McpTransport, TransportHandler, TransportOptions,
/// };
///
/// struct Print;
///
/// impl TransportHandler for Print {
///     fn on_message(&self, message: JsonRpcMessage) {
///         println!("{message:?}");
///     }
/// }
///
/// # async fn example() -> mcp_amqp_bridge::Result<()> {
/// let broker = BrokerConfig::builder().build()?;
/// let options = TransportOptions::new(broker, "calculator", "mcp")?;
///
/// let client = ClientTransport::new(options, create_amqp091_connector()?, Arc::new(Print));
/// client.start().await?;
/// client
///     .send(JsonRpcMessage::request(1, "tools/list", serde_json::json!({})))
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ClientTransport {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    // ---
    options: TransportOptions,
    connector: ConnectorPtr,
    handler: HandlerPtr,
    client_id: ClientId,
    reply_to: String,
    lifecycle: Lifecycle,
    session: tokio::sync::Mutex<Option<Session>>,
    ids: Mutex<IdRestorer>,
    idle: tokio::sync::Notify,
}

impl ClientTransport {
    // ---

    /// Create a client transport with a freshly generated identity.
    pub fn new(options: TransportOptions, connector: ConnectorPtr, handler: HandlerPtr) -> Self {
        Self::with_client_id(options, connector, handler, ClientId::generate())
    }

    /// Create a client transport with a caller-chosen identity.
    ///
    /// The identity must be unique among live clients and must be a single
    /// routing-key word.
    pub fn with_client_id(
        options: TransportOptions,
        connector: ConnectorPtr,
        handler: HandlerPtr,
        client_id: ClientId,
    ) -> Self {
        // ---
        let reply_to = reply_routing_key(&options.server_name, &client_id);

        Self {
            inner: Arc::new(ClientInner {
                options,
                connector,
                handler,
                client_id,
                reply_to,
                lifecycle: Lifecycle::new(),
                session: tokio::sync::Mutex::new(None),
                ids: Mutex::new(IdRestorer::new()),
                idle: tokio::sync::Notify::new(),
            }),
        }
    }

    pub fn client_id(&self) -> &ClientId {
        &self.inner.client_id
    }

    /// Routing key this client's replies are published to.
    pub fn reply_routing_key(&self) -> &str {
        &self.inner.reply_to
    }

    /// Number of sent requests still waiting for a response.
    ///
    /// An entry lives until its response arrives or the transport closes
    /// (which includes failing). A server that never answers keeps its
    /// entries for the lifetime of the transport.
    pub fn pending_requests(&self) -> usize {
        self.inner.ids().len()
    }

    /// Resolve once no sent request is waiting for a response.
    ///
    /// Also resolves when the transport closes, since closing forgets
    /// outstanding requests.
    pub async fn drained(&self) {
        // ---
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.ids().len() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait::async_trait]
impl McpTransport for ClientTransport {
    // ---
    async fn start(&self) -> Result<()> {
        // ---
        let inner = &self.inner;
        inner.lifecycle.begin_start()?;

        if let Err(err) = Arc::clone(inner).open().await {
            log_error!("[{}] start failed: {err}", inner.client_id);
            inner.lifecycle.mark_errored();
            inner.handler.on_error(&err);
            return Err(err);
        }

        if !inner.lifecycle.mark_ready() {
            return Err(TransportError::Closed);
        }

        log_info!(
            "[{}] client ready on {} (replies via {})",
            inner.client_id,
            inner.options.exchange_name,
            inner.reply_to
        );
        Ok(())
    }

    async fn send(&self, message: JsonRpcMessage) -> Result<()> {
        // ---
        let inner = &self.inner;
        inner.lifecycle.require_ready()?;

        let mut message = message;
        if let Some(id) = message.id().cloned() {
            let wire_id = inner.client_id.augment(&id);
            if message.is_request() {
                inner.ids().register(&wire_id, id);
            }
            message.replace_id(wire_id);
        }

        let mut headers = inner.options.metadata.clone();
        headers.insert(CLIENT_ID_HEADER.to_string(), inner.client_id.to_string());

        let envelope = Envelope::new(
            request_routing_key(&inner.options.server_name),
            message.to_bytes()?,
        )
        .with_headers(headers)
        .with_reply_to(inner.reply_to.clone());

        log_debug!(
            "[{}] -> {} id={:?}",
            inner.client_id,
            envelope.routing_key,
            message.id()
        );

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

        log_info!("[{}] closing client transport", inner.client_id);

        let result = inner.release().await;
        inner.lifecycle.mark_closed();
        inner.lifecycle.signal_close(inner.handler.as_ref());
        result
    }

    fn state(&self) -> TransportState {
        self.inner.lifecycle.state()
    }
}

impl ClientInner {
    // ---

    fn ids(&self) -> std::sync::MutexGuard<'_, IdRestorer> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
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

    /// Connect, declare the exchange and start consuming replies.
    async fn open(self: Arc<Self>) -> Result<()> {
        // ---
        let broker = self
            .connector
            .connect(&self.options.broker, self.client_id.as_str())
            .await?;

        let exchange = &self.options.exchange_name;
        let spec = SubscribeSpec::new(
            exchange.clone(),
            self.reply_to.clone(),
            QueueSpec::Private(reply_queue_name(&self.options.server_name, &self.client_id)),
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

        let label = format!("client {}", self.client_id);
        spawn_pump(label, handle, Arc::clone(&self));
        Ok(())
    }

    /// Give broker resources back and forget outstanding requests.
    async fn release(&self) -> Result<()> {
        // ---
        let session = self.session.lock().await.take();
        self.ids().clear();
        self.idle.notify_waiters();

        match session {
            Some(session) => session.release().await,
            None => Ok(()),
        }
    }

    /// Put the application's id back on a response; returns the wire id it
    /// arrived with.
    fn restore_id(&self, message: &mut JsonRpcMessage) -> Option<RequestId> {
        // ---
        let wire_id = message.id().cloned()?;

        if let Some(original) = self.ids().restore(&self.client_id, &wire_id) {
            message.replace_id(original);
        }
        Some(wire_id)
    }
}

#[async_trait::async_trait]
impl DeliveryConsumer for ClientInner {
    // ---
    async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        // ---
        match JsonRpcMessage::from_slice(&delivery.envelope.body) {
            Ok(mut message) => {
                let wire_id = self.restore_id(&mut message);
                self.handler.on_message(message);

                // Forget only after the handler has the response, so that
                // `drained` never resolves ahead of it.
                if let Some(wire_id) = wire_id {
                    if self.ids().forget(&wire_id) == 0 {
                        self.idle.notify_waiters();
                    }
                }
                delivery.ack().await
            }
            Err(err) => {
                log_warn!("[{}] undecodable reply rejected: {err}", self.client_id);
                self.handler.on_error(&err);
                delivery.reject().await
            }
        }
    }

    async fn subscription_lost(&self, error: Option<TransportError>) {
        // ---
        if self.lifecycle.is_closing() {
            return;
        }

        let err = error.unwrap_or_else(|| TransportError::connection_msg("reply subscription ended unexpectedly"));
        log_error!("[{}] client transport failed: {err}", self.client_id);

        self.lifecycle.begin_close();
        self.lifecycle.mark_errored();
        self.handler.on_error(&err);

        let _ = self.release().await;
        self.lifecycle.signal_close(self.handler.as_ref());
    }
}
