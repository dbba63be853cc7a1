//! AMQP 0-9-1 broker using `lapin`.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - The actor declares exchanges, declares and binds queues, starts and
//!   cancels consumers, publishes, and shuts the connection down.
//! - All interaction with the AMQP client is serialized through this actor;
//!   no other task ever touches the connection directly.
//! - Each consumer runs on its own task, turning lapin deliveries into
//!   domain [`Delivery`] values. Settlement goes straight to lapin's acker,
//!   which is safe to use from any task.
//!
//! ## Mapping
//!
//! | domain                  | AMQP 0-9-1                                        |
//! |-------------------------|---------------------------------------------------|
//! | `declare_exchange`      | `exchange.declare` topic, durable                 |
//! | `QueueSpec::Shared`     | named queue, durable                              |
//! | `QueueSpec::Private`    | named queue, exclusive, auto-delete, non-durable  |
//! | `QueueSpec::Anonymous`  | server-named queue, exclusive, auto-delete        |
//! | envelope headers        | message headers (long strings)                    |
//! | `PublishOptions`        | delivery mode 2 (persistent) or 1                 |
//! | `reject`                | `basic.reject` with `requeue = false`             |

use std::collections::HashMap;
use std::sync::Arc;

use lapin::{
    //
    acker::Acker,
    message::Delivery as AmqpDelivery,
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicRejectOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind,
};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    Broker,
    BrokerConfig,
    BrokerConnector,
    BrokerPtr,
    Delivery,
    Envelope,
    Headers,
    PublishOptions,
    QueueSpec,
    Result,
    Settle,
    SubscribeSpec,
    SubscriptionHandle,
    SubscriptionId,
    TransportError,
};

const CONTENT_TYPE_JSON: &str = "application/json";

//
// Actor commands
//

enum Cmd {
    //
    DeclareExchange {
        exchange: String,
        resp: oneshot::Sender<Result<()>>,
    },
    Subscribe {
        spec: SubscribeSpec,
        resp: oneshot::Sender<Result<SubscriptionHandle>>,
    },
    Unsubscribe {
        id: SubscriptionId,
        resp: oneshot::Sender<Result<()>>,
    },
    Publish {
        exchange: String,
        envelope: Envelope,
        options: PublishOptions,
        resp: oneshot::Sender<Result<()>>,
    },
    Close {
        resp: oneshot::Sender<Result<()>>,
    },
}

/// Opens AMQP 0-9-1 connections.
pub(crate) struct Amqp091Connector;

#[async_trait::async_trait]
impl BrokerConnector for Amqp091Connector {
    // ---
    fn protocol(&self) -> &'static str {
        "amqp091"
    }

    async fn connect(&self, config: &BrokerConfig, connection_id: &str) -> Result<BrokerPtr> {
        // ---
        let (connection, channel) = create_amqp_connection(config, connection_id).await?;
        Ok(Amqp091Broker::create(connection_id, connection, channel))
    }
}

/// AMQP 0-9-1 broker connection.
struct Amqp091Broker {
    // ---
    broker_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
}

impl Amqp091Broker {
    /// Spawn the actor owning `connection` and `channel`.
    fn create(broker_id: &str, connection: Connection, channel: Channel) -> BrokerPtr {
        // ---
        let broker_id = broker_id.to_string();
        let (cmd_tx, cmd_rx) = mpsc::channel(16);

        let actor = Actor {
            broker_id: broker_id.clone(),
            connection,
            channel,
            cmd_rx,
            consumers: HashMap::new(),
            next_consumer: 0,
        };

        tokio::spawn(actor.run());

        Arc::new(Self { broker_id, cmd_tx })
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<Result<T>>) -> Cmd) -> Result<T> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| TransportError::Closed)?;

        rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait::async_trait]
impl Broker for Amqp091Broker {
    // ---
    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let exchange = exchange.to_string();
        self.call(|resp| Cmd::DeclareExchange { exchange, resp }).await
    }

    async fn subscribe(&self, spec: SubscribeSpec) -> Result<SubscriptionHandle> {
        self.call(|resp| Cmd::Subscribe { spec, resp }).await
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        // ---
        let id = id.clone();
        match self.call(|resp| Cmd::Unsubscribe { id, resp }).await {
            Err(TransportError::Closed) => Ok(()),
            other => other,
        }
    }

    async fn publish(&self, exchange: &str, envelope: Envelope, options: PublishOptions) -> Result<()> {
        // ---
        let exchange = exchange.to_string();
        self.call(|resp| Cmd::Publish {
            exchange,
            envelope,
            options,
            resp,
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        // ---
        match self.call(|resp| Cmd::Close { resp }).await {
            Err(TransportError::Closed) => Ok(()),
            other => other,
        }
    }
}

struct ConsumerEntry {
    // ---
    tag: String,
    task: JoinHandle<()>,
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    broker_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumers: HashMap<SubscriptionId, ConsumerEntry>,
    next_consumer: u64,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_debug!("[{}] amqp091 actor started", self.broker_id);

        let mut close_resp = None;

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Cmd::DeclareExchange { exchange, resp } => {
                    let _ = resp.send(self.do_declare_exchange(&exchange).await);
                }
                Cmd::Subscribe { spec, resp } => {
                    let _ = resp.send(self.do_subscribe(spec).await);
                }
                Cmd::Unsubscribe { id, resp } => {
                    let _ = resp.send(self.do_unsubscribe(&id).await);
                }
                Cmd::Publish {
                    exchange,
                    envelope,
                    options,
                    resp,
                } => {
                    let _ = resp.send(self.do_publish(&exchange, envelope, options).await);
                }
                Cmd::Close { resp } => {
                    close_resp = Some(resp);
                    break;
                }
            }
        }

        self.cmd_rx.close();
        let result = self.shutdown().await;

        if let Some(resp) = close_resp {
            let _ = resp.send(result);
        }

        log_debug!("[{}] amqp091 actor stopped", self.broker_id);
    }

    async fn shutdown(&mut self) -> Result<()> {
        // ---
        let ids: Vec<SubscriptionId> = self.consumers.keys().cloned().collect();
        for id in ids {
            let _ = self.do_unsubscribe(&id).await;
        }

        let channel = self.channel.close(200, "Normal shutdown".into()).await;
        let connection = self.connection.close(200, "Normal shutdown".into()).await;

        log_info!("[{}] amqp091 connection closed", self.broker_id);

        channel
            .and(connection)
            .map_err(|e| TransportError::connection("amqp091: close failed", e))
    }

    async fn do_declare_exchange(&mut self, exchange: &str) -> Result<()> {
        // ---
        let options = ExchangeDeclareOptions {
            durable: true,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(exchange.into(), ExchangeKind::Topic, options, FieldTable::default())
            .await
            .map_err(|e| TransportError::connection(format!("amqp091: declare exchange '{exchange}' failed"), e))?;

        log_debug!("[{}] declared topic exchange {exchange}", self.broker_id);
        Ok(())
    }

    async fn do_subscribe(&mut self, spec: SubscribeSpec) -> Result<SubscriptionHandle> {
        // ---
        let (name, options) = match &spec.queue {
            QueueSpec::Shared(name) => (
                name.as_str(),
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
            ),
            QueueSpec::Private(name) => (
                name.as_str(),
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
            ),
            QueueSpec::Anonymous => (
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    ..QueueDeclareOptions::default()
                },
            ),
        };

        let queue = self
            .channel
            .queue_declare(name.into(), options, FieldTable::default())
            .await
            .map_err(|e| TransportError::connection(format!("amqp091: queue declare '{name}' failed"), e))?;

        let queue_name = queue.name().as_str().to_string();

        self.channel
            .queue_bind(
                queue_name.as_str().into(),
                spec.exchange.as_str().into(),
                spec.binding_key.as_str().into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::connection(format!("amqp091: bind '{queue_name}' failed"), e))?;

        self.next_consumer += 1;
        let tag = format!("{}-consumer-{}", self.broker_id, self.next_consumer);

        let consumer = self
            .channel
            .basic_consume(
                queue_name.as_str().into(),
                tag.as_str().into(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::connection(format!("amqp091: consume '{queue_name}' failed"), e))?;

        log_info!(
            "[{}] consuming {queue_name} ({} <- {})",
            self.broker_id,
            spec.exchange,
            spec.binding_key
        );

        let (tx, inbox) = mpsc::unbounded_channel();
        let label = format!("{}/{queue_name}", self.broker_id);
        let exchange = spec.exchange.clone();

        let task = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(item) = consumer.next().await {
                let forwarded = match item {
                    Ok(delivery) => tx.send(Ok(into_delivery(&exchange, delivery))),
                    Err(e) => {
                        log_error!("[{label}] consumer error: {e}");
                        let _ = tx.send(Err(TransportError::connection("amqp091: consumer failed", e)));
                        break;
                    }
                };
                if forwarded.is_err() {
                    // Inbox dropped; the settle handle went with it and the
                    // broker requeues when the channel closes.
                    break;
                }
            }
            log_debug!("[{label}] consumer task ended");
        });

        let id = SubscriptionId::from(tag.clone());
        self.consumers.insert(id.clone(), ConsumerEntry { tag, task });

        Ok(SubscriptionHandle {
            id,
            source: queue_name,
            inbox,
        })
    }

    async fn do_unsubscribe(&mut self, id: &SubscriptionId) -> Result<()> {
        // ---
        let Some(entry) = self.consumers.remove(id) else {
            return Ok(());
        };

        let result = self
            .channel
            .basic_cancel(entry.tag.as_str().into(), BasicCancelOptions::default())
            .await
            .map_err(|e| TransportError::connection(format!("amqp091: cancel '{}' failed", entry.tag), e));

        // Ends the inbox even if the cancel could not reach the broker.
        entry.task.abort();
        result
    }

    async fn do_publish(&mut self, exchange: &str, envelope: Envelope, options: PublishOptions) -> Result<()> {
        // ---
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE_JSON.into())
            .with_delivery_mode(if options.durable { 2 } else { 1 })
            .with_headers(to_field_table(&envelope.wire_headers()));

        self.channel
            .basic_publish(
                exchange.into(),
                envelope.routing_key.as_str().into(),
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(|e| TransportError::connection("amqp091: publish failed", e))?;

        log_debug!(
            "[{}] published to {exchange}/{}",
            self.broker_id,
            envelope.routing_key
        );
        Ok(())
    }
}

struct LapinSettle {
    acker: Acker,
}

#[async_trait::async_trait]
impl Settle for LapinSettle {
    // ---
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| TransportError::connection("amqp091: ack failed", e))
    }

    async fn reject(&self) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue: false })
            .await
            .map(|_| ())
            .map_err(|e| TransportError::connection("amqp091: reject failed", e))
    }
}

fn into_delivery(exchange: &str, delivery: AmqpDelivery) -> Delivery {
    // ---
    let headers = delivery
        .properties
        .headers()
        .as_ref()
        .map(from_field_table)
        .unwrap_or_default();

    let envelope = Envelope::from_wire(delivery.routing_key.as_str(), delivery.data, headers);

    Delivery::new(
        exchange,
        envelope,
        Box::new(LapinSettle {
            acker: delivery.acker,
        }),
    )
}

fn to_field_table(headers: &Headers) -> FieldTable {
    // ---
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.as_str().into(), AMQPValue::LongString(value.as_str().into()));
    }
    table
}

fn from_field_table(table: &FieldTable) -> Headers {
    // ---
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                other => {
                    log_warn!("amqp091: ignoring non-string header {}: {other:?}", key.as_str());
                    return None;
                }
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

/// Open an AMQP connection and channel for `config`.
async fn create_amqp_connection(config: &BrokerConfig, connection_id: &str) -> Result<(Connection, Channel)> {
    // ---
    log_info!("Connecting to AMQP 0-9-1 broker: {}", config.redacted_uri());

    let properties = ConnectionProperties::default().with_connection_name(connection_id.into());

    let connection = Connection::connect(&config.uri(), properties)
        .await
        .map_err(|e| {
            log_error!("amqp091: connection to {} failed: {e}", config.redacted_uri());
            TransportError::connection("amqp091: connection failed", e)
        })?;

    let channel = connection.create_channel().await.map_err(|e| {
        log_error!("amqp091: channel creation failed: {e}");
        TransportError::connection("amqp091: channel creation failed", e)
    })?;

    log_info!("[{connection_id}] connected to AMQP 0-9-1 broker");

    Ok((connection, channel))
}
