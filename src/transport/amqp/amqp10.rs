//! AMQP 1.0 broker using `fe2o3-amqp`.
//!
//! AMQP 1.0 has no exchanges, queues or bindings on the wire. Routing is
//! expressed through link addresses instead: a publication to routing key
//! `k` on exchange `x` is a transfer on a sender link attached to
//! `exchange.x.k`, and a subscription attaches a receiver link to
//! `exchange.x.<binding-key>`. Whether wildcards in a receiver address are
//! honoured is up to the broker's address mapping.
//!
//! This realization keeps the routing-key grammar, id augmentation and
//! correlation policy of the AMQP 0-9-1 one, but the two do not interoperate
//! on one physical broker.
//!
//! ## Concurrency model
//!
//! Like the AMQP 0-9-1 broker, one **actor task** owns the connection and
//! the session, attaches links and publishes. Each receiver link is moved
//! onto its own task which hands deliveries to the inbox one at a time and
//! applies the disposition the subscriber chooses (accept, reject, or
//! release when the delivery is dropped unsettled).
//!
//! ## Mapping
//!
//! | domain               | AMQP 1.0                                     |
//! |----------------------|----------------------------------------------|
//! | envelope body        | `amqp-value` string (data sections accepted) |
//! | routing key          | `properties.subject`                         |
//! | envelope headers     | application properties                       |
//! | `PublishOptions`     | `header.durable`                             |
//! | `declare_exchange`   | no-op; the address names the exchange        |

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

use fe2o3_amqp::{
    //
    connection::ConnectionHandle,
    session::SessionHandle,
    types::{
        messaging::{ApplicationProperties, Body, Header, Message, Outcome, Properties},
        primitives::{SimpleValue, Symbol, Value},
    },
    Connection,
    Receiver,
    Sender,
    Session,
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    //
    link_address,
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
    Result,
    Settle,
    SubscribeSpec,
    SubscriptionHandle,
    SubscriptionId,
    TransportError,
};

/// Sender links kept open for reuse.
const MAX_CACHED_SENDERS: usize = 32;

const CONTENT_TYPE_JSON: &str = "application/json";

enum Cmd {
    //
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

/// Opens AMQP 1.0 connections.
pub(crate) struct Amqp10Connector;

#[async_trait::async_trait]
impl BrokerConnector for Amqp10Connector {
    // ---
    fn protocol(&self) -> &'static str {
        "amqp10"
    }

    async fn connect(&self, config: &BrokerConfig, connection_id: &str) -> Result<BrokerPtr> {
        // ---
        log_info!("Connecting to AMQP 1.0 broker: {}", config.redacted_uri());

        let mut connection = Connection::open(connection_id.to_string(), config.uri().as_str())
            .await
            .map_err(|e| {
                log_error!("amqp10: connection to {} failed: {e}", config.redacted_uri());
                TransportError::connection("amqp10: connection failed", e)
            })?;

        let session = Session::begin(&mut connection)
            .await
            .map_err(|e| TransportError::connection("amqp10: session begin failed", e))?;

        log_info!("[{connection_id}] connected to AMQP 1.0 broker");

        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        let actor = Actor {
            broker_id: connection_id.to_string(),
            connection,
            session,
            cmd_rx,
            senders: HashMap::new(),
            sender_order: VecDeque::new(),
            receivers: HashMap::new(),
            next_link: 0,
        };
        tokio::spawn(actor.run());

        Ok(Arc::new(Amqp10Broker {
            broker_id: connection_id.to_string(),
            cmd_tx,
        }))
    }
}

struct Amqp10Broker {
    // ---
    broker_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
}

impl Amqp10Broker {
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
impl Broker for Amqp10Broker {
    // ---
    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        log_debug!("[{}] amqp10: exchange {exchange} is addressed, not declared", self.broker_id);
        Ok(())
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

struct ReceiverEntry {
    // ---
    stop: oneshot::Sender<()>,
    done: oneshot::Receiver<()>,
}

struct Actor {
    // ---
    broker_id: String,
    connection: ConnectionHandle<()>,
    session: SessionHandle<()>,
    cmd_rx: mpsc::Receiver<Cmd>,
    senders: HashMap<String, Sender>,
    sender_order: VecDeque<String>,
    receivers: HashMap<SubscriptionId, ReceiverEntry>,
    next_link: u64,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_debug!("[{}] amqp10 actor started", self.broker_id);

        let mut close_resp = None;

        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
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

        log_debug!("[{}] amqp10 actor stopped", self.broker_id);
    }

    fn link_name(&mut self, kind: &str) -> String {
        self.next_link += 1;
        format!("{}-{kind}-{}", self.broker_id, self.next_link)
    }

    async fn shutdown(&mut self) -> Result<()> {
        // ---
        let ids: Vec<SubscriptionId> = self.receivers.keys().cloned().collect();
        for id in ids {
            let _ = self.do_unsubscribe(&id).await;
        }

        for (address, sender) in self.senders.drain() {
            if let Err(e) = sender.close().await {
                log_debug!("[{}] closing sender {address}: {e}", self.broker_id);
            }
        }
        self.sender_order.clear();

        let session = self.session.end().await;
        let connection = self.connection.close().await;

        log_info!("[{}] amqp10 connection closed", self.broker_id);

        session.map_err(|e| TransportError::connection("amqp10: session end failed", e))?;
        connection.map_err(|e| TransportError::connection("amqp10: connection close failed", e))
    }

    async fn do_subscribe(&mut self, spec: SubscribeSpec) -> Result<SubscriptionHandle> {
        // ---
        let address = link_address(&spec.exchange, &spec.binding_key);
        let name = self.link_name("receiver");

        let receiver = Receiver::attach(&mut self.session, name.clone(), address.clone())
            .await
            .map_err(|e| TransportError::connection(format!("amqp10: attach receiver to '{address}' failed"), e))?;

        log_info!("[{}] receiving from {address}", self.broker_id);

        let (tx, inbox) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let link = ReceiverLink {
            label: name.clone(),
            exchange: spec.exchange,
            binding_key: spec.binding_key,
            receiver,
            tx,
        };
        tokio::spawn(async move {
            link.run(stop_rx).await;
            let _ = done_tx.send(());
        });

        let id = SubscriptionId::from(name);
        self.receivers.insert(
            id.clone(),
            ReceiverEntry {
                stop: stop_tx,
                done: done_rx,
            },
        );

        Ok(SubscriptionHandle {
            id,
            source: address,
            inbox,
        })
    }

    async fn do_unsubscribe(&mut self, id: &SubscriptionId) -> Result<()> {
        // ---
        let Some(entry) = self.receivers.remove(id) else {
            return Ok(());
        };

        let _ = entry.stop.send(());
        let _ = entry.done.await;
        Ok(())
    }

    async fn sender_for(&mut self, address: &str) -> Result<&mut Sender> {
        // ---
        if !self.senders.contains_key(address) {
            if self.senders.len() >= MAX_CACHED_SENDERS {
                if let Some(oldest) = self.sender_order.pop_front() {
                    if let Some(sender) = self.senders.remove(&oldest) {
                        let _ = sender.close().await;
                    }
                }
            }

            let name = self.link_name("sender");
            let sender = Sender::attach(&mut self.session, name, address.to_string())
                .await
                .map_err(|e| TransportError::connection(format!("amqp10: attach sender to '{address}' failed"), e))?;

            self.senders.insert(address.to_string(), sender);
            self.sender_order.push_back(address.to_string());
        }

        self.senders
            .get_mut(address)
            .ok_or_else(|| TransportError::connection_msg(format!("amqp10: no sender for '{address}'")))
    }

    async fn do_publish(&mut self, exchange: &str, envelope: Envelope, options: PublishOptions) -> Result<()> {
        // ---
        let address = link_address(exchange, &envelope.routing_key);
        let body = String::from_utf8(envelope.body.to_vec())
            .map_err(|e| TransportError::message("amqp10: body is not UTF-8", e))?;

        let mut properties = ApplicationProperties::builder();
        for (key, value) in envelope.wire_headers() {
            properties = properties.insert(key, SimpleValue::String(value));
        }

        let message = Message::builder()
            .header(Header {
                durable: options.durable,
                ..Header::default()
            })
            .properties(Properties {
                subject: Some(envelope.routing_key.clone()),
                content_type: Some(Symbol::from(CONTENT_TYPE_JSON)),
                ..Properties::default()
            })
            .application_properties(properties.build())
            .value(body)
            .build();

        let sender = self.sender_for(&address).await?;
        let outcome = sender.send(message).await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // A broken link is not reused.
                if let Some(sender) = self.senders.remove(&address) {
                    let _ = sender.close().await;
                }
                self.sender_order.retain(|a| a != &address);
                return Err(TransportError::connection(format!("amqp10: send to '{address}' failed"), e));
            }
        };

        if !matches!(outcome, Outcome::Accepted(_)) {
            return Err(TransportError::connection_msg(format!(
                "amqp10: broker did not accept transfer to '{address}': {outcome:?}"
            )));
        }

        log_debug!("[{}] published to {address}", self.broker_id);
        Ok(())
    }
}

enum Disposition {
    Accept,
    Reject,
}

type SettleRequest = (Disposition, oneshot::Sender<Result<()>>);

struct Amqp10Settle {
    request: Mutex<Option<oneshot::Sender<SettleRequest>>>,
}

impl Amqp10Settle {
    async fn settle(&self, disposition: Disposition) -> Result<()> {
        // ---
        let request = self
            .request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| TransportError::connection_msg("amqp10: delivery already settled"))?;

        let (reply_tx, reply_rx) = oneshot::channel();
        request
            .send((disposition, reply_tx))
            .map_err(|_| TransportError::Closed)?;

        reply_rx.await.map_err(|_| TransportError::Closed)?
    }
}

#[async_trait::async_trait]
impl Settle for Amqp10Settle {
    // ---
    async fn ack(&self) -> Result<()> {
        self.settle(Disposition::Accept).await
    }

    async fn reject(&self) -> Result<()> {
        self.settle(Disposition::Reject).await
    }
}

/// A receiver link running on its own task.
struct ReceiverLink {
    // ---
    label: String,
    exchange: String,
    binding_key: String,
    receiver: Receiver,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

type AmqpDelivery = fe2o3_amqp::link::delivery::Delivery<Body<Value>>;

impl ReceiverLink {
    async fn run(mut self, mut stop: oneshot::Receiver<()>) {
        // ---
        loop {
            let received = tokio::select! {
                _ = &mut stop => None,
                received = self.receiver.recv::<Body<Value>>() => Some(received),
            };

            let delivery = match received {
                None => break,
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    log_error!("[{}] receive failed: {e}", self.label);
                    let _ = self
                        .tx
                        .send(Err(TransportError::connection("amqp10: receive failed", e)));
                    break;
                }
            };

            let (request_tx, request_rx) = oneshot::channel();
            let settle = Amqp10Settle {
                request: Mutex::new(Some(request_tx)),
            };
            let envelope = self.to_envelope(&delivery);

            if self
                .tx
                .send(Ok(Delivery::new(self.exchange.clone(), envelope, Box::new(settle))))
                .is_err()
            {
                let _ = self.receiver.release(&delivery).await;
                break;
            }

            let request = tokio::select! {
                _ = &mut stop => None,
                request = request_rx => Some(request),
            };

            match request {
                None => {
                    let _ = self.receiver.release(&delivery).await;
                    break;
                }
                Some(Ok((Disposition::Accept, reply))) => {
                    let result = self
                        .receiver
                        .accept(&delivery)
                        .await
                        .map_err(|e| TransportError::connection("amqp10: accept failed", e));
                    let _ = reply.send(result);
                }
                Some(Ok((Disposition::Reject, reply))) => {
                    let result = self
                        .receiver
                        .reject(&delivery, None::<fe2o3_amqp::types::definitions::Error>)
                        .await
                        .map_err(|e| TransportError::connection("amqp10: reject failed", e));
                    let _ = reply.send(result);
                }
                Some(Err(_)) => {
                    log_warn!("[{}] delivery dropped unsettled; releasing", self.label);
                    let _ = self.receiver.release(&delivery).await;
                }
            }
        }

        if let Err(e) = self.receiver.close().await {
            log_debug!("[{}] closing receiver: {e}", self.label);
        }
    }

    fn to_envelope(&self, delivery: &AmqpDelivery) -> Envelope {
        // ---
        let message = delivery.message();

        let body: Vec<u8> = match &message.body {
            Body::Value(v) => match &v.0 {
                Value::String(s) => s.clone().into_bytes(),
                Value::Binary(b) => b.to_vec(),
                other => {
                    log_warn!("[{}] unexpected amqp-value body {other:?}", self.label);
                    Vec::new()
                }
            },
            Body::Data(batch) => batch.iter().flat_map(|d| d.0.iter().copied()).collect(),
            _ => Vec::new(),
        };

        let headers: Headers = message
            .application_properties
            .as_ref()
            .map(|props| {
                props
                    .0
                    .iter()
                    .filter_map(|(k, v)| match v {
                        SimpleValue::String(s) => Some((k.clone(), s.clone())),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        // Without a subject the link address is all we know.
        let routing_key = message
            .properties
            .as_ref()
            .and_then(|p| p.subject.clone())
            .unwrap_or_else(|| self.binding_key.clone());

        Envelope::from_wire(routing_key, body, headers)
    }
}
