//! In-memory topic broker.
//!
//! This module provides a pure in-process implementation of the domain-level
//! [`Broker`] trait. It is intended primarily for testing and as the
//! reference for routing semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker defines the **reference behavior** for the broker
//! layer. The AMQP brokers are expected to approximate it as closely as their
//! underlying protocols allow and to document any unavoidable deviations.
//!
//! - Exchanges are topic exchanges; publishing to an undeclared exchange
//!   fails.
//! - A routing key reaches every queue with at least one matching binding,
//!   once per queue. `*` matches exactly one word, `#` zero or more.
//! - Within a queue, messages go round-robin to its consumers. A queue with
//!   no consumer keeps a backlog that is flushed to the next consumer.
//! - Private and anonymous queues are exclusive to the connection that
//!   declared them and are deleted with their last consumer.
//! - Once `subscribe()` returns, matching messages published afterwards are
//!   deliverable. Delivery is deterministic within a single process.
//!
//! ## Observability
//!
//! The hub records every publication and every ack/reject so tests can
//! assert on wire-level effects without a live broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{
    // ---
    log_debug,
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

/// Match a routing key against a topic binding pattern.
///
/// Both are dot-separated words. `*` matches exactly one word and `#`
/// matches zero or more words.
///
/// ```
/// use mcp_amqp_bridge::topic_matches;
///
/// assert!(topic_matches("mcp.*.request", "mcp.calc.request"));
/// assert!(topic_matches("from-mcp.#", "from-mcp.calc.client-id.c1"));
/// assert!(!topic_matches("mcp.*.request", "mcp.a.b.request"));
/// ```
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    // ---
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    // ---
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) => (word == "*" || word == k) && match_words(rest, key_rest),
            None => false,
        },
    }
}

/// One message as it was published on the hub.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRecord {
    // ---
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub reply_to: Option<String>,
    pub headers: Headers,
    pub durable: bool,
}

impl PublishRecord {
    /// The body parsed as JSON, for assertions.
    pub fn json(&self) -> Option<serde_json::Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject,
}

/// One ack or reject observed by the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementRecord {
    // ---
    pub delivery_tag: u64,
    pub queue: String,
    pub routing_key: String,
    pub outcome: Settlement,
}

struct Consumer {
    // ---
    id: SubscriptionId,
    connection: String,
    exchange: String,
    tx: mpsc::UnboundedSender<Result<Delivery>>,
}

struct Queue {
    // ---
    exclusive_to: Option<String>,
    auto_delete: bool,
    consumers: Vec<Consumer>,
    next_consumer: usize,
    backlog: VecDeque<(String, Envelope)>,
}

struct Binding {
    // ---
    exchange: String,
    pattern: String,
    queue: String,
}

#[derive(Default)]
struct HubState {
    // ---
    exchanges: HashSet<String>,
    queues: HashMap<String, Queue>,
    bindings: Vec<Binding>,
    connections: HashSet<String>,
    publications: Vec<PublishRecord>,
    settlements: Vec<SettlementRecord>,
    settled: HashSet<u64>,
    next_tag: u64,
    next_name: u64,
}

impl HubState {
    // ---

    fn next_name(&mut self, prefix: &str) -> String {
        self.next_name += 1;
        format!("{prefix}{}", self.next_name)
    }

    fn route(&mut self, hub: &Weak<MemoryHub>, exchange: &str, envelope: &Envelope) {
        // ---
        let mut targets: Vec<String> = Vec::new();
        for b in &self.bindings {
            if b.exchange == exchange
                && topic_matches(&b.pattern, &envelope.routing_key)
                && !targets.contains(&b.queue)
            {
                targets.push(b.queue.clone());
            }
        }

        if targets.is_empty() {
            log_debug!(
                "memory: {exchange}/{} matched no queue",
                envelope.routing_key
            );
        }

        for queue in targets {
            self.enqueue(hub, &queue, exchange.to_string(), envelope.clone());
        }
    }

    fn enqueue(&mut self, hub: &Weak<MemoryHub>, queue_name: &str, exchange: String, envelope: Envelope) {
        // ---
        let tag = self.next_tag + 1;
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };

        let mut pending = Some((exchange, envelope));

        while let Some((exchange, envelope)) = pending.take() {
            if queue.consumers.is_empty() {
                queue.backlog.push_back((exchange, envelope));
                return;
            }

            let idx = queue.next_consumer % queue.consumers.len();
            let settle = MemorySettle {
                hub: hub.clone(),
                tag,
                queue: queue_name.to_string(),
                routing_key: envelope.routing_key.clone(),
            };
            let delivery = Delivery::new(exchange, envelope, Box::new(settle));

            match queue.consumers[idx].tx.send(Ok(delivery)) {
                Ok(()) => {
                    queue.next_consumer = idx + 1;
                    self.next_tag = tag;
                    return;
                }
                Err(mpsc::error::SendError(returned)) => {
                    // Consumer's inbox is gone; forget it and try the next one.
                    queue.consumers.remove(idx);
                    if let Ok(d) = returned {
                        pending = Some((d.exchange, d.envelope));
                    }
                }
            }
        }
    }

    fn flush_backlog(&mut self, hub: &Weak<MemoryHub>, queue_name: &str) {
        // ---
        let backlog = match self.queues.get_mut(queue_name) {
            Some(q) => std::mem::take(&mut q.backlog),
            None => return,
        };
        for (exchange, envelope) in backlog {
            self.enqueue(hub, queue_name, exchange, envelope);
        }
    }

    fn remove_consumer(&mut self, id: &SubscriptionId) -> bool {
        // ---
        let mut emptied = None;
        let mut found = false;

        for (name, queue) in self.queues.iter_mut() {
            if let Some(pos) = queue.consumers.iter().position(|c| &c.id == id) {
                queue.consumers.remove(pos);
                found = true;
                if queue.auto_delete && queue.consumers.is_empty() {
                    emptied = Some(name.clone());
                }
                break;
            }
        }

        if let Some(name) = emptied {
            self.delete_queue(&name);
        }
        found
    }

    fn delete_queue(&mut self, name: &str) {
        // ---
        log_debug!("memory: deleting queue {name}");
        self.queues.remove(name);
        self.bindings.retain(|b| b.queue != name);
    }

    fn drop_connection(&mut self, connection: &str, error: Option<&str>) {
        // ---
        self.connections.remove(connection);

        let mut emptied = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            queue.consumers.retain(|c| {
                if c.connection != connection {
                    return true;
                }
                if let Some(msg) = error {
                    let _ = c.tx.send(Err(TransportError::connection_msg(msg)));
                }
                false
            });
            let owned = queue.exclusive_to.as_deref() == Some(connection);
            if owned || (queue.auto_delete && queue.consumers.is_empty()) {
                emptied.push(name.clone());
            }
        }

        for name in emptied {
            self.delete_queue(&name);
        }
    }
}

/// Shared in-process topic broker.
///
/// All [`MemoryConnector`]s built from the same hub see each other's
/// exchanges, queues and messages, exactly as connections to one real broker
/// would. Construct one hub per test for isolation.
///
/// ```
/// use mcp_amqp_bridge::{MemoryConnector, MemoryHub};
///
/// let hub = MemoryHub::new();
/// let connector = MemoryConnector::new(hub.clone());
/// assert!(hub.publications().is_empty());
/// ```
pub struct MemoryHub {
    // ---
    me: Weak<MemoryHub>,
    state: Mutex<HubState>,
}

impl MemoryHub {
    // ---

    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(HubState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register_connection(&self, connection_id: &str) -> String {
        // ---
        let mut state = self.lock();
        let id = state.next_name(&format!("{connection_id}#"));
        state.connections.insert(id.clone());
        id
    }

    fn is_live(&self, connection: &str) -> bool {
        self.lock().connections.contains(connection)
    }

    fn declare_exchange(&self, exchange: &str) {
        // ---
        if self.lock().exchanges.insert(exchange.to_string()) {
            log_debug!("memory: declared exchange {exchange}");
        }
    }

    fn subscribe(&self, connection: &str, spec: SubscribeSpec) -> Result<SubscriptionHandle> {
        // ---
        let mut state = self.lock();

        if !state.exchanges.contains(&spec.exchange) {
            return Err(TransportError::connection_msg(format!(
                "memory: no exchange '{}'",
                spec.exchange
            )));
        }

        let (queue_name, exclusive, auto_delete) = match spec.queue {
            QueueSpec::Shared(name) => (name, false, false),
            QueueSpec::Private(name) => (name, true, true),
            QueueSpec::Anonymous => (state.next_name("amq.gen-"), true, true),
        };

        let owner = state
            .queues
            .get(&queue_name)
            .map(|q| q.exclusive_to.clone());

        match owner {
            Some(Some(owner)) if owner != connection => {
                return Err(TransportError::connection_msg(format!(
                    "memory: queue '{queue_name}' is locked by another connection"
                )));
            }
            Some(_) => {}
            None => {
                state.queues.insert(
                    queue_name.clone(),
                    Queue {
                        exclusive_to: exclusive.then(|| connection.to_string()),
                        auto_delete,
                        consumers: Vec::new(),
                        next_consumer: 0,
                        backlog: VecDeque::new(),
                    },
                );
            }
        }

        let bound = state.bindings.iter().any(|b| {
            b.exchange == spec.exchange && b.pattern == spec.binding_key && b.queue == queue_name
        });
        if !bound {
            state.bindings.push(Binding {
                exchange: spec.exchange.clone(),
                pattern: spec.binding_key.clone(),
                queue: queue_name.clone(),
            });
        }

        let id = SubscriptionId::from(state.next_name(&format!("{queue_name}/ctag-")));
        let (tx, inbox) = mpsc::unbounded_channel();

        if let Some(queue) = state.queues.get_mut(&queue_name) {
            queue.consumers.push(Consumer {
                id: id.clone(),
                connection: connection.to_string(),
                exchange: spec.exchange.clone(),
                tx,
            });
        }
        state.flush_backlog(&self.me, &queue_name);

        log_debug!(
            "memory: {connection} consuming {queue_name} ({} <- {})",
            spec.exchange,
            spec.binding_key
        );

        Ok(SubscriptionHandle {
            id,
            source: queue_name,
            inbox,
        })
    }

    fn publish(&self, exchange: &str, envelope: Envelope, durable: bool) -> Result<()> {
        // ---
        let mut state = self.lock();

        if !state.exchanges.contains(exchange) {
            return Err(TransportError::connection_msg(format!(
                "memory: no exchange '{exchange}'"
            )));
        }

        state.publications.push(PublishRecord {
            exchange: exchange.to_string(),
            routing_key: envelope.routing_key.clone(),
            body: envelope.body.clone(),
            reply_to: envelope.reply_to.clone(),
            headers: envelope.headers.clone(),
            durable,
        });

        state.route(&self.me, exchange, &envelope);
        Ok(())
    }

    fn settle(&self, tag: u64, queue: &str, routing_key: &str, outcome: Settlement) -> Result<()> {
        // ---
        let mut state = self.lock();

        if !state.settled.insert(tag) {
            return Err(TransportError::connection_msg(format!(
                "memory: delivery {tag} already settled"
            )));
        }

        state.settlements.push(SettlementRecord {
            delivery_tag: tag,
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
            outcome,
        });
        Ok(())
    }

    /// Publish `envelope` on `exchange` as an external producer would.
    ///
    /// Lets tests put arbitrary bytes (malformed JSON, foreign headers) in
    /// front of a transport.
    pub fn inject(&self, exchange: &str, envelope: Envelope) -> Result<()> {
        self.publish(exchange, envelope, true)
    }

    /// Every publication so far, in order.
    pub fn publications(&self) -> Vec<PublishRecord> {
        self.lock().publications.clone()
    }

    /// Publications whose routing key equals `routing_key`.
    pub fn publications_to(&self, routing_key: &str) -> Vec<PublishRecord> {
        // ---
        self.lock()
            .publications
            .iter()
            .filter(|p| p.routing_key == routing_key)
            .cloned()
            .collect()
    }

    /// Every ack and reject so far, in order.
    pub fn settlements(&self) -> Vec<SettlementRecord> {
        self.lock().settlements.clone()
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.lock().exchanges.contains(exchange)
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Messages waiting in `queue` for a consumer.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.backlog.len())
    }

    /// Number of consumers currently attached to `queue`.
    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.lock().queues.get(queue).map(|q| q.consumers.len())
    }

    /// Sever every live connection, as a broker restart would.
    ///
    /// Each consumer receives one connection error and its inbox closes.
    /// Subsequent operations on the severed connections fail.
    pub fn disconnect_all(&self) {
        // ---
        let mut state = self.lock();
        let live: Vec<String> = state.connections.iter().cloned().collect();

        for connection in live {
            log_warn!("memory: severing connection {connection}");
            state.drop_connection(&connection, Some("memory: connection reset by broker"));
        }
    }

    /// Names of the exchanges that consumers of `queue` bound through.
    #[cfg(test)]
    fn consumer_exchanges(&self, queue: &str) -> Vec<String> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.exchange.clone()).collect())
            .unwrap_or_default()
    }
}

struct MemorySettle {
    // ---
    hub: Weak<MemoryHub>,
    tag: u64,
    queue: String,
    routing_key: String,
}

#[async_trait::async_trait]
impl Settle for MemorySettle {
    // ---
    async fn ack(&self) -> Result<()> {
        self.settle(Settlement::Ack)
    }

    async fn reject(&self) -> Result<()> {
        self.settle(Settlement::Reject)
    }
}

impl MemorySettle {
    fn settle(&self, outcome: Settlement) -> Result<()> {
        // ---
        let hub = self.hub.upgrade().ok_or(TransportError::Closed)?;
        hub.settle(self.tag, &self.queue, &self.routing_key, outcome)
    }
}

/// One connection to a [`MemoryHub`].
struct MemoryBroker {
    // ---
    hub: Arc<MemoryHub>,
    connection: String,
    closed: AtomicBool,
}

impl MemoryBroker {
    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        if !self.hub.is_live(&self.connection) {
            return Err(TransportError::connection_msg(format!(
                "memory: connection {} was severed",
                self.connection
            )));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    // ---
    fn broker_id(&self) -> &str {
        &self.connection
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.hub.declare_exchange(exchange);
        Ok(())
    }

    async fn subscribe(&self, spec: SubscribeSpec) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        self.hub.subscribe(&self.connection, spec)
    }

    async fn unsubscribe(&self, id: &SubscriptionId) -> Result<()> {
        // ---
        if !self.hub.lock().remove_consumer(id) {
            log_debug!("memory: {} has no subscription {id}", self.connection);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, envelope: Envelope, options: PublishOptions) -> Result<()> {
        self.ensure_open()?;
        self.hub.publish(exchange, envelope, options.durable)
    }

    async fn close(&self) -> Result<()> {
        // ---
        if !self.closed.swap(true, Ordering::SeqCst) {
            log_debug!("memory: closing {}", self.connection);
            self.hub.lock().drop_connection(&self.connection, None);
        }
        Ok(())
    }
}

/// Connector producing connections to one shared [`MemoryHub`].
///
/// The broker configuration handed to `connect` is ignored.
#[derive(Clone)]
pub struct MemoryConnector {
    hub: Arc<MemoryHub>,
}

impl MemoryConnector {
    pub fn new(hub: Arc<MemoryHub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Arc<MemoryHub> {
        &self.hub
    }
}

#[async_trait::async_trait]
impl BrokerConnector for MemoryConnector {
    // ---
    fn protocol(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, _config: &BrokerConfig, connection_id: &str) -> Result<BrokerPtr> {
        // ---
        let connection = self.hub.register_connection(connection_id);
        log_debug!("memory: opened {connection}");

        Ok(Arc::new(MemoryBroker {
            hub: Arc::clone(&self.hub),
            connection,
            closed: AtomicBool::new(false),
        }))
    }
}
