// tests/common/mod.rs

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use mcp_amqp_bridge::{
    // ---
    BrokerConfig,
    BrokerConnector,
    BrokerPtr,
    ConnectorPtr,
    JsonRpcMessage,
    MemoryConnector,
    MemoryHub,
    TransportError,
    TransportHandler,
    TransportOptions,
};

pub const EXCHANGE: &str = "mcp";
pub const SERVER: &str = "calculator";

const WAIT: Duration = Duration::from_millis(500);

pub fn broker() -> BrokerConfig {
    // ---
    BrokerConfig::builder()
        .hostname("localhost")
        .username("guest")
        .password("guest")
        .without_env()
        .build()
        .expect("valid broker config")
}

pub fn options() -> TransportOptions {
    TransportOptions::new(broker(), SERVER, EXCHANGE).expect("valid options")
}

pub fn connector(hub: &Arc<MemoryHub>) -> ConnectorPtr {
    Arc::new(MemoryConnector::new(Arc::clone(hub)))
}

/// Connector for a broker that is not there.
pub struct Unreachable;

#[async_trait::async_trait]
impl BrokerConnector for Unreachable {
    // ---
    fn protocol(&self) -> &'static str {
        "unreachable"
    }

    async fn connect(&self, config: &BrokerConfig, _connection_id: &str) -> mcp_amqp_bridge::Result<BrokerPtr> {
        Err(TransportError::connection_msg(format!(
            "connection refused: {}",
            config.redacted_uri()
        )))
    }
}

pub fn unreachable() -> ConnectorPtr {
    Arc::new(Unreachable)
}

/// Handler that records every callback for assertions.
pub struct Probe {
    // ---
    tx: mpsc::UnboundedSender<JsonRpcMessage>,
    pub errors: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
}

pub struct ProbeRx {
    rx: mpsc::UnboundedReceiver<JsonRpcMessage>,
}

impl Probe {
    // ---

    pub fn new() -> (Arc<Self>, ProbeRx) {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let probe = Self {
            tx,
            errors: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
        };
        (Arc::new(probe), ProbeRx { rx })
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl TransportHandler for Probe {
    // ---
    fn on_message(&self, message: JsonRpcMessage) {
        let _ = self.tx.send(message);
    }

    fn on_error(&self, error: &TransportError) {
        self.errors.lock().unwrap().push(error.to_string());
    }

    fn on_close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

impl ProbeRx {
    // ---

    pub async fn next(&mut self) -> JsonRpcMessage {
        // ---
        timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("handler dropped")
    }

    pub async fn nothing(&mut self) {
        // ---
        let got = timeout(Duration::from_millis(50), self.rx.recv()).await;
        assert!(got.is_err(), "unexpected message: {got:?}");
    }
}

/// Poll `cond` until it holds or the wait expires.
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    // ---
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
