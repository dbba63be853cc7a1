// src/domain/transport.rs

//! Host-protocol transport abstractions.
//!
//! [`McpTransport`] is the contract an MCP session layer drives: `start`,
//! `send`, `close`. Inbound traffic and lifecycle events flow the other way
//! through a [`TransportHandler`] supplied at construction time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{log_warn, JsonRpcMessage, Result, TransportError};

/// Lifecycle state of a transport.
///
/// ```text
/// Idle -> Starting -> Ready -> Closed
///   \________\__________\----> Errored
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Idle,
    Starting,
    Ready,
    Closed,
    Errored,
}

/// Receiver of inbound messages and lifecycle events.
///
/// Callbacks run on the transport's delivery task and must return
/// promptly; hand heavier work to another task.
pub trait TransportHandler: Send + Sync {
    // ---

    /// A decoded inbound message. The delivery is acknowledged after this
    /// returns.
    fn on_message(&self, message: JsonRpcMessage);

    /// A non-fatal decode failure, or the fatal error that is about to close
    /// the transport.
    fn on_error(&self, error: &TransportError) {
        log_warn!("transport error: {error}");
    }

    /// The transport has closed. Called exactly once.
    fn on_close(&self) {}
}

/// Shared handler pointer.
pub type HandlerPtr = Arc<dyn TransportHandler>;

/// The host-protocol transport contract.
///
/// # Notes
///
/// This trait uses `async_trait`; treat its methods as normal `async fn`s.
#[async_trait::async_trait]
pub trait McpTransport: Send + Sync {
    // ---

    /// Connect and begin consuming. Fails with
    /// [`TransportError::AlreadyStarted`] unless the transport is idle.
    async fn start(&self) -> Result<()>;

    /// Publish one message. Fails with [`TransportError::NotStarted`]
    /// until `start()` has completed.
    async fn send(&self, message: JsonRpcMessage) -> Result<()>;

    /// Release broker resources and signal closure. Idempotent.
    async fn close(&self) -> Result<()>;

    fn state(&self) -> TransportState;
}

/// Shared lifecycle bookkeeping for the client, server and interceptor.
///
/// `closing` is raised as soon as a shutdown begins so that a delivery loop
/// ending at the same moment can tell a requested close from a lost
/// subscription. `signalled` guarantees the close callback fires once.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    // ---
    state: Mutex<TransportState>,
    closing: AtomicBool,
    signalled: AtomicBool,
}

impl Lifecycle {
    // ---

    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::Idle),
            closing: AtomicBool::new(false),
            signalled: AtomicBool::new(false),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut TransportState) -> R) -> R {
        // ---
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub(crate) fn state(&self) -> TransportState {
        self.with_state(|s| *s)
    }

    /// `Idle -> Starting`, or `AlreadyStarted`.
    pub(crate) fn begin_start(&self) -> Result<()> {
        // ---
        self.with_state(|s| match *s {
            TransportState::Idle => {
                *s = TransportState::Starting;
                Ok(())
            }
            _ => Err(TransportError::AlreadyStarted),
        })
    }

    /// `Starting -> Ready`. Returns `false` if a close or failure won the
    /// race while the transport was starting.
    pub(crate) fn mark_ready(&self) -> bool {
        // ---
        self.with_state(|s| {
            if *s == TransportState::Starting && !self.is_closing() {
                *s = TransportState::Ready;
                true
            } else {
                false
            }
        })
    }

    pub(crate) fn mark_errored(&self) {
        self.with_state(|s| *s = TransportState::Errored);
    }

    /// Final state after a requested close. An earlier failure stays
    /// visible as `Errored`.
    pub(crate) fn mark_closed(&self) {
        // ---
        self.with_state(|s| {
            if *s != TransportState::Errored {
                *s = TransportState::Closed;
            }
        });
    }

    pub(crate) fn require_ready(&self) -> Result<()> {
        // ---
        match self.state() {
            TransportState::Ready => Ok(()),
            TransportState::Idle | TransportState::Starting => Err(TransportError::NotStarted),
            TransportState::Closed | TransportState::Errored => Err(TransportError::Closed),
        }
    }

    /// Raise the closing flag. Returns `true` for the first caller only.
    pub(crate) fn begin_close(&self) -> bool {
        !self.closing.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Invoke `on_close` unless it already ran.
    pub(crate) fn signal_close(&self, handler: &dyn TransportHandler) {
        // ---
        if !self.signalled.swap(true, Ordering::SeqCst) {
            handler.on_close();
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
