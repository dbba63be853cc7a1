//! Stdio adaptors.
//!
//! Byte-stream MCP peers talk newline-delimited JSON-RPC over a pipe. The
//! adaptors in this module put such a peer on the broker: records read from
//! a stream are handed to a transport's `send`, and records the transport
//! receives are written back out, one per line.
//!
//! Both directions run as independent pumps, each with its own [`Framer`].
//! Inbound records cross from the transport's delivery task to the writer
//! pump through an unbounded channel, so a slow pipe never stalls the
//! broker consumer.

mod client;
mod server;

pub use client::{bridge_client, run_client_adaptor};
pub use server::{bridge_server, run_server_adaptor};

use std::sync::{Mutex, PoisonError};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::{
    // ---
    log_debug,
    log_error,
    log_warn,
    Framer,
    JsonRpcMessage,
    McpTransport,
    Result,
    TransportHandler,
};

const READ_CHUNK: usize = 8 * 1024;

/// [`TransportHandler`] that forwards every inbound record into a channel.
///
/// The channel ends when the transport signals close, which is how the
/// writer pump learns that no more records will arrive.
pub struct ChannelHandler {
    // ---
    tx: Mutex<Option<UnboundedSender<JsonRpcMessage>>>,
}

impl ChannelHandler {
    // ---

    pub fn new() -> (std::sync::Arc<Self>, UnboundedReceiver<JsonRpcMessage>) {
        // ---
        let (tx, rx) = mpsc::unbounded_channel();
        let handler = Self {
            tx: Mutex::new(Some(tx)),
        };
        (std::sync::Arc::new(handler), rx)
    }
}

impl TransportHandler for ChannelHandler {
    // ---
    fn on_message(&self, message: JsonRpcMessage) {
        // ---
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(tx) if tx.send(message).is_ok() => {}
            _ => log_debug!("inbound record dropped: writer is gone"),
        }
    }

    fn on_close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Read newline-delimited records from `reader` and send each one through
/// `transport` until the stream ends.
///
/// Lines that are not JSON-RPC records are logged and skipped. A failed
/// `send` ends the pump with that error.
pub async fn pump_records<R, T>(mut reader: R, transport: &T) -> Result<()>
where
    R: AsyncRead + Unpin,
    T: McpTransport + ?Sized,
{
    // ---
    let mut framer = Framer::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }

        framer.append(&chunk[..n]);

        while let Some(record) = framer.next_message() {
            match record {
                Ok(message) => transport.send(message).await?,
                Err(err) => log_warn!("skipping malformed input line: {err}"),
            }
        }
    }

    if framer.buffered() > 0 {
        log_debug!("input ended with {} bytes of unterminated line", framer.buffered());
    }
    Ok(())
}

/// Write every record arriving on `rx` to `writer`, one per line, until the
/// channel ends.
pub async fn pump_to_writer<W>(mut rx: UnboundedReceiver<JsonRpcMessage>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    // ---
    while let Some(message) = rx.recv().await {
        let line = match Framer::encode(&message) {
            Ok(line) => line,
            Err(err) => {
                log_error!("cannot encode outbound record: {err}");
                continue;
            }
        };
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Resolves on Ctrl-C. If the signal handler cannot be installed this never
/// resolves, and the adaptor runs until its stream ends.
pub(crate) async fn interrupted() {
    // ---
    if let Err(err) = tokio::signal::ctrl_c().await {
        log_warn!("cannot listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
}
