use std::future::Future;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use super::{interrupted, pump_records, pump_to_writer, ChannelHandler};
use crate::{
    // ---
    log_error,
    log_info,
    log_warn,
    ConnectorPtr,
    McpTransport,
    Result,
    ServerTransport,
    TransportError,
    TransportOptions,
    TransportState,
};

/// Put a byte-stream MCP server subprocess on the broker.
///
/// Spawns `command` with piped stdin and stdout (stderr is inherited),
/// feeds it every request the [`ServerTransport`] receives and publishes
/// every record it prints. Returns the subprocess exit code once it exits,
/// or `0` after Ctrl-C (the subprocess is killed).
pub async fn run_server_adaptor(
    options: TransportOptions,
    connector: ConnectorPtr,
    command: &str,
    args: &[String],
) -> Result<i32> {
    // ---
    let mut child = Command::new(command)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()?;

    log_info!("spawned `{command}` (pid {:?})", child.id());

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| TransportError::Io(std::io::Error::other("subprocess stdin not captured")))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::Io(std::io::Error::other("subprocess stdout not captured")))?;

    bridge_server(options, connector, stdin, stdout, wait_or_interrupt(child)).await
}

/// Serve requests through a [`ServerTransport`] using an already connected
/// pair of streams.
///
/// Received requests are written to `to_peer`; records read from
/// `from_peer` are sent as replies. Runs until `exited` resolves (its value
/// is returned) or the transport fails. The transport is closed before
/// returning.
pub async fn bridge_server<W, R, F>(
    options: TransportOptions,
    connector: ConnectorPtr,
    to_peer: W,
    from_peer: R,
    exited: F,
) -> Result<i32>
where
    W: AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    F: Future<Output = Result<i32>>,
{
    // ---
    let (handler, rx) = ChannelHandler::new();
    let transport = ServerTransport::new(options, connector, handler);
    transport.start().await?;

    let mut writer = tokio::spawn(pump_to_writer(rx, to_peer));

    let reader = {
        let transport = transport.clone();
        tokio::spawn(async move {
            // ---
            match pump_records(from_peer, &transport).await {
                Ok(()) => log_info!("subprocess output closed"),
                Err(err) => log_error!("forwarding subprocess output failed: {err}"),
            }
        })
    };

    tokio::pin!(exited);

    let first = tokio::select! {
        biased;
        code = &mut exited => Some(code),
        res = &mut writer => {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log_warn!("writing to subprocess failed: {err}"),
                Err(err) => log_error!("subprocess writer task panicked: {err}"),
            }
            None
        }
    };

    let outcome = match first {
        Some(code) => code,
        None if transport.state() == TransportState::Errored => {
            Err(TransportError::connection_msg("broker connection lost"))
        }
        None => exited.await,
    };

    if let Err(err) = transport.close().await {
        log_warn!("server transport close failed: {err}");
    }
    reader.abort();

    outcome
}

/// Exit code of `child`, or `0` after Ctrl-C (the child is killed).
async fn wait_or_interrupt(mut child: Child) -> Result<i32> {
    // ---
    let status = tokio::select! {
        status = child.wait() => Some(status),
        _ = interrupted() => None,
    };

    match status {
        Some(status) => {
            let status = status?;
            log_info!("subprocess exited: {status}");
            Ok(status.code().unwrap_or(1))
        }
        None => {
            log_info!("interrupted; stopping subprocess");
            child.kill().await?;
            Ok(0)
        }
    }
}
