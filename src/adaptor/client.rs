use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{interrupted, pump_records, pump_to_writer, ChannelHandler};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    ClientTransport,
    ConnectorPtr,
    McpTransport,
    Result,
    TransportError,
    TransportOptions,
    TransportState,
};

/// Bridge this process's stdin and stdout to a remote MCP server.
///
/// Returns on Ctrl-C, when the transport fails, or once stdin has ended and
/// every request read from it has been answered.
pub async fn run_client_adaptor(options: TransportOptions, connector: ConnectorPtr) -> Result<()> {
    // ---
    bridge_client(
        options,
        connector,
        tokio::io::stdin(),
        tokio::io::stdout(),
        interrupted(),
    )
    .await
}

/// Run a [`ClientTransport`] between an input stream of records and an
/// output stream for replies.
///
/// Stops when `shutdown` resolves or the transport closes underneath. When
/// `input` ends first, keeps writing replies until no request sent from it
/// is outstanding. Replies already received are flushed to `output` before
/// returning.
pub async fn bridge_client<R, W, S>(
    options: TransportOptions,
    connector: ConnectorPtr,
    input: R,
    output: W,
    shutdown: S,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    // ---
    let (handler, rx) = ChannelHandler::new();
    let transport = ClientTransport::new(options, connector, handler);
    transport.start().await?;

    log_info!("client adaptor ready as {}", transport.client_id());

    let mut writer = tokio::spawn(pump_to_writer(rx, output));
    let mut writer_done = false;
    let mut input_ended = false;

    tokio::pin!(shutdown);

    let mut outcome = tokio::select! {
        res = pump_records(input, &transport) => {
            input_ended = res.is_ok();
            res
        }
        _ = &mut shutdown => {
            log_info!("interrupted");
            Ok(())
        }
        _ = &mut writer => {
            writer_done = true;
            Ok(())
        }
    };

    if input_ended {
        log_info!("input closed; {} request(s) outstanding", transport.pending_requests());

        tokio::select! {
            _ = transport.drained() => log_debug!("all requests answered"),
            _ = &mut shutdown => log_info!("interrupted"),
            _ = &mut writer => writer_done = true,
        }
    }

    if transport.state() == TransportState::Errored && outcome.is_ok() {
        outcome = Err(TransportError::connection_msg("broker connection lost"));
    }

    if let Err(err) = transport.close().await {
        log_warn!("client transport close failed: {err}");
    }

    if !writer_done {
        match writer.await {
            Ok(Err(err)) => log_warn!("writing replies failed: {err}"),
            Err(err) => log_warn!("reply writer task panicked: {err}"),
            Ok(Ok(())) => {}
        }
    }

    outcome
}
