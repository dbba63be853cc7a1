//! Bridges this process's stdio to a remote MCP server over the broker.
//!
//! An MCP host configured to launch a stdio server can launch this binary
//! instead:
//!
//! ```text
//! mcp-amqp-client-adaptor --server-name calc --exchange-name mcp \
//!     --additional-metadata tenant=acme,env=dev
//! ```

mod common;

use clap::Parser;
use mcp_amqp_bridge::{adaptor, parse_metadata, TransportOptions};

use common::{init_tracing, BrokerArgs};

#[derive(Parser, Debug)]
#[command(name = "mcp-amqp-client-adaptor")]
#[command(about = "Reach a remote MCP server through an AMQP topic exchange", long_about = None)]
struct Cli {
    /// Logical name of the remote server
    #[arg(long)]
    server_name: String,

    /// Topic exchange carrying MCP traffic
    #[arg(long)]
    exchange_name: String,

    #[command(flatten)]
    broker: BrokerArgs,

    /// Extra `key=value` pairs (comma separated) sent as headers with every request
    #[arg(long)]
    additional_metadata: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    init_tracing();
    let cli = Cli::parse();

    let metadata = cli
        .additional_metadata
        .as_deref()
        .map(parse_metadata)
        .unwrap_or_default();

    let options = TransportOptions::new(cli.broker.broker_config()?, &cli.server_name, &cli.exchange_name)?
        .with_metadata(metadata);
    let connector = cli.broker.connector()?;

    adaptor::run_client_adaptor(options, connector).await?;

    tracing::info!("client adaptor finished");
    Ok(())
}
