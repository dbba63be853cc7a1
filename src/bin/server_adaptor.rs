//! Runs a stdio MCP server subprocess and serves it over the broker.
//!
//! ```text
//! mcp-amqp-server-adaptor --server-name calc --exchange-name mcp \
//!     --hostname localhost --username guest --password guest \
//!     --command python --args calc_server.py --verbose
//! ```

mod common;

use clap::Parser;
use mcp_amqp_bridge::{adaptor, TransportOptions};

use common::{init_tracing, BrokerArgs};

#[derive(Parser, Debug)]
#[command(name = "mcp-amqp-server-adaptor")]
#[command(about = "Serve a stdio MCP server over an AMQP topic exchange", long_about = None)]
struct Cli {
    /// Logical server name requests are addressed to
    #[arg(long)]
    server_name: String,

    /// Topic exchange carrying MCP traffic
    #[arg(long)]
    exchange_name: String,

    #[command(flatten)]
    broker: BrokerArgs,

    /// Server command to spawn
    #[arg(long)]
    command: String,

    /// Arguments for the server command
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    init_tracing();
    let cli = Cli::parse();

    let options = TransportOptions::new(cli.broker.broker_config()?, &cli.server_name, &cli.exchange_name)?;
    let connector = cli.broker.connector()?;

    let code = adaptor::run_server_adaptor(options, connector, &cli.command, &cli.args).await?;

    tracing::info!(code, "server adaptor finished");
    std::process::exit(code);
}
