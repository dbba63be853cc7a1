//! Flags shared by the adaptor binaries.

use clap::Args;
use mcp_amqp_bridge::{BrokerConfig, ConnectorPtr, WireProtocol};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Broker connection flags. Anything left unset falls back to the
/// `AMQP_HOSTNAME`, `AMQP_PORT`, `AMQP_USERNAME`, `AMQP_PASSWORD` and
/// `AMQP_USE_TLS` environment variables. With `--protocol amqp10`, TLS is on
/// unless `AMQP_USE_TLS=false`.
#[derive(Args, Debug)]
pub struct BrokerArgs {
    /// Wire protocol spoken to the broker (amqp091 or amqp10)
    #[arg(long, default_value = "amqp091")]
    pub protocol: WireProtocol,

    /// Broker hostname
    #[arg(long)]
    pub hostname: Option<String>,

    /// Broker port (defaults to 5671 with TLS, 5672 without)
    #[arg(long)]
    pub port: Option<u16>,

    #[arg(long)]
    pub username: Option<String>,

    #[arg(long)]
    pub password: Option<String>,

    /// Connect with TLS (amqps)
    #[arg(long = "use-tls")]
    pub use_tls: bool,
}

impl BrokerArgs {
    // ---

    pub fn broker_config(&self) -> anyhow::Result<BrokerConfig> {
        // ---
        let mut builder = BrokerConfig::builder();
        if self.protocol == WireProtocol::Amqp10 {
            builder = builder.tls_by_default();
        }

        let config = builder
            .merge(
                self.hostname.clone(),
                self.port,
                self.username.clone(),
                self.password.clone(),
                self.use_tls.then_some(true),
            )
            .build()?;

        tracing::info!(uri = %config.redacted_uri(), protocol = ?self.protocol, "broker configured");
        Ok(config)
    }

    pub fn connector(&self) -> anyhow::Result<ConnectorPtr> {
        Ok(self.protocol.connector()?)
    }
}

/// Log to stderr; stdout carries the JSON-RPC stream.
pub fn init_tracing() {
    // ---
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
