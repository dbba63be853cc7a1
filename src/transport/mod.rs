//! Broker implementations.
//!
//! This module provides concrete implementations of the domain-level
//! [`Broker`](crate::Broker) trait. Wire-protocol brokers are hidden behind
//! feature flags and exposed only through connector constructor functions.
//!
//! Domain code must not depend on broker-specific types.

mod amqp;
mod memory;
pub(crate) mod runner;

use std::str::FromStr;

use crate::{ConnectorPtr, Result, TransportError};

pub use memory::{
    //
    topic_matches,
    MemoryConnector,
    MemoryHub,
    PublishRecord,
    Settlement,
    SettlementRecord,
};

/// Broker wire protocol.
///
/// The two realizations route identically but do not interoperate on one
/// physical broker: AMQP 0-9-1 consumes from queues bound to an exchange,
/// AMQP 1.0 attaches links to `exchange.<exchange>.<routing-key>` addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireProtocol {
    Amqp091,
    Amqp10,
}

impl WireProtocol {
    /// Build a connector for this protocol.
    pub fn connector(self) -> Result<ConnectorPtr> {
        // ---
        match self {
            Self::Amqp091 => create_amqp091_connector(),
            Self::Amqp10 => create_amqp10_connector(),
        }
    }
}

impl FromStr for WireProtocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        match s.to_ascii_lowercase().as_str() {
            "amqp091" | "amqp0-9-1" | "0-9-1" => Ok(Self::Amqp091),
            "amqp10" | "amqp1.0" | "1.0" => Ok(Self::Amqp10),
            other => Err(TransportError::validation(
                "protocol",
                format!("unknown wire protocol {other:?} (expected amqp091 or amqp10)"),
            )),
        }
    }
}

/// Connector for AMQP 0-9-1 brokers (RabbitMQ queues and bindings).
///
/// # Errors
///
/// Fails when the crate was built without the `transport_lapin` feature.
pub fn create_amqp091_connector() -> Result<ConnectorPtr> {
    // ---
    #[cfg(feature = "transport_lapin")]
    {
        Ok(amqp::amqp091_connector())
    }

    #[cfg(not(feature = "transport_lapin"))]
    {
        Err(TransportError::validation(
            "protocol",
            "AMQP 0-9-1 support requires the `transport_lapin` feature",
        ))
    }
}

/// Connector for AMQP 1.0 brokers (addressable links).
///
/// # Errors
///
/// Fails when the crate was built without the `transport_amqp10` feature.
pub fn create_amqp10_connector() -> Result<ConnectorPtr> {
    // ---
    #[cfg(feature = "transport_amqp10")]
    {
        Ok(amqp::amqp10_connector())
    }

    #[cfg(not(feature = "transport_amqp10"))]
    {
        Err(TransportError::validation(
            "protocol",
            "AMQP 1.0 support requires the `transport_amqp10` feature",
        ))
    }
}
