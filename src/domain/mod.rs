//! Domain layer public interface.
//!
//! This module defines the abstractions the client, server and interceptor
//! layers are written against. They are independent of any broker client
//! library; concrete implementations live under `src/transport/`.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod broker;
mod transport;

// --- Broker domain re-exports ---

pub use broker::{
    //
    Broker,
    BrokerConnector,
    BrokerPtr,
    ConnectorPtr,
    Delivery,
    Envelope,
    Headers,
    PublishOptions,
    QueueSpec,
    Settle,
    SubscribeSpec,
    SubscriptionHandle,
    SubscriptionId,
};

// --- Host-protocol transport re-exports ---

pub use transport::{
    //
    HandlerPtr,
    McpTransport,
    TransportHandler,
    TransportState,
};

pub(crate) use transport::Lifecycle;
