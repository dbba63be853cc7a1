//! MCP transports over AMQP topic exchanges
//!
//! This library carries JSON-RPC (MCP) traffic between clients and servers
//! through a message broker instead of a subprocess pipe. It emulates
//! point-to-point request/reply on top of topic delivery:
//!
//! - every client of a server publishes to one shared request routing key,
//! - every client consumes from a private reply routing key derived from a
//!   per-instance client identity,
//! - request ids are prefixed with the client identity on the way out and
//!   restored on the way back,
//! - the server remembers, per request id, where the reply has to go.
//!
//! Two wire realizations are provided, AMQP 0-9-1 (queues and topic
//! bindings, via `lapin`) and AMQP 1.0 (addressable links, via `fe2o3-amqp`),
//! both driving the same client/server logic through the [`Broker`] trait.
//! An in-memory topic broker ([`MemoryHub`]) provides the reference routing
//! semantics and backs the test suite.
//!
//! The [`Interceptor`] sits between two exchanges and applies an
//! [`InterceptPolicy`] to every message crossing in either direction.
//!
//! The [`adaptor`] module puts existing stdio MCP peers on the broker
//! without changing them; the `mcp-amqp-server-adaptor` and
//! `mcp-amqp-client-adaptor` binaries are thin wrappers around it.

mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

mod address;
mod config;
mod correlation;
mod domain;
mod error;
mod framing;
mod message;

mod client;
mod interceptor;
mod server;
mod transport;

pub mod adaptor;

pub use address::{
    //
    link_address,
    reply_queue_name,
    reply_routing_key,
    request_queue_name,
    request_routing_key,
    validate_name,
    ClientId,
    ALL_REPLIES_PATTERN,
    ALL_REQUESTS_PATTERN,
    CLIENT_ID_HEADER,
    DEAD_LETTER_ROUTING_KEY,
    REPLY_TO_HEADER,
};
pub use config::{
    //
    parse_metadata,
    BrokerConfig,
    BrokerConfigBuilder,
    InterceptorOptions,
    TransportOptions,
};
pub use correlation::CorrelationTable;
pub use error::{BoxError, Result, TransportError};
pub use framing::Framer;
pub use message::{JsonRpcMessage, RequestId, ResponseOutcome};

pub use domain::{
    //
    Broker,
    BrokerConnector,
    BrokerPtr,
    ConnectorPtr,
    Delivery,
    Envelope,
    HandlerPtr,
    Headers,
    McpTransport,
    PublishOptions,
    QueueSpec,
    Settle,
    SubscribeSpec,
    SubscriptionHandle,
    SubscriptionId,
    TransportHandler,
    TransportState,
};

pub use client::ClientTransport;
pub use interceptor::{
    //
    Direction,
    InterceptPolicy,
    Interceptor,
    InterceptorDecision,
    PassthroughPolicy,
};
pub use server::ServerTransport;

pub use transport::{
    //
    create_amqp091_connector,
    create_amqp10_connector,
    topic_matches,
    MemoryConnector,
    MemoryHub,
    PublishRecord,
    Settlement,
    SettlementRecord,
    WireProtocol,
};
