//! AMQP brokers.
//!
//! - `lapin` - AMQP 0-9-1 (RabbitMQ queues, exchanges and bindings)
//! - `amqp10` - AMQP 1.0 (fe2o3-amqp links to exchange addresses)

#[cfg(feature = "transport_lapin")]
mod lapin;

#[cfg(feature = "transport_amqp10")]
mod amqp10;

#[cfg(feature = "transport_lapin")]
pub(crate) fn amqp091_connector() -> crate::ConnectorPtr {
    std::sync::Arc::new(lapin::Amqp091Connector)
}

#[cfg(feature = "transport_amqp10")]
pub(crate) fn amqp10_connector() -> crate::ConnectorPtr {
    std::sync::Arc::new(amqp10::Amqp10Connector)
}
