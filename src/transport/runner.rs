//! Delivery loop and broker session glue.
//!
//! This module connects a [`Broker`](crate::Broker) subscription to the
//! protocol roles (client transport, server transport, interceptor).
//!
//! The runner is responsible for:
//! - draining a subscription inbox on its own task,
//! - dispatching each delivery to the role's [`DeliveryConsumer`],
//! - telling the role, once, why the inbox ended,
//! - releasing a role's broker resources in a fixed order.
//!
//! ## Receive loop
//!
//! [`spawn_pump`] spawns a task that waits on the inbox. Errors returned by
//! [`DeliveryConsumer::handle_delivery`] are logged and do not end the loop;
//! one bad message must not bring down the consumer. The loop ends when the
//! broker reports a connection error or closes the inbox.
//!
//! The pump is never aborted from the outside. A role that shuts down
//! cancels the subscription, which closes the inbox, which ends the pump.
//! This keeps an in-flight delivery from being cut off half-settled.

use tokio::task::JoinHandle;

use crate::{
    // ---
    log_debug,
    log_warn,
    BrokerPtr,
    Delivery,
    Result,
    SubscriptionHandle,
    SubscriptionId,
    TransportError,
};

/// A role consuming broker deliveries.
#[async_trait::async_trait]
pub(crate) trait DeliveryConsumer: Send + Sync + 'static {
    /// Handle one delivery, settling it. An error is logged and the loop
    /// continues.
    async fn handle_delivery(&self, delivery: Delivery) -> Result<()>;

    /// The inbox ended. `error` is the broker's reason, or `None` when the
    /// subscription was cancelled without one.
    async fn subscription_lost(&self, error: Option<TransportError>);
}

/// Start a receive loop for `consumer` over `handle`'s inbox.
///
/// Dropping the returned handle does not stop the loop.
pub(crate) fn spawn_pump<C>(label: String, handle: SubscriptionHandle, consumer: std::sync::Arc<C>) -> JoinHandle<()>
where
    C: DeliveryConsumer,
{
    // ---
    let SubscriptionHandle { id, mut inbox, .. } = handle;

    tokio::spawn(async move {
        // ---
        loop {
            match inbox.recv().await {
                Some(Ok(delivery)) => {
                    if let Err(err) = consumer.handle_delivery(delivery).await {
                        log_warn!("[{label}] delivery on {id} failed: {err}");
                    }
                }
                Some(Err(err)) => {
                    log_debug!("[{label}] subscription {id} lost: {err}");
                    consumer.subscription_lost(Some(err)).await;
                    break;
                }
                None => {
                    log_debug!("[{label}] subscription {id} ended");
                    consumer.subscription_lost(None).await;
                    break;
                }
            }
        }
    })
}

/// Broker resources held by one started role.
pub(crate) struct Session {
    // ---
    pub(crate) broker: BrokerPtr,
    pub(crate) subscriptions: Vec<SubscriptionId>,
}

impl Session {
    // ---

    pub(crate) fn new(broker: BrokerPtr) -> Self {
        Self {
            broker,
            subscriptions: Vec::new(),
        }
    }

    /// Release inbound subscriptions, then the publish path and the
    /// connection. Every step runs even if an earlier one failed; the first
    /// error is returned.
    pub(crate) async fn release(self) -> Result<()> {
        // ---
        let mut first_err = None;

        for id in &self.subscriptions {
            if let Err(err) = self.broker.unsubscribe(id).await {
                log_warn!("[{}] unsubscribe {id} failed: {err}", self.broker.broker_id());
                first_err.get_or_insert(err);
            }
        }

        if let Err(err) = self.broker.close().await {
            log_warn!("[{}] close failed: {err}", self.broker.broker_id());
            first_err.get_or_insert(err);
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
