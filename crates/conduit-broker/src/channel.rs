//! Broker channel abstraction
//!
//! The request/response surface of a single broker connection. Requests on
//! one channel are assumed to be delivered reliably and in order.

use async_trait::async_trait;
use conduit_core::{Result, Xid};

use crate::message::{AckRequest, Message, Subscription, TransactionRequest};

/// A connection to a remote message broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Sends a message outside any transaction.
    async fn send(&self, message: Message) -> Result<()>;

    /// Acknowledges (or negatively acknowledges) a delivered message.
    async fn acknowledge(&self, ack: AckRequest) -> Result<()>;

    /// Ships transactional work or a completion request.
    ///
    /// Returns once the broker has applied the request.
    async fn transact(&self, request: TransactionRequest) -> Result<()>;

    /// Lists branches the broker holds in the prepared state.
    async fn recover(&self) -> Result<Vec<Xid>>;

    /// Registers a consumer.
    async fn subscribe(&self, subscription: Subscription) -> Result<()>;

    /// Removes a consumer registration.
    async fn unsubscribe(&self, consumer_id: &str) -> Result<()>;
}
