//! Conduit Broker Client
//!
//! Client-side acknowledgement and transaction handling for a message broker.
//!
//! # Architecture
//!
//! ```text
//!  ┌──────────────────────────────┐
//!  │   Broker Connection          │
//!  │   (connection.rs)            │
//!  └──────┬────────────────┬──────┘
//!         │ creates        │ owns
//!  ┌──────▼──────────┐  ┌──▼──────────────────────┐
//!  │   Sessions      │  │  Transaction Manager    │
//!  │   (session.rs)  ├─►│  (transaction.rs)       │
//!  │  - Ack modes    │  │  - Branch buffers       │
//!  │  - XA resource  │  │  - Prepare / commit     │
//!  └─────────────────┘  │  - Anonymous branches   │
//!                       └──────────┬──────────────┘
//!                                  │
//!                       ┌──────────▼──────────────┐
//!                       │  Broker Channel         │
//!                       │  (channel.rs)           │
//!                       └─────────────────────────┘
//! ```
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use conduit_broker::{BrokerChannel, BrokerConnection, Message};
//! use conduit_core::config::{AckMode, BrokerConfig};
//! use std::sync::Arc;
//!
//! async fn publish(channel: Arc<dyn BrokerChannel>) -> conduit_core::Result<()> {
//!     let connection = BrokerConnection::new(channel, BrokerConfig::default());
//!     let session = connection.create_session(AckMode::Transacted);
//!
//!     session.send(Message::new("orders", "first")).await?;
//!     session.send(Message::new("orders", "second")).await?;
//!     session.commit().await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod connection;
pub mod message;
pub mod metrics;
pub mod session;
pub mod transaction;

#[cfg(any(test, feature = "test-util"))]
pub mod testkit;

// Re-export commonly used types
pub use channel::BrokerChannel;
pub use connection::BrokerConnection;
pub use message::{
    AckKind, AckRequest, Message, MessageId, Subscription, TransactionRequest, TxId,
    TxRequestKind,
};
pub use metrics::{BrokerMetrics, BrokerStatistics};
pub use session::{Session, SessionXaResource};
pub use transaction::{BranchPhase, TransactionManager};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::channel::BrokerChannel;
    pub use crate::connection::BrokerConnection;
    pub use crate::message::{Message, TxId};
    pub use crate::session::{Session, SessionXaResource};
}
