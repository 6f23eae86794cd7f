//! Conduit Connection Pool
//!
//! Pools, matches and transactionally enlists managed connections on behalf
//! of application components.
//!
//! # Architecture
//!
//! ```text
//!                    ┌─────────────────────────────────┐
//!                    │   Connection Manager            │
//!                    │  (manager.rs)                   │
//!                    │  - Factory check, retry         │
//!                    │  - Track by transaction         │
//!                    │  - Driver event sink            │
//!                    └──────────┬──────────────────────┘
//!                               │
//!                ┌──────────────┼──────────────┐
//!                │              │              │
//!      ┌─────────▼──────┐  ┌───▼────────┐  ┌─▼──────────────┐
//!      │  Sub-pool      │  │ Enlistment │  │  Association   │
//!      │  Router        │  │  Policies  │  │  Cache         │
//!      │  (router.rs)   │  │(enlist.rs) │  │(association.rs)│
//!      │  - Partition   │  │  - None    │  │  - Per-thread  │
//!      │    by key      │  │  - Local   │  │    contexts    │
//!      │  - Lazy pools  │  │  - XA      │  │  - Reconnect   │
//!      └───────┬────────┘  └────────────┘  └────────────────┘
//!              │
//!  ┌───────────▼────────────┐        ┌──────────────────────┐
//!  │   Permit-gated Pool    │◄───────┤   Pool Workers       │
//!  │   (pool.rs)            │        │   (workers.rs)       │
//!  │  - LIFO idle list      │        │  - Idle sweeper      │
//!  │  - Permit accounting   │        │  - Background filler │
//!  │  - Blocking checkout   │        └──────────────────────┘
//!  └────────────────────────┘
//! ```
//!
//! Drivers plug in through the traits in [`spi`]; the pool never talks to a
//! database, broker or transaction manager directly.
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use conduit_core::config::{ConnectionManagerConfig, TransactionSupport};
//! use conduit_core::RequestCriteria;
//! use conduit_pool::{ConnectionManager, ManagedConnectionFactory};
//! use std::sync::Arc;
//!
//! fn open(factory: Arc<dyn ManagedConnectionFactory>) -> conduit_core::Result<()> {
//!     let mut config = ConnectionManagerConfig::new("jdbc/orders");
//!     config.transaction_support = TransactionSupport::Xa;
//!     config.pool.max_size = 10;
//!
//!     let manager = ConnectionManager::builder(config, Arc::clone(&factory)).build()?;
//!     let _connection =
//!         manager.allocate_connection(factory.as_ref(), None, &RequestCriteria::default())?;
//!     Ok(())
//! }
//! ```

pub mod association;
pub mod enlistment;
pub mod listener;
pub mod local_tx;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod router;
pub mod spi;
pub mod workers;

#[cfg(any(test, feature = "test-util"))]
pub mod testkit;

// Re-export commonly used types
pub use association::{
    AssociationCache, ConnectionCacheListener, ConnectionRecord, ContextGuard, ContextKey,
};
pub use enlistment::{
    policy_for, EnlistmentPolicy, LocalTransactionPolicy, NoTransactionPolicy,
    XaTransactionPolicy,
};
pub use listener::{ConnectionEventSink, ConnectionListener, ListenerState, LocalTransactionEvent};
pub use local_tx::LocalTransactionBridge;
pub use manager::{ConnectionManager, ConnectionManagerBuilder, ManagerStatistics};
pub use metrics::{PoolMetrics, PoolStatistics};
pub use pool::{PermitGatedPool, PoolBuilder};
pub use router::{SubPoolKey, SubPoolRouter};
pub use spi::{
    same_connection, AppConnection, ConnectionEventListener, ConnectionHandle, LocalTransaction,
    ManagedConnection, ManagedConnectionFactory, Synchronization, Transaction,
    TransactionCoordinator, TransactionStatus, XaResource,
};
pub use workers::{BackgroundFiller, IdleSweeper, PoolWorkers};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::association::{AssociationCache, ContextKey};
    pub use crate::manager::ConnectionManager;
    pub use crate::spi::{ConnectionHandle, ManagedConnectionFactory, TransactionCoordinator};
    pub use crate::workers::PoolWorkers;
}
