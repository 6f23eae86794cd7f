//! # Conduit Core
//!
//! Shared building blocks for the Conduit connection manager and broker client.
//!
//! - **Types**: principals, request criteria and identity ids used for
//!   sub-pool routing and connection matching.
//! - **XA**: transaction branch identifiers, XA flags, return codes and the
//!   `XaError` type shared by every resource implementation.
//! - **Errors**: the `ConduitError` taxonomy built with `thiserror`.
//! - **Configuration**: YAML and environment driven settings for managers,
//!   pools, the association cache and the broker client.
//!
//! ## Example
//!
//! ```
//! use conduit_core::config::{ConnectionManagerConfig, TransactionSupport};
//!
//! let mut manager = ConnectionManagerConfig::new("jdbc/orders");
//! manager.transaction_support = TransactionSupport::Xa;
//! manager.pool.max_size = 10;
//!
//! assert!(manager.validate().is_ok());
//! ```

pub mod config;
pub mod error;
pub mod types;
pub mod xa;

// Re-export commonly used types for convenience
pub use config::AppConfig;
pub use error::{BoxError, ConduitError, ConfigError, Result, ResultExt};
pub use types::{ObjectId, Principal, RequestCriteria};
pub use xa::{Vote, XaError, Xid};
