//! Contracts with drivers and the transaction coordinator
//!
//! The pool never talks to a database, broker or transaction manager
//! directly. Everything it needs from those collaborators is expressed by the
//! traits in this module: a factory that creates and matches physical
//! connections, the physical connection itself, the application-visible
//! handle, and the coordinator side of a global transaction.

use conduit_core::xa::{Vote, XaError, Xid};
use conduit_core::{BoxError, Principal, RequestCriteria};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// Application-visible connection object handed out by a managed connection.
pub type AppConnection = Arc<dyn ConnectionHandle>;

/// Returns true if both values refer to the same application connection.
pub fn same_connection(a: &AppConnection, b: &AppConnection) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

/// Creates and matches physical connections for one resource.
pub trait ManagedConnectionFactory: Send + Sync {
    /// Name identifying this factory; managers compare factories by name.
    fn name(&self) -> &str;

    /// Opens a new physical connection.
    fn create_managed_connection(
        &self,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
    ) -> Result<Arc<dyn ManagedConnection>, BoxError>;

    /// Returns true if `candidate` can serve a request for `principal` and `criteria`.
    fn matches(
        &self,
        candidate: &dyn ManagedConnection,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
    ) -> Result<bool, BoxError>;
}

/// A pooled physical connection.
pub trait ManagedConnection: Send + Sync {
    /// Creates a new application handle on this connection.
    fn connection_handle(
        &self,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
    ) -> Result<AppConnection, BoxError>;

    /// Re-points an existing application handle at this connection.
    fn associate_connection(&self, connection: &AppConnection) -> Result<(), BoxError>;

    /// Registers a listener for close and error events.
    fn add_connection_event_listener(&self, listener: Weak<dyn ConnectionEventListener>);

    /// Resets connection state before it goes back to the pool.
    fn cleanup(&self) -> Result<(), BoxError>;

    /// Closes the physical connection.
    fn destroy(&self) -> Result<(), BoxError>;

    /// XA resource for this connection.
    fn xa_resource(&self) -> Result<Arc<dyn XaResource>, BoxError>;

    /// Local (single resource) transaction for this connection.
    fn local_transaction(&self) -> Result<Arc<dyn LocalTransaction>, BoxError>;

    fn as_any(&self) -> &dyn Any;
}

/// Application handle obtained from a managed connection.
pub trait ConnectionHandle: Send + Sync + fmt::Debug {
    /// Closes the handle. Drivers report this through `connection_closed`.
    fn close(&self) -> Result<(), BoxError>;

    fn as_any(&self) -> &dyn Any;
}

/// Receives lifecycle events from a managed connection.
pub trait ConnectionEventListener: Send + Sync {
    /// An application handle was closed.
    fn connection_closed(&self, connection: &AppConnection);

    /// The physical connection failed and must not be reused.
    fn connection_error_occurred(&self, connection: Option<&AppConnection>, error: &str);

    fn local_transaction_started(&self) {}

    fn local_transaction_committed(&self) {}

    fn local_transaction_rolled_back(&self) {}
}

/// Single-resource transaction exposed by a managed connection.
pub trait LocalTransaction: Send + Sync {
    fn begin(&self) -> Result<(), BoxError>;

    fn commit(&self) -> Result<(), BoxError>;

    fn rollback(&self) -> Result<(), BoxError>;
}

/// Two-phase commit participant.
pub trait XaResource: Send + Sync {
    /// Associates the resource with a transaction branch.
    fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaError>;

    /// Dissociates the resource from a transaction branch.
    fn end(&self, xid: &Xid, flags: i32) -> Result<(), XaError>;

    fn prepare(&self, xid: &Xid) -> Result<Vote, XaError>;

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError>;

    fn rollback(&self, xid: &Xid) -> Result<(), XaError>;

    /// Discards knowledge of a heuristically completed branch.
    fn forget(&self, xid: &Xid) -> Result<(), XaError>;

    /// Lists prepared branches.
    fn recover(&self, flags: i32) -> Result<Vec<Xid>, XaError>;

    /// Returns true if `other` is the same resource manager.
    ///
    /// The default compares identity.
    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self as *const Self as *const () == other as *const dyn XaResource as *const ()
    }
}

/// Status of a global transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionStatus {
    Active,
    MarkedRollback,
    Preparing,
    Prepared,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    NoTransaction,
    Unknown,
}

impl TransactionStatus {
    /// Returns true if resources may still be enlisted.
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionStatus::Active)
    }

    /// Returns true while the outcome of the transaction is not yet known.
    pub fn is_unresolved(&self) -> bool {
        !matches!(
            self,
            TransactionStatus::Committed
                | TransactionStatus::RolledBack
                | TransactionStatus::NoTransaction
                | TransactionStatus::Unknown
        )
    }
}

/// Callback invoked around transaction completion.
pub trait Synchronization: Send + Sync {
    fn before_completion(&self) {}

    fn after_completion(&self, status: TransactionStatus);
}

/// A global transaction as seen by resource managers.
pub trait Transaction: Send + Sync {
    fn xid(&self) -> Xid;

    fn status(&self) -> TransactionStatus;

    /// Adds a resource as a participant, starting its branch.
    fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<(), BoxError>;

    /// Ends a participant's branch with `flags` (`TMSUCCESS` or `TMFAIL`).
    fn delist_resource(&self, resource: Arc<dyn XaResource>, flags: i32) -> Result<(), BoxError>;

    fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<(), BoxError>;

    fn set_rollback_only(&self) -> Result<(), BoxError>;
}

/// Gives access to the transaction bound to the calling thread.
pub trait TransactionCoordinator: Send + Sync {
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>>;
}
