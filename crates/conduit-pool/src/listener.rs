//! Connection listener
//!
//! A [`ConnectionListener`] wraps one physical connection for its whole pooled
//! life. It tracks the application handles currently open on the connection,
//! the transaction it is enlisted in, and whether it may go back to the pool.
//! It is also the event listener registered with the driver, forwarding close
//! and error events to the owning connection manager.

use conduit_core::types::ObjectId;
use conduit_core::xa::Xid;
use conduit_core::{BoxError, ConduitError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, error, trace};

use crate::pool::PermitGatedPool;
use crate::spi::{
    same_connection, AppConnection, ConnectionEventListener, ManagedConnection, Transaction,
    XaResource,
};

/// Lifecycle state of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Usable
    Normal,
    /// Destroy instead of pooling on the next return
    MarkedForDestroy,
    /// Physical connection closed
    Destroyed,
}

/// Local transaction lifecycle events reported by drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalTransactionEvent {
    Started,
    Committed,
    RolledBack,
}

/// Receives driver events on behalf of a pool's owner.
pub trait ConnectionEventSink: Send + Sync {
    fn connection_closed(&self, listener: &Arc<ConnectionListener>, connection: &AppConnection);

    fn connection_error_occurred(
        &self,
        listener: &Arc<ConnectionListener>,
        connection: Option<&AppConnection>,
        error: &str,
    );

    fn local_transaction_event(
        &self,
        listener: &Arc<ConnectionListener>,
        event: LocalTransactionEvent,
    ) {
        trace!(listener = %listener.id(), ?event, "Local transaction event");
    }
}

/// Sink used by pools that have no connection manager.
pub(crate) struct DetachedSink;

impl ConnectionEventSink for DetachedSink {
    fn connection_closed(&self, _listener: &Arc<ConnectionListener>, _connection: &AppConnection) {}

    fn connection_error_occurred(
        &self,
        _listener: &Arc<ConnectionListener>,
        _connection: Option<&AppConnection>,
        _error: &str,
    ) {
    }
}

/// A transaction the listener's resource is enlisted in.
#[derive(Clone)]
pub struct Enlistment {
    pub transaction: Arc<dyn Transaction>,
    pub xid: Xid,
    pub resource: Arc<dyn XaResource>,
}

impl fmt::Debug for Enlistment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enlistment").field("xid", &self.xid).finish()
    }
}

struct ListenerInner {
    state: ListenerState,
    last_used: Instant,
    handles: Vec<AppConnection>,
    enlistment: Option<Enlistment>,
    bound: Option<Arc<dyn Transaction>>,
    xa_resource: Option<Arc<dyn XaResource>>,
}

/// Tracks one pooled physical connection.
pub struct ConnectionListener {
    id: ObjectId,
    managed: Arc<dyn ManagedConnection>,
    pool: Weak<PermitGatedPool>,
    sink: Weak<dyn ConnectionEventSink>,
    created_at: Instant,
    inner: Mutex<ListenerInner>,
    this: Weak<ConnectionListener>,
}

impl ConnectionListener {
    /// Wraps a freshly created managed connection and registers for its events.
    pub fn new(
        managed: Arc<dyn ManagedConnection>,
        pool: Weak<PermitGatedPool>,
        sink: Weak<dyn ConnectionEventSink>,
    ) -> Arc<Self> {
        let now = Instant::now();
        let listener = Arc::new_cyclic(|this| Self {
            id: ObjectId::next(),
            managed: Arc::clone(&managed),
            pool,
            sink,
            created_at: now,
            inner: Mutex::new(ListenerInner {
                state: ListenerState::Normal,
                last_used: now,
                handles: Vec::new(),
                enlistment: None,
                bound: None,
                xa_resource: None,
            }),
            this: this.clone(),
        });

        let events: Weak<dyn ConnectionEventListener> = Arc::downgrade(&listener) as Weak<Self>;
        managed.add_connection_event_listener(events);
        listener
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn managed_connection(&self) -> &Arc<dyn ManagedConnection> {
        &self.managed
    }

    /// The sub-pool that owns this listener, if it still exists.
    pub fn pool(&self) -> Option<Arc<PermitGatedPool>> {
        self.pool.upgrade()
    }

    pub fn state(&self) -> ListenerState {
        self.inner.lock().state
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == ListenerState::Destroyed
    }

    pub fn is_marked_for_destroy(&self) -> bool {
        self.state() == ListenerState::MarkedForDestroy
    }

    /// Flags the listener to be destroyed rather than pooled when returned.
    pub fn mark_for_destroy(&self) {
        let mut inner = self.inner.lock();
        if inner.state == ListenerState::Normal {
            inner.state = ListenerState::MarkedForDestroy;
        }
    }

    pub fn last_used(&self) -> Instant {
        self.inner.lock().last_used
    }

    pub(crate) fn touch(&self) {
        self.inner.lock().last_used = Instant::now();
    }

    /// Closes the physical connection. Returns false if it was already destroyed.
    pub fn destroy(&self) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.state == ListenerState::Destroyed {
                return false;
            }
            inner.state = ListenerState::Destroyed;
            inner.handles.clear();
            inner.bound = None;
            inner.enlistment = None;
        }

        if let Err(e) = self.managed.destroy() {
            error!(listener = %self.id, error = %e, "Failed to destroy managed connection");
        } else {
            debug!(
                listener = %self.id,
                age = ?self.created_at.elapsed(),
                "Managed connection destroyed"
            );
        }
        true
    }

    // ------------------------------------------------------------------
    // Application handles
    // ------------------------------------------------------------------

    pub fn register_handle(&self, connection: AppConnection) {
        self.inner.lock().handles.push(connection);
    }

    /// Removes a handle. Returns false if it was not registered.
    pub fn unregister_handle(&self, connection: &AppConnection) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.handles.len();
        inner.handles.retain(|h| !same_connection(h, connection));
        inner.handles.len() != before
    }

    /// Removes and returns every registered handle.
    pub fn unregister_all_handles(&self) -> Vec<AppConnection> {
        std::mem::take(&mut self.inner.lock().handles)
    }

    pub fn handle_count(&self) -> usize {
        self.inner.lock().handles.len()
    }

    pub fn has_handles(&self) -> bool {
        !self.inner.lock().handles.is_empty()
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn enlistment(&self) -> Option<Enlistment> {
        self.inner.lock().enlistment.clone()
    }

    pub fn enlisted_xid(&self) -> Option<Xid> {
        self.inner.lock().enlistment.as_ref().map(|e| e.xid.clone())
    }

    pub fn is_enlisted(&self) -> bool {
        self.inner.lock().enlistment.is_some()
    }

    pub(crate) fn set_enlistment(&self, enlistment: Enlistment) {
        self.inner.lock().enlistment = Some(enlistment);
    }

    pub(crate) fn take_enlistment(&self) -> Option<Enlistment> {
        self.inner.lock().enlistment.take()
    }

    /// Forgets the enlistment if it is for `xid`.
    pub(crate) fn clear_enlistment_for(&self, xid: &Xid) {
        let mut inner = self.inner.lock();
        if inner.enlistment.as_ref().is_some_and(|e| &e.xid == xid) {
            inner.enlistment = None;
        }
    }

    /// The transaction this listener is reserved for, when tracking by transaction.
    pub fn bound_transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.inner.lock().bound.clone()
    }

    pub(crate) fn bind_transaction(&self, transaction: Arc<dyn Transaction>) {
        self.inner.lock().bound = Some(transaction);
    }

    pub(crate) fn unbind_transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.inner.lock().bound.take()
    }

    /// Returns the XA resource for this connection, creating it on first use.
    ///
    /// The same resource instance is returned for every enlistment so the
    /// coordinator can recognise it on delist.
    pub fn xa_resource_with<F>(&self, create: F) -> Result<Arc<dyn XaResource>>
    where
        F: FnOnce() -> std::result::Result<Arc<dyn XaResource>, BoxError>,
    {
        if let Some(resource) = self.inner.lock().xa_resource.clone() {
            return Ok(resource);
        }

        let resource = create().map_err(|e| {
            ConduitError::enlistment_caused("Could not obtain XA resource", e)
        })?;

        let mut inner = self.inner.lock();
        Ok(Arc::clone(inner.xa_resource.get_or_insert(resource)))
    }

    fn strong(&self) -> Option<Arc<ConnectionListener>> {
        self.this.upgrade()
    }

    fn return_without_manager(this: &Arc<ConnectionListener>, kill: bool) {
        match this.pool() {
            Some(pool) => pool.return_connection(this, kill),
            None => {
                this.destroy();
            }
        }
    }
}

impl ConnectionEventListener for ConnectionListener {
    fn connection_closed(&self, connection: &AppConnection) {
        let Some(this) = self.strong() else {
            return;
        };
        match self.sink.upgrade() {
            Some(sink) => sink.connection_closed(&this, connection),
            None => {
                this.unregister_handle(connection);
                if !this.has_handles() {
                    Self::return_without_manager(&this, false);
                }
            }
        }
    }

    fn connection_error_occurred(&self, connection: Option<&AppConnection>, error: &str) {
        let Some(this) = self.strong() else {
            return;
        };
        match self.sink.upgrade() {
            Some(sink) => sink.connection_error_occurred(&this, connection, error),
            None => {
                this.mark_for_destroy();
                this.unregister_all_handles();
                Self::return_without_manager(&this, true);
            }
        }
    }

    fn local_transaction_started(&self) {
        if let (Some(this), Some(sink)) = (self.strong(), self.sink.upgrade()) {
            sink.local_transaction_event(&this, LocalTransactionEvent::Started);
        }
    }

    fn local_transaction_committed(&self) {
        if let (Some(this), Some(sink)) = (self.strong(), self.sink.upgrade()) {
            sink.local_transaction_event(&this, LocalTransactionEvent::Committed);
        }
    }

    fn local_transaction_rolled_back(&self) {
        if let (Some(this), Some(sink)) = (self.strong(), self.sink.upgrade()) {
            sink.local_transaction_event(&this, LocalTransactionEvent::RolledBack);
        }
    }
}

impl fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("ConnectionListener")
            .field("id", &self.id)
            .field("state", &inner.state)
            .field("handles", &inner.handles.len())
            .field("enlistment", &inner.enlistment)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::InMemoryFactory;
    use crate::spi::ManagedConnectionFactory;
    use conduit_core::RequestCriteria;

    fn detached() -> Weak<dyn ConnectionEventSink> {
        Weak::<DetachedSink>::new()
    }

    fn listener(factory: &InMemoryFactory) -> Arc<ConnectionListener> {
        let mc = factory
            .create_managed_connection(None, &RequestCriteria::default())
            .unwrap();
        ConnectionListener::new(mc, Weak::new(), detached())
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let factory = InMemoryFactory::new("test");
        let cl = listener(&factory);

        assert!(cl.destroy());
        assert!(!cl.destroy());
        assert!(cl.is_destroyed());
        assert_eq!(factory.destroyed_count(), 1);
    }

    #[test]
    fn test_mark_for_destroy_does_not_revive() {
        let factory = InMemoryFactory::new("test");
        let cl = listener(&factory);

        cl.mark_for_destroy();
        assert_eq!(cl.state(), ListenerState::MarkedForDestroy);
        cl.destroy();
        cl.mark_for_destroy();
        assert_eq!(cl.state(), ListenerState::Destroyed);
    }

    #[test]
    fn test_handle_registration_by_identity() {
        let factory = InMemoryFactory::new("test");
        let cl = listener(&factory);
        let criteria = RequestCriteria::default();

        let a = cl.managed_connection().connection_handle(None, &criteria).unwrap();
        let b = cl.managed_connection().connection_handle(None, &criteria).unwrap();
        cl.register_handle(a.clone());
        cl.register_handle(b.clone());
        assert_eq!(cl.handle_count(), 2);

        assert!(cl.unregister_handle(&a));
        assert!(!cl.unregister_handle(&a));
        assert_eq!(cl.handle_count(), 1);

        let rest = cl.unregister_all_handles();
        assert_eq!(rest.len(), 1);
        assert!(same_connection(&rest[0], &b));
        assert!(!cl.has_handles());
    }

    #[test]
    fn test_xa_resource_is_cached() {
        let factory = InMemoryFactory::new("test");
        let cl = listener(&factory);

        let mc = Arc::clone(cl.managed_connection());
        let first = cl.xa_resource_with(|| mc.xa_resource()).unwrap();
        let second = cl
            .xa_resource_with(|| Err("should not be called".into()))
            .unwrap();
        assert!(first.is_same_rm(second.as_ref()));
    }
}
