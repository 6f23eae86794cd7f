//! Connection manager
//!
//! Ties the pieces together for one resource: requests are routed to a
//! sub-pool, the checked-out connection is enlisted in the caller's
//! transaction through the configured [`EnlistmentPolicy`], and the handed
//! out application connection is recorded with the association cache.
//!
//! The manager is also the event sink for its connections. A listener goes
//! back to its pool only once it is free: no open application handles and,
//! when tracking by transaction, no unresolved transaction it is reserved for.

use conduit_core::config::{ConnectionManagerConfig, TransactionSupport};
use conduit_core::types::ObjectId;
use conduit_core::xa::Xid;
use conduit_core::{ConduitError, Principal, RequestCriteria, Result};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, info, warn};

use crate::association::{AssociationCache, ConnectionCacheListener, ConnectionRecord};
use crate::enlistment::{policy_for, EnlistmentPolicy};
use crate::listener::{ConnectionEventSink, ConnectionListener, LocalTransactionEvent};
use crate::metrics::PoolStatistics;
use crate::router::SubPoolRouter;
use crate::spi::{
    AppConnection, ManagedConnectionFactory, Synchronization, Transaction,
    TransactionCoordinator, TransactionStatus,
};
use crate::workers::PoolWorkers;

/// Snapshot of a manager and its sub-pools.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStatistics {
    pub resource_name: String,
    pub sub_pools: usize,
    pub pool: PoolStatistics,
    pub bound_transactions: usize,
}

/// Builder for [`ConnectionManager`].
pub struct ConnectionManagerBuilder {
    config: ConnectionManagerConfig,
    factory: Arc<dyn ManagedConnectionFactory>,
    workers: Option<Arc<PoolWorkers>>,
    coordinator: Option<Arc<dyn TransactionCoordinator>>,
    cache: Option<Arc<AssociationCache>>,
}

impl ConnectionManagerBuilder {
    /// Background workers; the process-wide ones are used if unset.
    pub fn workers(mut self, workers: Arc<PoolWorkers>) -> Self {
        self.workers = Some(workers);
        self
    }

    pub fn coordinator(mut self, coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    pub fn association_cache(mut self, cache: Arc<AssociationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<Arc<ConnectionManager>> {
        self.config.validate()?;
        let workers = match self.workers {
            Some(workers) => workers,
            None => PoolWorkers::global()?,
        };

        let config = self.config;
        let support = config.transaction_support;
        let track_by_tx = support == TransactionSupport::Local
            || (config.track_connection_by_tx && support.is_transactional());

        let manager = Arc::new_cyclic(|this: &Weak<ConnectionManager>| {
            let sink: Weak<dyn ConnectionEventSink> = this.clone();
            let router = SubPoolRouter::new(
                config.resource_name.clone(),
                config.partition,
                config.separate_transactional_pools,
                config.pool.clone(),
                Arc::clone(&self.factory),
                workers,
                sink,
            );
            ConnectionManager {
                id: ObjectId::next(),
                policy: policy_for(support),
                config,
                factory: self.factory,
                router,
                coordinator: self.coordinator,
                cache: self.cache,
                track_by_tx,
                tx_bindings: DashMap::new(),
                shutdown: AtomicBool::new(false),
                this: this.clone(),
            }
        });

        info!(
            resource = %manager.resource_name(),
            transaction_support = ?support,
            track_by_tx,
            "Connection manager started"
        );
        Ok(manager)
    }
}

/// Allocates pooled connections for one resource.
pub struct ConnectionManager {
    id: ObjectId,
    config: ConnectionManagerConfig,
    factory: Arc<dyn ManagedConnectionFactory>,
    router: SubPoolRouter,
    policy: Box<dyn EnlistmentPolicy>,
    coordinator: Option<Arc<dyn TransactionCoordinator>>,
    cache: Option<Arc<AssociationCache>>,
    track_by_tx: bool,
    tx_bindings: DashMap<Xid, Arc<ConnectionListener>>,
    shutdown: AtomicBool,
    this: Weak<ConnectionManager>,
}

impl ConnectionManager {
    pub fn builder(
        config: ConnectionManagerConfig,
        factory: Arc<dyn ManagedConnectionFactory>,
    ) -> ConnectionManagerBuilder {
        ConnectionManagerBuilder {
            config,
            factory,
            workers: None,
            coordinator: None,
            cache: None,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn config(&self) -> &ConnectionManagerConfig {
        &self.config
    }

    pub fn transaction_support(&self) -> TransactionSupport {
        self.config.transaction_support
    }

    /// Whether one connection is reserved per transaction.
    pub fn tracks_by_transaction(&self) -> bool {
        self.track_by_tx
    }

    pub fn router(&self) -> &SubPoolRouter {
        &self.router
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Hands out an application connection for `principal` and `criteria`.
    ///
    /// `factory` must be the factory this manager was built with.
    pub fn allocate_connection(
        &self,
        factory: &dyn ManagedConnectionFactory,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
    ) -> Result<AppConnection> {
        if factory.name() != self.factory.name() {
            return Err(ConduitError::WrongFactory {
                expected: self.factory.name().to_string(),
                actual: factory.name().to_string(),
            });
        }
        if self.is_shutdown() {
            return Err(ConduitError::Shutdown(self.resource_name().to_string()));
        }

        let transaction = self.current_transaction();
        let (listener, fresh) =
            self.acquire_listener(principal, criteria, transaction.as_ref())?;

        match self.connect(&listener, principal, criteria, transaction.as_ref()) {
            Ok(connection) => Ok(connection),
            Err(e) => {
                warn!(
                    resource = %self.resource_name(),
                    listener = %listener.id(),
                    error = %e,
                    "Connection allocation failed"
                );
                if fresh {
                    self.release_failed(&listener);
                }
                Err(e)
            }
        }
    }

    fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        if !self.policy.is_transactional() {
            return None;
        }
        self.coordinator
            .as_ref()?
            .current_transaction()
            .filter(|tx| tx.status().is_active())
    }

    fn acquire_listener(
        &self,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
        transaction: Option<&Arc<dyn Transaction>>,
    ) -> Result<(Arc<ConnectionListener>, bool)> {
        if self.track_by_tx {
            if let Some(tx) = transaction {
                let xid = tx.xid();
                let bound = self.tx_bindings.get(&xid).map(|e| Arc::clone(e.value()));
                if let Some(bound) = bound {
                    if !bound.is_destroyed() && !bound.is_marked_for_destroy() {
                        debug!(listener = %bound.id(), xid = %xid, "Reusing connection bound to transaction");
                        return Ok((bound, false));
                    }
                    self.tx_bindings.remove(&xid);
                }
            }
        }

        let listener = self.checkout_with_retry(principal, criteria, transaction.is_some())?;
        if self.track_by_tx {
            if let Some(tx) = transaction {
                if let Err(e) = self.bind(&listener, tx) {
                    self.router.return_connection(&listener, false);
                    return Err(e);
                }
            }
        }
        Ok((listener, true))
    }

    fn checkout_with_retry(
        &self,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
        transactional: bool,
    ) -> Result<Arc<ConnectionListener>> {
        let attempts = self.config.allocation_retry.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.router.checkout(principal, criteria, transactional) {
                Ok(listener) => return Ok(listener),
                Err(e @ ConduitError::Shutdown(_)) => return Err(e),
                Err(e) if attempt < attempts => {
                    warn!(
                        resource = %self.resource_name(),
                        attempt,
                        error = %e,
                        "Checkout failed, retrying"
                    );
                    thread::sleep(self.config.allocation_retry_wait());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn bind(&self, listener: &Arc<ConnectionListener>, tx: &Arc<dyn Transaction>) -> Result<()> {
        let xid = tx.xid();
        let completion = Arc::new(TxCompletion {
            manager: self.this.clone(),
            xid: xid.clone(),
        });
        tx.register_synchronization(completion).map_err(|e| {
            ConduitError::enlistment_caused(
                format!("Could not track connection for transaction {}", xid),
                e,
            )
        })?;

        listener.bind_transaction(Arc::clone(tx));
        self.tx_bindings.insert(xid.clone(), Arc::clone(listener));
        debug!(listener = %listener.id(), xid = %xid, "Bound connection to transaction");
        Ok(())
    }

    fn unbind(&self, listener: &Arc<ConnectionListener>) {
        if let Some(tx) = listener.unbind_transaction() {
            self.tx_bindings
                .remove_if(&tx.xid(), |_, bound| Arc::ptr_eq(bound, listener));
        }
    }

    fn connect(
        &self,
        listener: &Arc<ConnectionListener>,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
        transaction: Option<&Arc<dyn Transaction>>,
    ) -> Result<AppConnection> {
        if let Some(tx) = transaction {
            self.policy.enlist(listener, tx)?;
        }

        let connection = listener
            .managed_connection()
            .connection_handle(principal, criteria)
            .map_err(|e| ConduitError::resource("Could not obtain a connection handle", e))?;
        listener.register_handle(Arc::clone(&connection));

        if let (Some(cache), Some(this)) = (&self.cache, self.this.upgrade()) {
            let this: Arc<dyn ConnectionCacheListener> = this;
            cache.register_connection(
                &this,
                Arc::clone(listener),
                Arc::clone(&connection),
                principal.cloned(),
                criteria.clone(),
            );
        }
        Ok(connection)
    }

    fn release_failed(&self, listener: &Arc<ConnectionListener>) {
        listener.mark_for_destroy();
        if let Err(e) = self.policy.delist(listener) {
            debug!(listener = %listener.id(), error = %e, "Delist failed while releasing connection");
        }
        self.unbind(listener);
        self.router.return_connection(listener, true);
    }

    /// True if the listener may go back to its pool.
    pub fn is_managed_connection_free(&self, listener: &ConnectionListener) -> bool {
        if listener.has_handles() {
            return false;
        }
        if self.track_by_tx {
            if let Some(tx) = listener.bound_transaction() {
                if tx.status().is_unresolved() {
                    return false;
                }
            }
        }
        true
    }

    /// Delists a free listener and returns it to its pool.
    fn return_if_free(&self, listener: &Arc<ConnectionListener>) -> Result<()> {
        if !self.is_managed_connection_free(listener) {
            return Ok(());
        }
        let delisted = self.policy.delist(listener);
        self.unbind(listener);
        self.router.return_connection(listener, delisted.is_err());
        delisted
    }

    /// Called once the transaction a listener was reserved for has completed.
    fn transaction_completed(&self, xid: &Xid, status: TransactionStatus) {
        let Some((_, listener)) = self.tx_bindings.remove(xid) else {
            return;
        };
        listener.unbind_transaction();
        listener.clear_enlistment_for(xid);
        debug!(listener = %listener.id(), xid = %xid, ?status, "Transaction completed");

        if !listener.has_handles() {
            self.router.return_connection(&listener, false);
        }
    }

    /// Destroys idle connections and retires checked-out ones on return.
    pub fn flush(&self) {
        info!(resource = %self.resource_name(), "Flushing connection manager");
        self.router.flush();
    }

    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(resource = %self.resource_name(), "Shutting down connection manager");
        self.tx_bindings.clear();
        self.router.shutdown();
    }

    pub fn stats(&self) -> ManagerStatistics {
        ManagerStatistics {
            resource_name: self.resource_name().to_string(),
            sub_pools: self.router.pool_count(),
            pool: self.router.stats(),
            bound_transactions: self.tx_bindings.len(),
        }
    }

    fn reconnect_records(
        &self,
        records: &[Arc<ConnectionRecord>],
        transaction: Option<&Arc<dyn Transaction>>,
        acquired: &mut Vec<Arc<ConnectionListener>>,
    ) -> Result<()> {
        let mut by_request: HashMap<(Option<Principal>, RequestCriteria), Arc<ConnectionListener>> =
            HashMap::new();

        for record in records {
            let key = (record.principal().cloned(), record.criteria().clone());
            let listener = match by_request.get(&key) {
                Some(listener) => Arc::clone(listener),
                None => {
                    let (listener, fresh) =
                        self.acquire_listener(record.principal(), record.criteria(), transaction)?;
                    if fresh {
                        acquired.push(Arc::clone(&listener));
                    }
                    if let Some(tx) = transaction {
                        self.policy.enlist(&listener, tx)?;
                    }
                    by_request.insert(key, Arc::clone(&listener));
                    listener
                }
            };

            listener
                .managed_connection()
                .associate_connection(record.connection())
                .map_err(|e| ConduitError::resource("Could not re-associate connection", e))?;
            listener.register_handle(Arc::clone(record.connection()));
            record.set_listener(listener);
        }
        Ok(())
    }
}

impl ConnectionEventSink for ConnectionManager {
    fn connection_closed(&self, listener: &Arc<ConnectionListener>, connection: &AppConnection) {
        if let Some(cache) = &self.cache {
            cache.unregister_connection(self.id, connection);
        }
        if !listener.unregister_handle(connection) {
            debug!(listener = %listener.id(), "Closed connection was not registered");
        }

        if let Err(e) = self.return_if_free(listener) {
            warn!(
                resource = %self.resource_name(),
                listener = %listener.id(),
                error = %e,
                "Delist failed on close, destroying connection"
            );
        }
    }

    fn connection_error_occurred(
        &self,
        listener: &Arc<ConnectionListener>,
        _connection: Option<&AppConnection>,
        error: &str,
    ) {
        warn!(
            resource = %self.resource_name(),
            listener = %listener.id(),
            error,
            "Connection error, destroying connection"
        );
        listener.mark_for_destroy();
        for handle in listener.unregister_all_handles() {
            if let Some(cache) = &self.cache {
                cache.unregister_connection(self.id, &handle);
            }
        }
        if let Err(e) = self.policy.delist(listener) {
            debug!(listener = %listener.id(), error = %e, "Delist failed after connection error");
        }
        self.unbind(listener);
        self.router.return_connection(listener, true);
    }

    fn local_transaction_event(
        &self,
        listener: &Arc<ConnectionListener>,
        event: LocalTransactionEvent,
    ) {
        debug!(
            resource = %self.resource_name(),
            listener = %listener.id(),
            ?event,
            "Local transaction event"
        );
    }
}

impl ConnectionCacheListener for ConnectionManager {
    fn manager_id(&self) -> ObjectId {
        self.id
    }

    fn resource_name(&self) -> &str {
        &self.config.resource_name
    }

    fn transaction_started(&self, records: &[Arc<ConnectionRecord>]) -> Result<()> {
        let Some(tx) = self.current_transaction() else {
            return Ok(());
        };
        let xid = tx.xid();
        let mut seen = HashSet::new();

        for record in records {
            let Some(listener) = record.listener() else {
                continue;
            };
            if !seen.insert(listener.id()) {
                continue;
            }
            self.policy.enlist(&listener, &tx)?;
            if self.track_by_tx
                && listener.bound_transaction().is_none()
                && !self.tx_bindings.contains_key(&xid)
            {
                self.bind(&listener, &tx)?;
            }
        }
        Ok(())
    }

    fn reconnect(
        &self,
        records: &[Arc<ConnectionRecord>],
        unsharable: &HashSet<String>,
    ) -> Result<()> {
        if unsharable.contains(self.resource_name()) || records.is_empty() {
            return Ok(());
        }
        let transaction = self.current_transaction();
        let mut acquired = Vec::new();

        let result = self.reconnect_records(records, transaction.as_ref(), &mut acquired);
        if result.is_err() {
            let ids: HashSet<ObjectId> = acquired.iter().map(|l| l.id()).collect();
            for record in records {
                if record.listener().is_some_and(|l| ids.contains(&l.id())) {
                    record.take_listener();
                }
            }
            for listener in &acquired {
                listener.unregister_all_handles();
                self.release_failed(listener);
            }
        }
        result
    }

    fn disconnect(
        &self,
        records: &[Arc<ConnectionRecord>],
        unsharable: &HashSet<String>,
    ) -> Result<()> {
        if unsharable.contains(self.resource_name()) {
            return Ok(());
        }

        let mut seen = HashSet::new();
        let mut listeners = Vec::new();
        for record in records {
            let Some(listener) = record.take_listener() else {
                continue;
            };
            listener.unregister_handle(record.connection());
            if seen.insert(listener.id()) {
                listeners.push(listener);
            }
        }

        let mut first_error = None;
        for listener in &listeners {
            if let Err(e) = self.return_if_free(listener) {
                first_error.get_or_insert(e);
            }
        }
        debug!(
            resource = %self.resource_name(),
            connections = listeners.len(),
            "Disconnected connections"
        );
        first_error.map_or(Ok(()), Err)
    }
}

/// Releases the listener reserved for a transaction once it completes.
struct TxCompletion {
    manager: Weak<ConnectionManager>,
    xid: Xid,
}

impl Synchronization for TxCompletion {
    fn after_completion(&self, status: TransactionStatus) {
        if let Some(manager) = self.manager.upgrade() {
            manager.transaction_completed(&self.xid, status);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{InMemoryCoordinator, InMemoryFactory, InMemoryHandle, XaCall};
    use conduit_core::config::{AssociationCacheConfig, PoolConfig};
    use conduit_core::xa::{TMNOFLAGS, TMSUCCESS};

    fn config(support: TransactionSupport) -> ConnectionManagerConfig {
        ConnectionManagerConfig {
            transaction_support: support,
            pool: PoolConfig {
                max_size: 2,
                blocking_timeout_ms: 50,
                ..Default::default()
            },
            ..ConnectionManagerConfig::new("jdbc/test")
        }
    }

    fn manager(
        factory: &Arc<InMemoryFactory>,
        config: ConnectionManagerConfig,
        coordinator: Option<Arc<InMemoryCoordinator>>,
        cache: Option<Arc<AssociationCache>>,
    ) -> Arc<ConnectionManager> {
        let mut builder = ConnectionManager::builder(config, factory.clone())
            .workers(PoolWorkers::detached());
        if let Some(coordinator) = coordinator {
            builder = builder.coordinator(coordinator);
        }
        if let Some(cache) = cache {
            builder = builder.association_cache(cache);
        }
        builder.build().unwrap()
    }

    fn handle(connection: &AppConnection) -> &InMemoryHandle {
        connection.as_any().downcast_ref::<InMemoryHandle>().unwrap()
    }

    #[test]
    fn test_allocate_and_close_returns_to_pool() {
        let factory = InMemoryFactory::new("test");
        let manager = manager(&factory, config(TransactionSupport::None), None, None);
        let criteria = RequestCriteria::default();

        let connection = manager
            .allocate_connection(factory.as_ref(), None, &criteria)
            .unwrap();
        assert_eq!(manager.stats().pool.in_use, 1);

        connection.close().unwrap();
        let stats = manager.stats();
        assert_eq!(stats.pool.in_use, 0);
        assert_eq!(stats.pool.idle, 1);

        let again = manager
            .allocate_connection(factory.as_ref(), None, &criteria)
            .unwrap();
        assert_eq!(factory.created_count(), 1);
        assert_eq!(handle(&again).managed_id(), handle(&connection).managed_id());
    }

    #[test]
    fn test_wrong_factory_is_rejected() {
        let factory = InMemoryFactory::new("test");
        let other = InMemoryFactory::new("other");
        let manager = manager(&factory, config(TransactionSupport::None), None, None);

        let err = manager
            .allocate_connection(other.as_ref(), None, &RequestCriteria::default())
            .unwrap_err();
        assert!(matches!(err, ConduitError::WrongFactory { .. }));
    }

    #[test]
    fn test_shared_listener_returns_after_last_close() {
        let factory = InMemoryFactory::new("test");
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let mut cfg = config(TransactionSupport::Xa);
        cfg.track_connection_by_tx = true;
        let manager = manager(&factory, cfg, Some(coordinator.clone()), None);
        let criteria = RequestCriteria::default();

        let tx = coordinator.begin().unwrap();
        let a = manager.allocate_connection(factory.as_ref(), None, &criteria).unwrap();
        let b = manager.allocate_connection(factory.as_ref(), None, &criteria).unwrap();
        assert_eq!(factory.created_count(), 1);
        assert_eq!(manager.stats().bound_transactions, 1);

        a.close().unwrap();
        b.close().unwrap();
        assert_eq!(manager.stats().pool.in_use, 1, "still reserved for the transaction");

        coordinator.commit().unwrap();
        let stats = manager.stats();
        assert_eq!(stats.pool.in_use, 0);
        assert_eq!(stats.pool.idle, 1);
        assert_eq!(stats.bound_transactions, 0);

        let calls = factory.connection(0).unwrap().xa().calls();
        assert_eq!(calls[0], XaCall::Start(tx.xid(), TMNOFLAGS));
        assert!(calls.contains(&XaCall::Commit(tx.xid(), true)));
    }

    #[test]
    fn test_close_without_tracking_delists_and_returns() {
        let factory = InMemoryFactory::new("test");
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let manager = manager(&factory, config(TransactionSupport::Xa), Some(coordinator.clone()), None);

        let tx = coordinator.begin().unwrap();
        let connection = manager
            .allocate_connection(factory.as_ref(), None, &RequestCriteria::default())
            .unwrap();
        connection.close().unwrap();

        assert_eq!(manager.stats().pool.idle, 1);
        let calls = factory.connection(0).unwrap().xa().calls();
        assert_eq!(
            calls,
            vec![XaCall::Start(tx.xid(), TMNOFLAGS), XaCall::End(tx.xid(), TMSUCCESS)]
        );
        coordinator.commit().unwrap();
    }

    #[test]
    fn test_connection_error_destroys_listener() {
        let factory = InMemoryFactory::new("test");
        let manager = manager(&factory, config(TransactionSupport::None), None, None);

        let _connection = manager
            .allocate_connection(factory.as_ref(), None, &RequestCriteria::default())
            .unwrap();
        factory.connection(0).unwrap().fire_error("socket reset");

        let stats = manager.stats();
        assert_eq!(stats.pool.in_use, 0);
        assert_eq!(stats.pool.idle, 0);
        assert_eq!(factory.destroyed_count(), 1);
    }

    #[test]
    fn test_failed_enlistment_destroys_fresh_listener() {
        let factory = InMemoryFactory::new("test");
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let manager = manager(&factory, config(TransactionSupport::Local), Some(coordinator.clone()), None);
        factory.fail_local_begins(true);

        coordinator.begin().unwrap();
        let err = manager
            .allocate_connection(factory.as_ref(), None, &RequestCriteria::default())
            .unwrap_err();
        assert!(matches!(err, ConduitError::Enlistment { .. }));
        assert_eq!(factory.destroyed_count(), 1);
        assert_eq!(manager.stats().pool.in_use, 0);
        assert_eq!(manager.stats().bound_transactions, 0);
        coordinator.rollback().unwrap();
    }

    #[test]
    fn test_failed_local_commit_destroys_connection() {
        let factory = InMemoryFactory::new("test");
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let manager = manager(&factory, config(TransactionSupport::Local), Some(coordinator.clone()), None);

        coordinator.begin().unwrap();
        let connection = manager
            .allocate_connection(factory.as_ref(), None, &RequestCriteria::default())
            .unwrap();
        let local = factory.connection(0).unwrap().local();
        assert_eq!(local.begins(), 1);
        local.fail_commit(true);

        assert!(coordinator.commit().is_err());

        assert_eq!(factory.destroyed_count(), 1);
        assert!(factory.connection(0).unwrap().is_destroyed());
        let stats = manager.stats();
        assert_eq!(stats.pool.created - stats.pool.destroyed, 0);
        assert_eq!(stats.pool.in_use, 0);
        assert_eq!(stats.bound_transactions, 0);

        connection.close().unwrap();
        assert_eq!(manager.stats().pool.idle, 0);
    }

    #[test]
    fn test_local_support_tracks_by_transaction() {
        let factory = InMemoryFactory::new("test");
        let manager = manager(&factory, config(TransactionSupport::Local), None, None);
        assert!(manager.tracks_by_transaction());

        let manager2 = manager_for_none(&factory);
        assert!(!manager2.tracks_by_transaction());
    }

    fn manager_for_none(factory: &Arc<InMemoryFactory>) -> Arc<ConnectionManager> {
        manager(factory, config(TransactionSupport::None), None, None)
    }

    #[test]
    fn test_disconnect_and_reconnect_repoint_records() {
        let factory = InMemoryFactory::new("test");
        let cache = Arc::new(AssociationCache::new(
            AssociationCacheConfig {
                spec_compliant: true,
                debug: false,
            },
            None,
        ));
        let manager = manager(&factory, config(TransactionSupport::None), None, Some(cache.clone()));
        let criteria = RequestCriteria::default();
        let key = crate::association::ContextKey::new("bean");

        let guard = cache.enter_context(key.clone(), HashSet::new()).unwrap();
        let connection = manager.allocate_connection(factory.as_ref(), None, &criteria).unwrap();
        assert_eq!(cache.registered_connections(), 1);
        guard.exit();

        let stats = manager.stats();
        assert_eq!(stats.pool.in_use, 0);
        assert_eq!(stats.pool.idle, 1);

        let guard = cache.enter_context(key, HashSet::new()).unwrap();
        assert_eq!(manager.stats().pool.in_use, 1);
        assert_eq!(factory.created_count(), 1);
        assert!(!handle(&connection).is_closed());

        connection.close().unwrap();
        assert_eq!(cache.registered_connections(), 0);
        assert_eq!(manager.stats().pool.idle, 1);
        drop(guard);
    }

    #[test]
    fn test_shutdown_rejects_allocation() {
        let factory = InMemoryFactory::new("test");
        let manager = manager_for_none(&factory);
        manager.shutdown();
        let err = manager
            .allocate_connection(factory.as_ref(), None, &RequestCriteria::default())
            .unwrap_err();
        assert!(matches!(err, ConduitError::Shutdown(_)));
    }
}
