//! Sub-pool routing
//!
//! A connection manager owns one [`SubPoolRouter`], which splits requests
//! across lazily created [`PermitGatedPool`]s according to the configured
//! [`PartitionStrategy`]. Optionally transactional and non-transactional
//! requests are kept in separate sub-pools so one kind of work cannot starve
//! the other.

use conduit_core::config::{PartitionStrategy, PoolConfig};
use conduit_core::{ConduitError, Principal, RequestCriteria, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use crate::listener::{ConnectionEventSink, ConnectionListener};
use crate::metrics::PoolStatistics;
use crate::pool::PermitGatedPool;
use crate::spi::ManagedConnectionFactory;
use crate::workers::PoolWorkers;

/// Routing key of one sub-pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubPoolKey {
    pub principal: Option<Principal>,
    pub criteria: Option<RequestCriteria>,
    pub transactional: bool,
}

impl SubPoolKey {
    /// Computes the key for a request under `strategy`.
    pub fn for_request(
        strategy: PartitionStrategy,
        separate_transactional: bool,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
        transactional: bool,
    ) -> Self {
        let (principal, criteria) = match strategy {
            PartitionStrategy::ByPrincipalAndCriteria => {
                (principal.cloned(), Some(criteria.clone()))
            }
            PartitionStrategy::ByPrincipal => (principal.cloned(), None),
            PartitionStrategy::ByCriteria => (None, Some(criteria.clone())),
            PartitionStrategy::Single => (None, None),
        };
        Self {
            principal,
            criteria,
            transactional: separate_transactional && transactional,
        }
    }

    fn label(&self, resource: &str) -> String {
        let mut label = resource.to_string();
        if let Some(principal) = &self.principal {
            label.push_str(&format!("[{}]", principal));
        }
        if let Some(criteria) = &self.criteria {
            if !criteria.is_empty() {
                label.push_str(&criteria.to_string());
            }
        }
        if self.transactional {
            label.push_str("[tx]");
        }
        label
    }
}

/// Routes checkouts to per-key sub-pools.
pub struct SubPoolRouter {
    name: String,
    strategy: PartitionStrategy,
    separate_transactional: bool,
    config: PoolConfig,
    factory: Arc<dyn ManagedConnectionFactory>,
    workers: Arc<PoolWorkers>,
    sink: Weak<dyn ConnectionEventSink>,
    pools: DashMap<SubPoolKey, Arc<PermitGatedPool>>,
    shutdown: AtomicBool,
}

impl SubPoolRouter {
    pub fn new(
        name: impl Into<String>,
        strategy: PartitionStrategy,
        separate_transactional: bool,
        config: PoolConfig,
        factory: Arc<dyn ManagedConnectionFactory>,
        workers: Arc<PoolWorkers>,
        sink: Weak<dyn ConnectionEventSink>,
    ) -> Self {
        Self {
            name: name.into(),
            strategy,
            separate_transactional,
            config,
            factory,
            workers,
            sink,
            pools: DashMap::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn strategy(&self) -> PartitionStrategy {
        self.strategy
    }

    /// Checks a listener out of the sub-pool for this request.
    pub fn checkout(
        &self,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
        transactional: bool,
    ) -> Result<Arc<ConnectionListener>> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ConduitError::Shutdown(self.name.clone()));
        }
        let key = SubPoolKey::for_request(
            self.strategy,
            self.separate_transactional,
            principal,
            criteria,
            transactional,
        );
        let pool = self.sub_pool(key, principal, criteria);
        pool.checkout(principal, criteria)
    }

    /// Sends a listener back to the sub-pool it came from.
    pub fn return_connection(&self, listener: &Arc<ConnectionListener>, kill: bool) {
        match listener.pool() {
            Some(pool) => pool.return_connection(listener, kill),
            None => {
                debug!(resource = %self.name, listener = %listener.id(), "Owning pool is gone, destroying connection");
                listener.destroy();
            }
        }
    }

    fn sub_pool(
        &self,
        key: SubPoolKey,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
    ) -> Arc<PermitGatedPool> {
        if let Some(pool) = self.pools.get(&key) {
            return Arc::clone(pool.value());
        }

        let mut created = false;
        let pool = Arc::clone(
            self.pools
                .entry(key.clone())
                .or_insert_with(|| {
                    created = true;
                    PermitGatedPool::builder(
                        key.label(&self.name),
                        Arc::clone(&self.factory),
                        Arc::clone(&self.workers),
                    )
                    .config(self.config.clone())
                    .principal(principal.cloned())
                    .criteria(criteria.clone())
                    .sink(self.sink.clone())
                    .build()
                })
                .value(),
        );

        if created {
            info!(resource = %self.name, pool = %pool.name(), "Created sub-pool");
            self.workers.register(&pool);
            if self.config.prefill {
                pool.request_fill();
            }
        }
        pool
    }

    /// Flushes every sub-pool.
    pub fn flush(&self) {
        for pool in self.all_pools() {
            pool.flush();
        }
    }

    /// Shuts every sub-pool down and forgets them.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        let pools = self.all_pools();
        self.pools.clear();
        for pool in pools {
            pool.shutdown();
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Statistics summed over all sub-pools.
    pub fn stats(&self) -> PoolStatistics {
        let mut total = PoolStatistics::default();
        for pool in self.all_pools() {
            total.accumulate(&pool.stats());
        }
        total
    }

    fn all_pools(&self) -> Vec<Arc<PermitGatedPool>> {
        self.pools.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::DetachedSink;
    use crate::testkit::InMemoryFactory;

    fn router(
        factory: &Arc<InMemoryFactory>,
        strategy: PartitionStrategy,
        separate_transactional: bool,
    ) -> SubPoolRouter {
        let factory: Arc<dyn ManagedConnectionFactory> = factory.clone();
        let sink: Weak<dyn ConnectionEventSink> = Weak::<DetachedSink>::new();
        SubPoolRouter::new(
            "jdbc/test",
            strategy,
            separate_transactional,
            PoolConfig {
                max_size: 2,
                blocking_timeout_ms: 100,
                ..Default::default()
            },
            factory,
            PoolWorkers::detached(),
            sink,
        )
    }

    #[test]
    fn test_key_strategies() {
        let scott = Principal::new("scott");
        let criteria = RequestCriteria::new().with("schema", "orders");

        let key = SubPoolKey::for_request(
            PartitionStrategy::ByPrincipalAndCriteria,
            false,
            Some(&scott),
            &criteria,
            true,
        );
        assert_eq!(key.principal.as_ref(), Some(&scott));
        assert_eq!(key.criteria.as_ref(), Some(&criteria));
        assert!(!key.transactional);

        let key = SubPoolKey::for_request(PartitionStrategy::ByPrincipal, true, Some(&scott), &criteria, true);
        assert!(key.criteria.is_none());
        assert!(key.transactional);

        let key = SubPoolKey::for_request(PartitionStrategy::ByCriteria, false, Some(&scott), &criteria, false);
        assert!(key.principal.is_none());

        let key = SubPoolKey::for_request(PartitionStrategy::Single, false, Some(&scott), &criteria, false);
        assert_eq!(key, SubPoolKey { principal: None, criteria: None, transactional: false });
    }

    #[test]
    fn test_sub_pools_are_created_per_principal() {
        let factory = InMemoryFactory::new("test");
        let router = router(&factory, PartitionStrategy::ByPrincipal, false);
        let criteria = RequestCriteria::default();

        let scott = Principal::new("scott");
        let alice = Principal::new("alice");

        let a = router.checkout(Some(&scott), &criteria, false).unwrap();
        let b = router.checkout(Some(&alice), &criteria, false).unwrap();
        let c = router.checkout(Some(&scott), &criteria, false).unwrap();
        assert_eq!(router.pool_count(), 2);
        assert!(Arc::ptr_eq(&a.pool().unwrap(), &c.pool().unwrap()));
        assert!(!Arc::ptr_eq(&a.pool().unwrap(), &b.pool().unwrap()));

        let stats = router.stats();
        assert_eq!(stats.in_use, 3);
        assert_eq!(stats.max_size, 4);
        assert_eq!(stats.created, 3);
    }

    #[test]
    fn test_transactional_split() {
        let factory = InMemoryFactory::new("test");
        let router = router(&factory, PartitionStrategy::Single, true);
        let criteria = RequestCriteria::default();

        let _tx = router.checkout(None, &criteria, true).unwrap();
        let _plain = router.checkout(None, &criteria, false).unwrap();
        assert_eq!(router.pool_count(), 2);
    }

    #[test]
    fn test_return_goes_to_owning_sub_pool() {
        let factory = InMemoryFactory::new("test");
        let router = router(&factory, PartitionStrategy::ByCriteria, false);
        let orders = RequestCriteria::new().with("schema", "orders");
        let billing = RequestCriteria::new().with("schema", "billing");

        let a = router.checkout(None, &orders, false).unwrap();
        let _b = router.checkout(None, &billing, false).unwrap();
        router.return_connection(&a, false);

        assert_eq!(a.pool().unwrap().stats().idle, 1);
        assert_eq!(router.stats().idle, 1);
        assert_eq!(router.stats().in_use, 1);
    }

    #[test]
    fn test_shutdown_rejects_checkouts() {
        let factory = InMemoryFactory::new("test");
        let router = router(&factory, PartitionStrategy::Single, false);
        let listener = router.checkout(None, &RequestCriteria::default(), false).unwrap();

        router.shutdown();
        assert_eq!(router.pool_count(), 0);
        assert!(matches!(
            router.checkout(None, &RequestCriteria::default(), false),
            Err(ConduitError::Shutdown(_))
        ));

        router.return_connection(&listener, false);
        assert!(listener.is_destroyed());
    }
}
