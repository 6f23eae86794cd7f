//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use conduit_core::config::{
    AssociationCacheConfig, ConnectionManagerConfig, PoolConfig, TransactionSupport,
};
use conduit_core::{ObjectId, Result};
use conduit_pool::testkit::{InMemoryCoordinator, InMemoryFactory, InMemoryHandle};
use conduit_pool::{
    AppConnection, AssociationCache, ConnectionCacheListener, ConnectionManager, ConnectionRecord,
    PoolWorkers,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Manager configuration with a small pool and short timeouts.
pub fn manager_config(
    name: &str,
    support: TransactionSupport,
    max_size: usize,
    blocking_timeout_ms: u64,
) -> ConnectionManagerConfig {
    ConnectionManagerConfig {
        transaction_support: support,
        pool: PoolConfig {
            min_size: 0,
            max_size,
            blocking_timeout_ms,
            idle_timeout_ms: 1000,
            ..Default::default()
        },
        ..ConnectionManagerConfig::new(name)
    }
}

/// Builds a manager on private workers with no background threads.
pub fn build_manager(
    factory: &Arc<InMemoryFactory>,
    config: ConnectionManagerConfig,
    coordinator: Option<Arc<InMemoryCoordinator>>,
    cache: Option<Arc<AssociationCache>>,
) -> Arc<ConnectionManager> {
    let mut builder =
        ConnectionManager::builder(config, factory.clone()).workers(PoolWorkers::detached());
    if let Some(coordinator) = coordinator {
        builder = builder.coordinator(coordinator);
    }
    if let Some(cache) = cache {
        builder = builder.association_cache(cache);
    }
    builder.build().expect("manager should build")
}

/// Association cache that saves and restores connections across contexts.
pub fn tracking_cache(coordinator: Option<Arc<InMemoryCoordinator>>) -> Arc<AssociationCache> {
    let coordinator = coordinator.map(|c| c as Arc<dyn conduit_pool::TransactionCoordinator>);
    Arc::new(AssociationCache::new(
        AssociationCacheConfig {
            spec_compliant: true,
            debug: false,
        },
        coordinator,
    ))
}

pub fn handle(connection: &AppConnection) -> &InMemoryHandle {
    connection
        .as_any()
        .downcast_ref::<InMemoryHandle>()
        .expect("connection should be an in-memory handle")
}

/// Callback received by a [`RecordingManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEvent {
    TransactionStarted,
    Reconnect,
    Disconnect,
}

/// Cache listener that only records what it is asked to do.
pub struct RecordingManager {
    id: ObjectId,
    name: String,
    events: Mutex<Vec<(CacheEvent, Vec<Arc<ConnectionRecord>>)>>,
}

impl RecordingManager {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ObjectId::next(),
            name: name.to_string(),
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<(CacheEvent, Vec<Arc<ConnectionRecord>>)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: CacheEvent) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(e, _)| *e == event)
            .count()
    }

    fn record(&self, event: CacheEvent, records: &[Arc<ConnectionRecord>]) {
        self.events.lock().unwrap().push((event, records.to_vec()));
    }
}

impl ConnectionCacheListener for RecordingManager {
    fn manager_id(&self) -> ObjectId {
        self.id
    }

    fn resource_name(&self) -> &str {
        &self.name
    }

    fn transaction_started(&self, records: &[Arc<ConnectionRecord>]) -> Result<()> {
        self.record(CacheEvent::TransactionStarted, records);
        Ok(())
    }

    fn reconnect(&self, records: &[Arc<ConnectionRecord>], unsharable: &HashSet<String>) -> Result<()> {
        if !unsharable.contains(&self.name) {
            self.record(CacheEvent::Reconnect, records);
        }
        Ok(())
    }

    fn disconnect(&self, records: &[Arc<ConnectionRecord>], unsharable: &HashSet<String>) -> Result<()> {
        if !unsharable.contains(&self.name) {
            self.record(CacheEvent::Disconnect, records);
        }
        Ok(())
    }
}
