//! Connection association across component contexts and transactions

mod common;

use common::{
    build_manager, handle, manager_config, tracking_cache, CacheEvent, RecordingManager,
};
use conduit_core::config::TransactionSupport;
use conduit_core::xa::TMNOFLAGS;
use conduit_core::RequestCriteria;
use conduit_pool::testkit::{InMemoryCoordinator, InMemoryFactory, XaCall};
use conduit_pool::{
    same_connection, ConnectionCacheListener, ContextKey, ManagedConnectionFactory,
    PermitGatedPool, PoolWorkers, Transaction,
};
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn test_context_records_follow_transaction_and_reentry() {
    let cache = tracking_cache(None);
    let recorder = RecordingManager::new("jdbc/recorded");
    let manager: Arc<dyn ConnectionCacheListener> = recorder.clone();

    let factory = InMemoryFactory::new("recorded");
    let pool_factory: Arc<dyn ManagedConnectionFactory> = factory.clone();
    let pool = PermitGatedPool::builder("recorded", pool_factory, PoolWorkers::detached()).build();
    let criteria = RequestCriteria::default();
    let listener = pool.checkout(None, &criteria).unwrap();
    let connection = listener
        .managed_connection()
        .connection_handle(None, &criteria)
        .unwrap();

    let key = ContextKey::new("component-x");
    let guard = cache.enter_context(key.clone(), HashSet::new()).unwrap();
    cache.register_connection(&manager, listener, connection.clone(), None, criteria);

    cache.notify_transaction_started().unwrap();
    let events = recorder.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, CacheEvent::TransactionStarted);
    assert_eq!(events[0].1.len(), 1);
    let record = Arc::clone(&events[0].1[0]);
    assert!(same_connection(record.connection(), &connection));

    guard.exit();
    let events = recorder.events();
    assert_eq!(events[1].0, CacheEvent::Disconnect);
    assert!(Arc::ptr_eq(&events[1].1[0], &record));
    assert_eq!(cache.saved_context_count(), 1);

    let guard = cache.enter_context(key, HashSet::new()).unwrap();
    let events = recorder.events();
    assert_eq!(events[2].0, CacheEvent::Reconnect);
    assert!(Arc::ptr_eq(&events[2].1[0], &record));
    assert_eq!(cache.saved_context_count(), 0);
    assert_eq!(cache.registered_connections(), 1);
    drop(guard);
}

#[test]
fn test_reentrant_context_reconnects_and_disconnects_once() {
    let cache = tracking_cache(None);
    let recorder = RecordingManager::new("jdbc/reentrant");
    let manager: Arc<dyn ConnectionCacheListener> = recorder.clone();
    let factory = InMemoryFactory::new("reentrant");
    let pool_factory: Arc<dyn ManagedConnectionFactory> = factory.clone();
    let pool = PermitGatedPool::builder("reentrant", pool_factory, PoolWorkers::detached()).build();
    let criteria = RequestCriteria::default();
    let key = ContextKey::new("component-k");

    {
        let _outer = cache.enter_context(key.clone(), HashSet::new()).unwrap();
        let listener = pool.checkout(None, &criteria).unwrap();
        let connection = listener
            .managed_connection()
            .connection_handle(None, &criteria)
            .unwrap();
        cache.register_connection(&manager, listener, connection, None, criteria.clone());
    }
    assert_eq!(recorder.count(CacheEvent::Disconnect), 1);

    {
        let outer = cache.enter_context(key.clone(), HashSet::new()).unwrap();
        let inner = cache.enter_context(key.clone(), HashSet::new()).unwrap();
        assert_eq!(cache.stack_depth(), 2);
        inner.exit();
        assert_eq!(recorder.count(CacheEvent::Disconnect), 1);
        outer.exit();
    }

    assert_eq!(recorder.count(CacheEvent::Reconnect), 1);
    assert_eq!(recorder.count(CacheEvent::Disconnect), 2);
    assert_eq!(cache.stack_depth(), 0);
}

#[test]
fn test_transaction_start_enlists_connections_already_in_use() {
    let factory = InMemoryFactory::new("orders");
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let cache = tracking_cache(Some(coordinator.clone()));
    let manager = build_manager(
        &factory,
        manager_config("jdbc/orders", TransactionSupport::Xa, 2, 100),
        Some(coordinator.clone()),
        Some(cache.clone()),
    );

    let guard = cache
        .enter_context(ContextKey::new("bean"), HashSet::new())
        .unwrap();
    let connection = manager
        .allocate_connection(factory.as_ref(), None, &RequestCriteria::default())
        .unwrap();
    assert!(factory.connection(0).unwrap().xa().calls().is_empty());

    let tx = coordinator.begin().unwrap();
    cache.notify_transaction_started().unwrap();
    assert_eq!(
        factory.connection(0).unwrap().xa().calls(),
        vec![XaCall::Start(tx.xid(), TMNOFLAGS)]
    );

    connection.close().unwrap();
    coordinator.commit().unwrap();
    assert!(factory
        .connection(0)
        .unwrap()
        .xa()
        .calls()
        .contains(&XaCall::Commit(tx.xid(), true)));
    assert_eq!(manager.stats().pool.idle, 1);
    drop(guard);
}

#[test]
fn test_unsharable_resource_keeps_its_connection() {
    let factory = InMemoryFactory::new("pinned");
    let cache = tracking_cache(None);
    let manager = build_manager(
        &factory,
        manager_config("jdbc/pinned", TransactionSupport::None, 2, 100),
        None,
        Some(cache.clone()),
    );
    let unsharable: HashSet<String> = ["jdbc/pinned".to_string()].into_iter().collect();
    let key = ContextKey::new("stateful-bean");

    let guard = cache.enter_context(key.clone(), unsharable.clone()).unwrap();
    let connection = manager
        .allocate_connection(factory.as_ref(), None, &RequestCriteria::default())
        .unwrap();
    guard.exit();

    assert_eq!(manager.stats().pool.in_use, 1);
    assert_eq!(manager.stats().pool.idle, 0);

    let guard = cache.enter_context(key, unsharable).unwrap();
    assert_eq!(factory.created_count(), 1);
    assert!(!handle(&connection).is_closed());
    connection.close().unwrap();
    assert_eq!(manager.stats().pool.idle, 1);
    drop(guard);
}
