//! Connection association cache
//!
//! Tracks which application connections were obtained inside a calling
//! context (for example one component instance across nested calls) so that
//! connection managers can re-associate them when the context is entered
//! again and tear the association down when it is left.
//!
//! Contexts are identified by object identity through [`ContextKey`]. Each
//! thread keeps its own stack of entered contexts per cache; entering the
//! same key twice shares one association map and only the outermost
//! enter/exit triggers reconnect/disconnect.

use conduit_core::config::AssociationCacheConfig;
use conduit_core::types::ObjectId;
use conduit_core::{ConduitError, Principal, RequestCriteria, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};
use tracing::{debug, error, warn};

use crate::listener::ConnectionListener;
use crate::spi::{
    same_connection, AppConnection, Synchronization, TransactionCoordinator, TransactionStatus,
};

/// Implemented by connection managers that take part in context tracking.
pub trait ConnectionCacheListener: Send + Sync {
    /// Identity of the manager; records are grouped by it.
    fn manager_id(&self) -> ObjectId;

    /// Resource name compared against unsharable sets.
    fn resource_name(&self) -> &str;

    /// A transaction began while these connections were associated.
    fn transaction_started(&self, records: &[Arc<ConnectionRecord>]) -> Result<()>;

    /// Re-associates the records' connections with pooled listeners.
    fn reconnect(
        &self,
        records: &[Arc<ConnectionRecord>],
        unsharable: &HashSet<String>,
    ) -> Result<()>;

    /// Ends the records' associations without closing their connections.
    fn disconnect(
        &self,
        records: &[Arc<ConnectionRecord>],
        unsharable: &HashSet<String>,
    ) -> Result<()>;
}

/// One application connection obtained inside a context.
pub struct ConnectionRecord {
    listener: Mutex<Option<Arc<ConnectionListener>>>,
    connection: AppConnection,
    principal: Option<Principal>,
    criteria: RequestCriteria,
    backtrace: Option<Backtrace>,
}

impl ConnectionRecord {
    pub fn new(
        listener: Arc<ConnectionListener>,
        connection: AppConnection,
        principal: Option<Principal>,
        criteria: RequestCriteria,
    ) -> Self {
        Self {
            listener: Mutex::new(Some(listener)),
            connection,
            principal,
            criteria,
            backtrace: None,
        }
    }

    fn with_backtrace(mut self) -> Self {
        self.backtrace = Some(Backtrace::force_capture());
        self
    }

    /// The listener currently behind the connection; `None` while disconnected.
    pub fn listener(&self) -> Option<Arc<ConnectionListener>> {
        self.listener.lock().clone()
    }

    pub fn set_listener(&self, listener: Arc<ConnectionListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub fn take_listener(&self) -> Option<Arc<ConnectionListener>> {
        self.listener.lock().take()
    }

    pub fn connection(&self) -> &AppConnection {
        &self.connection
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn criteria(&self) -> &RequestCriteria {
        &self.criteria
    }

    /// Where the connection was obtained, captured in debug mode.
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_ref()
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("listener", &self.listener().map(|l| l.id()))
            .field("connection", &self.connection)
            .field("criteria", &self.criteria)
            .finish()
    }
}

/// Identity key for a calling context.
///
/// Two keys are equal only if they wrap the same allocation.
#[derive(Clone)]
pub struct ContextKey(Arc<dyn Any + Send + Sync>);

impl ContextKey {
    /// Wraps a fresh context object.
    pub fn new<T: Any + Send + Sync>(object: T) -> Self {
        Self(Arc::new(object))
    }

    /// Keys an existing shared object by identity.
    pub fn for_object<T: Any + Send + Sync>(object: &Arc<T>) -> Self {
        let object: Arc<dyn Any + Send + Sync> = object.clone();
        Self(object)
    }

    fn addr(&self) -> *const () {
        Arc::as_ptr(&self.0) as *const ()
    }
}

impl PartialEq for ContextKey {
    fn eq(&self, other: &Self) -> bool {
        self.addr() == other.addr()
    }
}

impl Eq for ContextKey {}

impl Hash for ContextKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.addr() as usize).hash(state);
    }
}

impl fmt::Debug for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContextKey({:p})", self.addr())
    }
}

struct ManagerEntry {
    manager: Weak<dyn ConnectionCacheListener>,
    records: Vec<Arc<ConnectionRecord>>,
}

type AssociationMap = Arc<Mutex<HashMap<ObjectId, ManagerEntry>>>;

struct ContextFrame {
    key: ContextKey,
    map: AssociationMap,
    unsharable: HashSet<String>,
}

thread_local! {
    static CONTEXT_STACKS: RefCell<HashMap<ObjectId, Vec<ContextFrame>>> =
        RefCell::new(HashMap::new());
}

/// Process-wide cache of context-scoped connection associations.
pub struct AssociationCache {
    id: ObjectId,
    config: AssociationCacheConfig,
    coordinator: Option<Arc<dyn TransactionCoordinator>>,
    saved: DashMap<ContextKey, AssociationMap>,
}

impl AssociationCache {
    pub fn new(
        config: AssociationCacheConfig,
        coordinator: Option<Arc<dyn TransactionCoordinator>>,
    ) -> Self {
        Self {
            id: ObjectId::next(),
            config,
            coordinator,
            saved: DashMap::new(),
        }
    }

    pub fn config(&self) -> &AssociationCacheConfig {
        &self.config
    }

    fn with_stack<R>(&self, f: impl FnOnce(&mut Vec<ContextFrame>) -> R) -> R {
        CONTEXT_STACKS.with(|stacks| f(stacks.borrow_mut().entry(self.id).or_default()))
    }

    fn top_map(&self) -> Option<AssociationMap> {
        self.with_stack(|stack| stack.last().map(|frame| Arc::clone(&frame.map)))
    }

    /// Enters a calling context on this thread.
    ///
    /// The returned guard exits the context when dropped. On a non-reentrant
    /// entry with `spec_compliant` set, connections saved when the context
    /// was last left are reconnected first; a failure aborts the entry.
    pub fn enter_context(
        &self,
        key: ContextKey,
        unsharable: HashSet<String>,
    ) -> Result<ContextGuard<'_>> {
        let shared = self.with_stack(|stack| {
            stack
                .iter()
                .rev()
                .find(|frame| frame.key == key)
                .map(|frame| Arc::clone(&frame.map))
        });

        let map = match shared {
            Some(map) => map,
            None => {
                let saved = if self.config.spec_compliant {
                    self.saved.remove(&key).map(|(_, map)| map)
                } else {
                    None
                };
                match saved {
                    Some(map) => {
                        if let Err(e) = self.reconnect(&map, &unsharable) {
                            self.saved.insert(key.clone(), map);
                            return Err(e);
                        }
                        map
                    }
                    None => Arc::new(Mutex::new(HashMap::new())),
                }
            }
        };

        self.with_stack(|stack| {
            stack.push(ContextFrame {
                key: key.clone(),
                map,
                unsharable,
            })
        });
        debug!(context = ?key, depth = self.stack_depth(), "Entered context");

        Ok(ContextGuard {
            cache: self,
            key,
            exited: false,
            _not_send: PhantomData,
        })
    }

    fn exit_context(&self, key: &ContextKey) {
        let popped = self.with_stack(|stack| {
            let pos = stack.iter().rposition(|frame| &frame.key == key)?;
            if pos + 1 != stack.len() {
                warn!(context = ?key, "Context exited out of order");
            }
            let frame = stack.remove(pos);
            let still_entered = stack.iter().any(|frame| &frame.key == key);
            Some((frame, still_entered))
        });

        let Some((frame, still_entered)) = popped else {
            warn!(context = ?key, "Exit for a context that is not entered");
            return;
        };
        debug!(context = ?key, reentrant = still_entered, "Exited context");
        if still_entered {
            return;
        }

        if self.config.spec_compliant {
            self.disconnect(&frame);
        } else if self.config.debug {
            self.close_leaked(&frame);
        }
    }

    fn reconnect(&self, map: &AssociationMap, unsharable: &HashSet<String>) -> Result<()> {
        for (manager, records) in snapshot(map) {
            if unsharable.contains(manager.resource_name()) {
                continue;
            }
            manager.reconnect(&records, unsharable).map_err(|e| {
                ConduitError::reconnect(
                    format!("Could not reconnect connections of {}", manager.resource_name()),
                    e,
                )
            })?;
        }
        Ok(())
    }

    fn disconnect(&self, frame: &ContextFrame) {
        let entries = snapshot(&frame.map);
        if entries.is_empty() {
            return;
        }
        self.saved
            .insert(frame.key.clone(), Arc::clone(&frame.map));

        for (manager, records) in entries {
            if frame.unsharable.contains(manager.resource_name()) {
                continue;
            }
            if let Err(e) = manager.disconnect(&records, &frame.unsharable) {
                warn!(
                    resource = %manager.resource_name(),
                    error = %e,
                    "Could not disconnect connections on context exit"
                );
            }
        }
    }

    fn close_leaked(&self, frame: &ContextFrame) {
        let leaked: Vec<Arc<ConnectionRecord>> = snapshot(&frame.map)
            .into_iter()
            .flat_map(|(_, records)| records)
            .collect();
        if leaked.is_empty() {
            return;
        }

        for record in &leaked {
            match record.backtrace() {
                Some(backtrace) => warn!(
                    connection = ?record.connection(),
                    "Closing a connection left open on context exit; it was obtained at:\n{}",
                    backtrace
                ),
                None => warn!(
                    connection = ?record.connection(),
                    "Closing a connection left open on context exit"
                ),
            }
        }

        let connections: Vec<AppConnection> = leaked
            .iter()
            .map(|record| Arc::clone(record.connection()))
            .collect();

        let transaction = self
            .coordinator
            .as_ref()
            .and_then(|c| c.current_transaction())
            .filter(|tx| tx.status().is_unresolved());
        if let Some(tx) = transaction {
            let deferred = Arc::new(CloseLeaked {
                connections: connections.clone(),
            });
            match tx.register_synchronization(deferred) {
                Ok(()) => return,
                Err(e) => {
                    warn!(xid = %tx.xid(), error = %e, "Could not defer leak closing, closing now")
                }
            }
        }
        close_all(&connections);
    }

    /// Records a connection obtained inside the current context.
    ///
    /// Does nothing when no context is entered on this thread.
    pub fn register_connection(
        &self,
        manager: &Arc<dyn ConnectionCacheListener>,
        listener: Arc<ConnectionListener>,
        connection: AppConnection,
        principal: Option<Principal>,
        criteria: RequestCriteria,
    ) {
        let Some(map) = self.top_map() else {
            return;
        };
        let mut record = ConnectionRecord::new(listener, connection, principal, criteria);
        if self.config.debug {
            record = record.with_backtrace();
        }

        let mut map = map.lock();
        map.entry(manager.manager_id())
            .or_insert_with(|| ManagerEntry {
                manager: Arc::downgrade(manager),
                records: Vec::new(),
            })
            .records
            .push(Arc::new(record));
    }

    /// Forgets a closed connection in the current context.
    pub fn unregister_connection(&self, manager_id: ObjectId, connection: &AppConnection) {
        let Some(map) = self.top_map() else {
            return;
        };
        let mut map = map.lock();
        if let Some(entry) = map.get_mut(&manager_id) {
            entry
                .records
                .retain(|record| !same_connection(record.connection(), connection));
            if entry.records.is_empty() {
                map.remove(&manager_id);
            }
        }
    }

    /// Lets every manager in the current context enlist its connections.
    pub fn notify_transaction_started(&self) -> Result<()> {
        let Some(map) = self.top_map() else {
            return Ok(());
        };
        for (manager, records) in snapshot(&map) {
            manager.transaction_started(&records)?;
        }
        Ok(())
    }

    /// Contexts entered on this thread.
    pub fn stack_depth(&self) -> usize {
        self.with_stack(|stack| stack.len())
    }

    /// Contexts whose associations are parked until their next entry.
    pub fn saved_context_count(&self) -> usize {
        self.saved.len()
    }

    /// Connections recorded under the current context.
    pub fn registered_connections(&self) -> usize {
        self.top_map()
            .map(|map| map.lock().values().map(|e| e.records.len()).sum())
            .unwrap_or(0)
    }
}

impl Drop for AssociationCache {
    fn drop(&mut self) {
        let id = self.id;
        let _ = CONTEXT_STACKS.try_with(|stacks| {
            if let Ok(mut stacks) = stacks.try_borrow_mut() {
                stacks.remove(&id);
            }
        });
    }
}

fn snapshot(
    map: &AssociationMap,
) -> Vec<(Arc<dyn ConnectionCacheListener>, Vec<Arc<ConnectionRecord>>)> {
    map.lock()
        .values()
        .filter(|entry| !entry.records.is_empty())
        .filter_map(|entry| {
            entry
                .manager
                .upgrade()
                .map(|manager| (manager, entry.records.clone()))
        })
        .collect()
}

fn close_all(connections: &[AppConnection]) {
    for connection in connections {
        if let Err(e) = connection.close() {
            error!(connection = ?connection, error = %e, "Failed to close leaked connection");
        }
    }
}

struct CloseLeaked {
    connections: Vec<AppConnection>,
}

impl Synchronization for CloseLeaked {
    fn after_completion(&self, _status: TransactionStatus) {
        close_all(&self.connections);
    }
}

/// Keeps a context entered until dropped or explicitly exited.
///
/// Tied to the thread that entered the context.
pub struct ContextGuard<'a> {
    cache: &'a AssociationCache,
    key: ContextKey,
    exited: bool,
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for ContextGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGuard")
            .field("key", &self.key)
            .field("exited", &self.exited)
            .finish_non_exhaustive()
    }
}

impl ContextGuard<'_> {
    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    /// Leaves the context now.
    pub fn exit(mut self) {
        self.exited = true;
        self.cache.exit_context(&self.key);
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if !self.exited {
            self.cache.exit_context(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::{ManagedConnectionFactory, Transaction};
    use crate::testkit::{InMemoryCoordinator, InMemoryFactory, InMemoryHandle};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingManager {
        id: Option<ObjectId>,
        started: AtomicUsize,
        reconnects: AtomicUsize,
        disconnects: AtomicUsize,
        fail_reconnect: AtomicBool,
    }

    impl CountingManager {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: Some(ObjectId::next()),
                ..Default::default()
            })
        }
    }

    impl ConnectionCacheListener for CountingManager {
        fn manager_id(&self) -> ObjectId {
            self.id.unwrap()
        }

        fn resource_name(&self) -> &str {
            "jdbc/test"
        }

        fn transaction_started(&self, _records: &[Arc<ConnectionRecord>]) -> Result<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn reconnect(
            &self,
            _records: &[Arc<ConnectionRecord>],
            _unsharable: &HashSet<String>,
        ) -> Result<()> {
            if self.fail_reconnect.load(Ordering::SeqCst) {
                return Err(ConduitError::illegal_state("reconnect refused"));
            }
            self.reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn disconnect(
            &self,
            _records: &[Arc<ConnectionRecord>],
            _unsharable: &HashSet<String>,
        ) -> Result<()> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn connection(factory: &InMemoryFactory) -> (Arc<ConnectionListener>, AppConnection) {
        let criteria = RequestCriteria::default();
        let mc = factory.create_managed_connection(None, &criteria).unwrap();
        let listener = ConnectionListener::new(
            mc,
            Weak::new(),
            Weak::<crate::listener::DetachedSink>::new(),
        );
        let handle = listener
            .managed_connection()
            .connection_handle(None, &criteria)
            .unwrap();
        (listener, handle)
    }

    fn spec_compliant() -> AssociationCache {
        AssociationCache::new(
            AssociationCacheConfig {
                spec_compliant: true,
                debug: false,
            },
            None,
        )
    }

    #[test]
    fn test_context_key_identity() {
        let object = Arc::new(String::from("bean"));
        let a = ContextKey::for_object(&object);
        let b = ContextKey::for_object(&object);
        let c = ContextKey::for_object(&Arc::new(String::from("bean")));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_register_without_context_is_noop() {
        let cache = spec_compliant();
        let factory = InMemoryFactory::new("test");
        let manager: Arc<dyn ConnectionCacheListener> = CountingManager::new();
        let (listener, handle) = connection(&factory);

        cache.register_connection(&manager, listener, handle, None, RequestCriteria::default());
        assert_eq!(cache.registered_connections(), 0);
        assert!(cache.notify_transaction_started().is_ok());
    }

    #[test]
    fn test_reentrant_entry_reconnects_once() {
        let cache = spec_compliant();
        let factory = InMemoryFactory::new("test");
        let counting = CountingManager::new();
        let manager: Arc<dyn ConnectionCacheListener> = counting.clone();
        let key = ContextKey::new(1u32);

        let outer = cache.enter_context(key.clone(), HashSet::new()).unwrap();
        let (listener, handle) = connection(&factory);
        cache.register_connection(&manager, listener, handle, None, RequestCriteria::default());

        let inner = cache.enter_context(key.clone(), HashSet::new()).unwrap();
        assert_eq!(cache.registered_connections(), 1);
        inner.exit();
        assert_eq!(counting.disconnects.load(Ordering::SeqCst), 0);
        outer.exit();
        assert_eq!(counting.disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(cache.saved_context_count(), 1);

        let outer = cache.enter_context(key.clone(), HashSet::new()).unwrap();
        let inner = cache.enter_context(key.clone(), HashSet::new()).unwrap();
        assert_eq!(counting.reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(cache.saved_context_count(), 0);
        drop(inner);
        drop(outer);
        assert_eq!(counting.disconnects.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stack_depth(), 0);
    }

    #[test]
    fn test_unsharable_resources_are_bypassed() {
        let cache = spec_compliant();
        let factory = InMemoryFactory::new("test");
        let counting = CountingManager::new();
        let manager: Arc<dyn ConnectionCacheListener> = counting.clone();
        let key = ContextKey::new("bean");
        let unsharable: HashSet<String> = ["jdbc/test".to_string()].into_iter().collect();

        let guard = cache.enter_context(key.clone(), unsharable.clone()).unwrap();
        let (listener, handle) = connection(&factory);
        cache.register_connection(&manager, listener, handle, None, RequestCriteria::default());
        guard.exit();

        let guard = cache.enter_context(key, unsharable).unwrap();
        guard.exit();
        assert_eq!(counting.reconnects.load(Ordering::SeqCst), 0);
        assert_eq!(counting.disconnects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_reconnect_aborts_entry_and_keeps_state() {
        let cache = spec_compliant();
        let factory = InMemoryFactory::new("test");
        let counting = CountingManager::new();
        let manager: Arc<dyn ConnectionCacheListener> = counting.clone();
        let key = ContextKey::new(7u64);

        let guard = cache.enter_context(key.clone(), HashSet::new()).unwrap();
        let (listener, handle) = connection(&factory);
        cache.register_connection(&manager, listener, handle, None, RequestCriteria::default());
        guard.exit();

        counting.fail_reconnect.store(true, Ordering::SeqCst);
        let err = cache.enter_context(key.clone(), HashSet::new()).unwrap_err();
        assert!(matches!(err, ConduitError::Reconnect { .. }));
        assert_eq!(cache.stack_depth(), 0);
        assert_eq!(cache.saved_context_count(), 1);

        counting.fail_reconnect.store(false, Ordering::SeqCst);
        let guard = cache.enter_context(key, HashSet::new()).unwrap();
        assert_eq!(counting.reconnects.load(Ordering::SeqCst), 1);
        assert_eq!(cache.registered_connections(), 1);
        drop(guard);
    }

    #[test]
    fn test_unregister_and_transaction_started() {
        let cache = spec_compliant();
        let factory = InMemoryFactory::new("test");
        let counting = CountingManager::new();
        let manager: Arc<dyn ConnectionCacheListener> = counting.clone();

        let guard = cache.enter_context(ContextKey::new(()), HashSet::new()).unwrap();
        let (listener, handle) = connection(&factory);
        cache.register_connection(
            &manager,
            listener,
            handle.clone(),
            None,
            RequestCriteria::default(),
        );
        cache.notify_transaction_started().unwrap();
        assert_eq!(counting.started.load(Ordering::SeqCst), 1);

        cache.unregister_connection(counting.manager_id(), &handle);
        assert_eq!(cache.registered_connections(), 0);
        cache.notify_transaction_started().unwrap();
        assert_eq!(counting.started.load(Ordering::SeqCst), 1);

        guard.exit();
        assert_eq!(counting.disconnects.load(Ordering::SeqCst), 0);
        assert_eq!(cache.saved_context_count(), 0);
    }

    #[test]
    fn test_debug_mode_closes_leaked_connections() {
        let cache = AssociationCache::new(
            AssociationCacheConfig {
                spec_compliant: false,
                debug: true,
            },
            None,
        );
        let factory = InMemoryFactory::new("test");
        let manager: Arc<dyn ConnectionCacheListener> = CountingManager::new();

        let guard = cache.enter_context(ContextKey::new(()), HashSet::new()).unwrap();
        let (listener, handle) = connection(&factory);
        cache.register_connection(
            &manager,
            listener,
            handle.clone(),
            None,
            RequestCriteria::default(),
        );
        guard.exit();

        let handle = handle.as_any().downcast_ref::<InMemoryHandle>().unwrap();
        assert!(handle.is_closed());
    }

    #[test]
    fn test_debug_mode_defers_closing_until_completion() {
        let coordinator = Arc::new(InMemoryCoordinator::new());
        let cache = AssociationCache::new(
            AssociationCacheConfig {
                spec_compliant: false,
                debug: true,
            },
            Some(coordinator.clone()),
        );
        let factory = InMemoryFactory::new("test");
        let manager: Arc<dyn ConnectionCacheListener> = CountingManager::new();

        let tx = coordinator.begin().unwrap();
        let guard = cache.enter_context(ContextKey::new(()), HashSet::new()).unwrap();
        let (listener, handle) = connection(&factory);
        cache.register_connection(
            &manager,
            listener,
            handle.clone(),
            None,
            RequestCriteria::default(),
        );
        guard.exit();

        let in_memory = handle.as_any().downcast_ref::<InMemoryHandle>().unwrap();
        assert!(!in_memory.is_closed());
        assert!(tx.status().is_active());
        coordinator.commit().unwrap();
        assert!(in_memory.is_closed());
    }
}
