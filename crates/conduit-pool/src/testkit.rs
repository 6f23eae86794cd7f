//! In-memory collaborators
//!
//! A connection factory, connections, handles, XA and local transactions and
//! a thread-scoped transaction coordinator, all in memory. They record what
//! was done to them and can be told to fail, which is enough to drive the
//! pool and the connection manager in tests and in the demo binary.

use conduit_core::types::ObjectId;
use conduit_core::xa::{
    Vote, XaError, Xid, TMFAIL, TMJOIN, TMNOFLAGS, TMSUCCESS, XAER_NOTA, XA_RBROLLBACK,
};
use conduit_core::{BoxError, Principal, RequestCriteria};
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use tracing::debug;

use crate::spi::{
    AppConnection, ConnectionEventListener, ConnectionHandle, LocalTransaction, ManagedConnection,
    ManagedConnectionFactory, Synchronization, Transaction, TransactionCoordinator,
    TransactionStatus, XaResource,
};

#[derive(Default)]
struct Switches {
    fail_creates: AtomicBool,
    fail_matches: AtomicBool,
    fail_cleanups: AtomicBool,
    fail_local_begins: AtomicBool,
    created: AtomicUsize,
    destroyed: AtomicUsize,
}

/// Factory creating [`InMemoryConnection`]s.
pub struct InMemoryFactory {
    name: String,
    switches: Arc<Switches>,
    connections: Mutex<Vec<Arc<InMemoryConnection>>>,
}

impl InMemoryFactory {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            switches: Arc::new(Switches::default()),
            connections: Mutex::new(Vec::new()),
        })
    }

    pub fn created_count(&self) -> usize {
        self.switches.created.load(Ordering::SeqCst)
    }

    pub fn destroyed_count(&self) -> usize {
        self.switches.destroyed.load(Ordering::SeqCst)
    }

    pub fn fail_creates(&self, fail: bool) {
        self.switches.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn fail_matches(&self, fail: bool) {
        self.switches.fail_matches.store(fail, Ordering::SeqCst);
    }

    pub fn fail_cleanups(&self, fail: bool) {
        self.switches.fail_cleanups.store(fail, Ordering::SeqCst);
    }

    /// Makes local transactions of current and future connections fail to begin.
    pub fn fail_local_begins(&self, fail: bool) {
        self.switches.fail_local_begins.store(fail, Ordering::SeqCst);
        for connection in self.connections.lock().iter() {
            connection.local.fail_begin(fail);
        }
    }

    /// The `index`th connection created, in creation order.
    pub fn connection(&self, index: usize) -> Option<Arc<InMemoryConnection>> {
        self.connections.lock().get(index).cloned()
    }

    pub fn connections(&self) -> Vec<Arc<InMemoryConnection>> {
        self.connections.lock().clone()
    }
}

impl ManagedConnectionFactory for InMemoryFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn create_managed_connection(
        &self,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
    ) -> Result<Arc<dyn ManagedConnection>, BoxError> {
        if self.switches.fail_creates.load(Ordering::SeqCst) {
            return Err(format!("{}: connection refused", self.name).into());
        }
        self.switches.created.fetch_add(1, Ordering::SeqCst);

        let local = Arc::new(InMemoryLocalTransaction::default());
        local.fail_begin(self.switches.fail_local_begins.load(Ordering::SeqCst));
        let connection = Arc::new_cyclic(|this| InMemoryConnection {
            id: ObjectId::next(),
            principal: principal.cloned(),
            criteria: criteria.clone(),
            switches: Arc::clone(&self.switches),
            listeners: Mutex::new(Vec::new()),
            xa: Arc::new(InMemoryXaResource::default()),
            local,
            destroyed: AtomicBool::new(false),
            this: this.clone(),
        });
        self.connections.lock().push(Arc::clone(&connection));
        debug!(factory = %self.name, connection = %connection.id, "Created in-memory connection");
        Ok(connection)
    }

    fn matches(
        &self,
        candidate: &dyn ManagedConnection,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
    ) -> Result<bool, BoxError> {
        if self.switches.fail_matches.load(Ordering::SeqCst) {
            return Err("match predicate failed".into());
        }
        Ok(candidate
            .as_any()
            .downcast_ref::<InMemoryConnection>()
            .is_some_and(|c| c.principal.as_ref() == principal && &c.criteria == criteria))
    }
}

/// Physical connection held in memory.
pub struct InMemoryConnection {
    id: ObjectId,
    principal: Option<Principal>,
    criteria: RequestCriteria,
    switches: Arc<Switches>,
    listeners: Mutex<Vec<Weak<dyn ConnectionEventListener>>>,
    xa: Arc<InMemoryXaResource>,
    local: Arc<InMemoryLocalTransaction>,
    destroyed: AtomicBool,
    this: Weak<InMemoryConnection>,
}

impl InMemoryConnection {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn xa(&self) -> Arc<InMemoryXaResource> {
        Arc::clone(&self.xa)
    }

    pub fn local(&self) -> Arc<InMemoryLocalTransaction> {
        Arc::clone(&self.local)
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Reports a fatal connection error to every listener.
    pub fn fire_error(&self, message: &str) {
        for listener in self.live_listeners() {
            listener.connection_error_occurred(None, message);
        }
    }

    fn fire_closed(&self, connection: &AppConnection) {
        for listener in self.live_listeners() {
            listener.connection_closed(connection);
        }
    }

    fn live_listeners(&self) -> Vec<Arc<dyn ConnectionEventListener>> {
        self.listeners
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }
}

impl ManagedConnection for InMemoryConnection {
    fn connection_handle(
        &self,
        _principal: Option<&Principal>,
        _criteria: &RequestCriteria,
    ) -> Result<AppConnection, BoxError> {
        if self.is_destroyed() {
            return Err(format!("connection {} is destroyed", self.id).into());
        }
        let handle = Arc::new_cyclic(|this| InMemoryHandle {
            managed: Mutex::new(self.this.clone()),
            closed: AtomicBool::new(false),
            this: this.clone(),
        });
        Ok(handle)
    }

    fn associate_connection(&self, connection: &AppConnection) -> Result<(), BoxError> {
        let handle = connection
            .as_any()
            .downcast_ref::<InMemoryHandle>()
            .ok_or("not an in-memory handle")?;
        *handle.managed.lock() = self.this.clone();
        Ok(())
    }

    fn add_connection_event_listener(&self, listener: Weak<dyn ConnectionEventListener>) {
        self.listeners.lock().push(listener);
    }

    fn cleanup(&self) -> Result<(), BoxError> {
        if self.switches.fail_cleanups.load(Ordering::SeqCst) {
            return Err("cleanup failed".into());
        }
        Ok(())
    }

    fn destroy(&self) -> Result<(), BoxError> {
        if !self.destroyed.swap(true, Ordering::SeqCst) {
            self.switches.destroyed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn xa_resource(&self) -> Result<Arc<dyn XaResource>, BoxError> {
        let xa: Arc<dyn XaResource> = self.xa.clone();
        Ok(xa)
    }

    fn local_transaction(&self) -> Result<Arc<dyn LocalTransaction>, BoxError> {
        let local: Arc<dyn LocalTransaction> = self.local.clone();
        Ok(local)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Application handle on an [`InMemoryConnection`].
pub struct InMemoryHandle {
    managed: Mutex<Weak<InMemoryConnection>>,
    closed: AtomicBool,
    this: Weak<InMemoryHandle>,
}

impl InMemoryHandle {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Id of the connection the handle currently points at.
    pub fn managed_id(&self) -> Option<ObjectId> {
        self.managed.lock().upgrade().map(|c| c.id)
    }
}

impl ConnectionHandle for InMemoryHandle {
    fn close(&self) -> Result<(), BoxError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let managed = self.managed.lock().upgrade();
        if let (Some(managed), Some(this)) = (managed, self.this.upgrade()) {
            let connection: AppConnection = this;
            managed.fire_closed(&connection);
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Debug for InMemoryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryHandle")
            .field("managed", &self.managed_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Call made on an [`InMemoryXaResource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XaCall {
    Start(Xid, i32),
    End(Xid, i32),
    Prepare(Xid),
    Commit(Xid, bool),
    Rollback(Xid),
    Forget(Xid),
    Recover(i32),
}

/// XA resource recording every call.
#[derive(Default)]
pub struct InMemoryXaResource {
    calls: Mutex<Vec<XaCall>>,
    prepared: Mutex<Vec<Xid>>,
    fail_prepare: AtomicBool,
}

impl InMemoryXaResource {
    pub fn calls(&self) -> Vec<XaCall> {
        self.calls.lock().clone()
    }

    /// Makes `prepare` vote rollback.
    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: XaCall) {
        self.calls.lock().push(call);
    }
}

impl XaResource for InMemoryXaResource {
    fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        self.record(XaCall::Start(xid.clone(), flags));
        Ok(())
    }

    fn end(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        self.record(XaCall::End(xid.clone(), flags));
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> Result<Vote, XaError> {
        self.record(XaCall::Prepare(xid.clone()));
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(XaError::new(XA_RBROLLBACK, "prepare refused"));
        }
        self.prepared.lock().push(xid.clone());
        Ok(Vote::Ok)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        self.record(XaCall::Commit(xid.clone(), one_phase));
        self.prepared.lock().retain(|p| p != xid);
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.record(XaCall::Rollback(xid.clone()));
        self.prepared.lock().retain(|p| p != xid);
        Ok(())
    }

    fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        self.record(XaCall::Forget(xid.clone()));
        Err(XaError::new(XAER_NOTA, format!("unknown branch {}", xid)))
    }

    fn recover(&self, flags: i32) -> Result<Vec<Xid>, XaError> {
        self.record(XaCall::Recover(flags));
        Ok(self.prepared.lock().clone())
    }
}

/// Local transaction counting its calls.
#[derive(Default)]
pub struct InMemoryLocalTransaction {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_begin: AtomicBool,
    fail_commit: AtomicBool,
    fail_rollback: AtomicBool,
}

impl InMemoryLocalTransaction {
    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn fail_begin(&self, fail: bool) {
        self.fail_begin.store(fail, Ordering::SeqCst);
    }

    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    pub fn fail_rollback(&self, fail: bool) {
        self.fail_rollback.store(fail, Ordering::SeqCst);
    }
}

impl LocalTransaction for InMemoryLocalTransaction {
    fn begin(&self) -> Result<(), BoxError> {
        if self.fail_begin.load(Ordering::SeqCst) {
            return Err("begin refused".into());
        }
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self) -> Result<(), BoxError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err("commit refused".into());
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self) -> Result<(), BoxError> {
        if self.fail_rollback.load(Ordering::SeqCst) {
            return Err("rollback refused".into());
        }
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct Participant {
    resource: Arc<dyn XaResource>,
    active: bool,
}

struct TxState {
    status: TransactionStatus,
    participants: Vec<Participant>,
    synchronizations: Vec<Arc<dyn Synchronization>>,
}

/// Global transaction driven by [`InMemoryCoordinator`].
///
/// Every participant works on the transaction's own Xid. A single
/// participant is committed in one phase, several go through prepare.
pub struct InMemoryTransaction {
    xid: Xid,
    state: Mutex<TxState>,
}

impl InMemoryTransaction {
    fn new() -> Self {
        Self {
            xid: Xid::generate(),
            state: Mutex::new(TxState {
                status: TransactionStatus::Active,
                participants: Vec::new(),
                synchronizations: Vec::new(),
            }),
        }
    }

    pub fn participant_count(&self) -> usize {
        self.state.lock().participants.len()
    }

    fn set_status(&self, status: TransactionStatus) {
        self.state.lock().status = status;
    }

    /// Ends every still-active participant and returns all of them.
    fn end_participants(&self, flags: i32) -> Vec<Arc<dyn XaResource>> {
        let (to_end, all) = {
            let mut state = self.state.lock();
            let to_end: Vec<_> = state
                .participants
                .iter_mut()
                .filter(|p| p.active)
                .map(|p| {
                    p.active = false;
                    Arc::clone(&p.resource)
                })
                .collect();
            let all: Vec<_> = state
                .participants
                .iter()
                .map(|p| Arc::clone(&p.resource))
                .collect();
            (to_end, all)
        };
        for resource in to_end {
            if let Err(e) = resource.end(&self.xid, flags) {
                debug!(xid = %self.xid, error = %e, "End failed");
            }
        }
        all
    }

    fn complete(&self, status: TransactionStatus) {
        let synchronizations = {
            let mut state = self.state.lock();
            state.status = status;
            state.synchronizations.clone()
        };
        for sync in synchronizations {
            sync.after_completion(status);
        }
    }

    fn commit(&self) -> Result<(), BoxError> {
        let synchronizations = self.state.lock().synchronizations.clone();
        for sync in &synchronizations {
            sync.before_completion();
        }

        if self.status() == TransactionStatus::MarkedRollback {
            self.rollback_inner();
            return Err(format!("transaction {} was marked rollback only", self.xid).into());
        }

        let resources = self.end_participants(TMSUCCESS);
        if self.status() == TransactionStatus::MarkedRollback {
            self.rollback_inner();
            return Err(format!("transaction {} was marked rollback only", self.xid).into());
        }

        if resources.len() == 1 {
            self.set_status(TransactionStatus::Committing);
            if let Err(e) = resources[0].commit(&self.xid, true) {
                self.complete(TransactionStatus::RolledBack);
                return Err(e.into());
            }
            self.complete(TransactionStatus::Committed);
            return Ok(());
        }

        self.set_status(TransactionStatus::Preparing);
        let mut voters = Vec::new();
        for resource in &resources {
            match resource.prepare(&self.xid) {
                Ok(Vote::Ok) => voters.push(Arc::clone(resource)),
                Ok(Vote::ReadOnly) => {}
                Err(e) => {
                    for resource in &resources {
                        let _ = resource.rollback(&self.xid);
                    }
                    self.complete(TransactionStatus::RolledBack);
                    return Err(e.into());
                }
            }
        }

        self.set_status(TransactionStatus::Committing);
        for resource in voters {
            if let Err(e) = resource.commit(&self.xid, false) {
                debug!(xid = %self.xid, error = %e, "Commit of prepared branch failed");
            }
        }
        self.complete(TransactionStatus::Committed);
        Ok(())
    }

    fn rollback_inner(&self) {
        let synchronizations_ran = self.status() != TransactionStatus::Active;
        if !synchronizations_ran {
            let synchronizations = self.state.lock().synchronizations.clone();
            for sync in &synchronizations {
                sync.before_completion();
            }
        }
        self.set_status(TransactionStatus::RollingBack);
        for resource in self.end_participants(TMFAIL) {
            if let Err(e) = resource.rollback(&self.xid) {
                debug!(xid = %self.xid, error = %e, "Rollback failed");
            }
        }
        self.complete(TransactionStatus::RolledBack);
    }
}

impl Transaction for InMemoryTransaction {
    fn xid(&self) -> Xid {
        self.xid.clone()
    }

    fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<(), BoxError> {
        let flags = {
            let state = self.state.lock();
            if state.status != TransactionStatus::Active {
                return Err(format!("transaction {} is {:?}", self.xid, state.status).into());
            }
            match state
                .participants
                .iter()
                .find(|p| p.resource.is_same_rm(resource.as_ref()))
            {
                Some(p) if p.active => return Ok(()),
                Some(_) => TMJOIN,
                None => TMNOFLAGS,
            }
        };

        resource.start(&self.xid, flags)?;

        let mut state = self.state.lock();
        if flags == TMJOIN {
            if let Some(p) = state
                .participants
                .iter_mut()
                .find(|p| p.resource.is_same_rm(resource.as_ref()))
            {
                p.active = true;
            }
        } else {
            state.participants.push(Participant {
                resource,
                active: true,
            });
        }
        Ok(())
    }

    fn delist_resource(&self, resource: Arc<dyn XaResource>, flags: i32) -> Result<(), BoxError> {
        {
            let mut state = self.state.lock();
            let participant = state
                .participants
                .iter_mut()
                .find(|p| p.active && p.resource.is_same_rm(resource.as_ref()))
                .ok_or("resource is not enlisted")?;
            participant.active = false;
            if flags == TMFAIL {
                state.status = TransactionStatus::MarkedRollback;
            }
        }
        resource.end(&self.xid, flags)?;
        Ok(())
    }

    fn register_synchronization(&self, sync: Arc<dyn Synchronization>) -> Result<(), BoxError> {
        let mut state = self.state.lock();
        if !state.status.is_unresolved() {
            return Err(format!("transaction {} already completed", self.xid).into());
        }
        state.synchronizations.push(sync);
        Ok(())
    }

    fn set_rollback_only(&self) -> Result<(), BoxError> {
        let mut state = self.state.lock();
        if state.status == TransactionStatus::Active {
            state.status = TransactionStatus::MarkedRollback;
        }
        Ok(())
    }
}

/// Coordinator binding one transaction to each thread.
#[derive(Default)]
pub struct InMemoryCoordinator {
    current: Mutex<HashMap<ThreadId, Arc<InMemoryTransaction>>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a transaction on the calling thread.
    pub fn begin(&self) -> Result<Arc<InMemoryTransaction>, BoxError> {
        let mut current = self.current.lock();
        let id = thread::current().id();
        if current.contains_key(&id) {
            return Err("a transaction is already active on this thread".into());
        }
        let tx = Arc::new(InMemoryTransaction::new());
        current.insert(id, Arc::clone(&tx));
        Ok(tx)
    }

    pub fn current(&self) -> Option<Arc<InMemoryTransaction>> {
        self.current.lock().get(&thread::current().id()).cloned()
    }

    /// Commits the calling thread's transaction.
    pub fn commit(&self) -> Result<(), BoxError> {
        self.take()?.commit()
    }

    /// Rolls back the calling thread's transaction.
    pub fn rollback(&self) -> Result<(), BoxError> {
        self.take()?.rollback_inner();
        Ok(())
    }

    /// Detaches the calling thread's transaction.
    pub fn suspend(&self) -> Option<Arc<InMemoryTransaction>> {
        self.current.lock().remove(&thread::current().id())
    }

    /// Re-attaches a suspended transaction to the calling thread.
    pub fn resume(&self, tx: Arc<InMemoryTransaction>) -> Result<(), BoxError> {
        let mut current = self.current.lock();
        let id = thread::current().id();
        if current.contains_key(&id) {
            return Err("a transaction is already active on this thread".into());
        }
        current.insert(id, tx);
        Ok(())
    }

    fn take(&self) -> Result<Arc<InMemoryTransaction>, BoxError> {
        self.suspend()
            .ok_or_else(|| "no transaction on this thread".into())
    }
}

impl TransactionCoordinator for InMemoryCoordinator {
    fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        let tx: Arc<dyn Transaction> = self.current()?;
        Some(tx)
    }
}
