//! Permit-gated connection pool
//!
//! One [`PermitGatedPool`] holds the physical connections for a single
//! sub-pool key. Capacity is enforced with a permit counter guarded by the
//! same lock as the idle list, so that at every observable instant
//!
//! ```text
//! in_use + idle + available_permits == max_size
//! ```
//!
//! Reusing an idle connection does not consume a permit, creating one does,
//! and only destroying a connection gives its permit back. Idle connections
//! are kept LIFO: returns push on top, checkouts pop from the top and the
//! idle sweeper evicts from the bottom.

use conduit_core::config::PoolConfig;
use conduit_core::types::ObjectId;
use conduit_core::{ConduitError, Principal, RequestCriteria, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::listener::{ConnectionEventSink, ConnectionListener, DetachedSink};
use crate::metrics::{PoolMetrics, PoolStatistics};
use crate::spi::ManagedConnectionFactory;
use crate::workers::PoolWorkers;

struct PoolState {
    /// Idle listeners, most recently returned last
    available: Vec<Arc<ConnectionListener>>,
    checked_out: HashMap<ObjectId, Arc<ConnectionListener>>,
    /// Creations in flight; they already hold a permit
    creating: usize,
    permits: usize,
    max_used: usize,
    shutdown: bool,
}

impl PoolState {
    fn in_use(&self) -> usize {
        self.checked_out.len() + self.creating
    }

    fn connection_count(&self) -> usize {
        self.available.len() + self.in_use()
    }

    fn note_checkout(&mut self) -> usize {
        let in_use = self.in_use();
        self.max_used = self.max_used.max(in_use);
        in_use
    }
}

/// Builder for [`PermitGatedPool`].
pub struct PoolBuilder {
    name: String,
    factory: Arc<dyn ManagedConnectionFactory>,
    workers: Arc<PoolWorkers>,
    config: PoolConfig,
    principal: Option<Principal>,
    criteria: RequestCriteria,
    sink: Weak<dyn ConnectionEventSink>,
}

impl PoolBuilder {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Principal used when the pool fills itself in the background.
    pub fn principal(mut self, principal: Option<Principal>) -> Self {
        self.principal = principal;
        self
    }

    /// Criteria used when the pool fills itself in the background.
    pub fn criteria(mut self, criteria: RequestCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    /// Receiver for driver events of connections created by this pool.
    pub fn sink(mut self, sink: Weak<dyn ConnectionEventSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn build(self) -> Arc<PermitGatedPool> {
        let max_size = self.config.max_size;
        Arc::new_cyclic(|this| PermitGatedPool {
            id: ObjectId::next(),
            metrics: PoolMetrics::new(self.name.clone()),
            name: self.name,
            config: self.config,
            factory: self.factory,
            principal: self.principal,
            criteria: self.criteria,
            sink: self.sink,
            workers: self.workers,
            state: Mutex::new(PoolState {
                available: Vec::with_capacity(max_size),
                checked_out: HashMap::new(),
                creating: 0,
                permits: max_size,
                max_used: 0,
                shutdown: false,
            }),
            available_cond: Condvar::new(),
            this: this.clone(),
        })
    }
}

/// Pool of managed connections for one sub-pool key.
pub struct PermitGatedPool {
    id: ObjectId,
    name: String,
    config: PoolConfig,
    factory: Arc<dyn ManagedConnectionFactory>,
    principal: Option<Principal>,
    criteria: RequestCriteria,
    sink: Weak<dyn ConnectionEventSink>,
    workers: Arc<PoolWorkers>,
    metrics: PoolMetrics,
    state: Mutex<PoolState>,
    available_cond: Condvar,
    this: Weak<PermitGatedPool>,
}

impl PermitGatedPool {
    /// Starts building a pool with default configuration and no event sink.
    pub fn builder(
        name: impl Into<String>,
        factory: Arc<dyn ManagedConnectionFactory>,
        workers: Arc<PoolWorkers>,
    ) -> PoolBuilder {
        let sink: Weak<dyn ConnectionEventSink> = Weak::<DetachedSink>::new();
        PoolBuilder {
            name: name.into(),
            factory,
            workers,
            config: PoolConfig::default(),
            principal: None,
            criteria: RequestCriteria::default(),
            sink,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn metrics(&self) -> &PoolMetrics {
        &self.metrics
    }

    /// Hands out a listener able to serve `principal` and `criteria`.
    ///
    /// Idle connections are tried most recently used first. Candidates the
    /// factory does not match are destroyed. When none is left a new
    /// connection is created if a permit is free, otherwise the caller waits
    /// up to the blocking timeout.
    pub fn checkout(
        &self,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
    ) -> Result<Arc<ConnectionListener>> {
        let started = Instant::now();
        let deadline = started + self.config.blocking_timeout();
        let mut skip_idle = false;
        let mut state = self.state.lock();

        loop {
            if state.shutdown {
                return Err(ConduitError::Shutdown(self.name.clone()));
            }

            if !skip_idle {
                if let Some(candidate) = state.available.pop() {
                    state.checked_out.insert(candidate.id(), Arc::clone(&candidate));
                    let in_use = state.note_checkout();
                    drop(state);

                    match self.factory.matches(
                        candidate.managed_connection().as_ref(),
                        principal,
                        criteria,
                    ) {
                        Ok(true) => {
                            self.metrics.record_checkout(in_use);
                            debug!(pool = %self.name, listener = %candidate.id(), "Reusing idle connection");
                            return Ok(candidate);
                        }
                        Ok(false) => {
                            warn!(
                                pool = %self.name,
                                listener = %candidate.id(),
                                "Destroying connection that could not be matched"
                            );
                            self.destroy_checked_out(&candidate);
                        }
                        Err(e) => {
                            warn!(
                                pool = %self.name,
                                listener = %candidate.id(),
                                error = %e,
                                "Match failed, destroying connection"
                            );
                            self.destroy_checked_out(&candidate);
                            if self.config.use_fast_fail {
                                skip_idle = true;
                            }
                        }
                    }

                    state = self.state.lock();
                    continue;
                }
            }

            if state.permits > 0 {
                state.permits -= 1;
                state.creating += 1;
                drop(state);

                let created = self.create_listener(principal, criteria);

                let mut state = self.state.lock();
                state.creating -= 1;
                match created {
                    Ok(listener) => {
                        if state.shutdown {
                            state.permits += 1;
                            drop(state);
                            self.available_cond.notify_one();
                            self.destroy_listener(&listener);
                            return Err(ConduitError::Shutdown(self.name.clone()));
                        }
                        state.checked_out.insert(listener.id(), Arc::clone(&listener));
                        let in_use = state.note_checkout();
                        drop(state);
                        self.metrics.record_checkout(in_use);
                        return Ok(listener);
                    }
                    Err(e) => {
                        state.permits += 1;
                        drop(state);
                        self.available_cond.notify_one();
                        return Err(e);
                    }
                }
            }

            if Instant::now() >= deadline {
                drop(state);
                self.metrics.record_blocking_timeout();
                return Err(ConduitError::ResourceUnavailable {
                    pool: self.name.clone(),
                    waited: started.elapsed(),
                    max_size: self.config.max_size,
                });
            }

            self.available_cond.wait_until(&mut state, deadline);
            skip_idle = false;
        }
    }

    /// Gives a checked-out listener back.
    ///
    /// The listener goes on top of the idle list unless `kill` is set, cleanup
    /// fails, it is marked for destroy, it still has handles or an
    /// enlistment, or the pool is shutting down. In those cases it is
    /// destroyed and its permit released.
    pub fn return_connection(&self, listener: &Arc<ConnectionListener>, kill: bool) {
        if !self.state.lock().checked_out.contains_key(&listener.id()) {
            debug!(pool = %self.name, listener = %listener.id(), "Ignoring return of a connection not checked out");
            return;
        }

        let mut kill = kill;
        if let Err(e) = listener.managed_connection().cleanup() {
            warn!(pool = %self.name, listener = %listener.id(), error = %e, "Cleanup failed, destroying connection");
            kill = true;
        }
        if listener.is_marked_for_destroy() || listener.is_destroyed() {
            kill = true;
        }
        if listener.has_handles() {
            warn!(pool = %self.name, listener = %listener.id(), "Returned connection still has open handles");
            kill = true;
        }
        if listener.is_enlisted() {
            warn!(pool = %self.name, listener = %listener.id(), "Returned connection is still enlisted");
            kill = true;
        }

        let mut state = self.state.lock();
        if state.checked_out.remove(&listener.id()).is_none() {
            return;
        }

        if !kill && !state.shutdown && state.available.len() < self.config.max_size {
            listener.touch();
            state.available.push(Arc::clone(listener));
            let in_use = state.in_use();
            drop(state);
            self.metrics.record_in_use(in_use);
            self.available_cond.notify_one();
            debug!(pool = %self.name, listener = %listener.id(), "Connection returned to pool");
            return;
        }

        state.permits += 1;
        let in_use = state.in_use();
        drop(state);
        self.metrics.record_in_use(in_use);
        self.available_cond.notify_one();
        self.destroy_listener(listener);
    }

    /// Destroys idle connections last used before `threshold`.
    ///
    /// Scans from the least recently returned end and stops at the first
    /// connection that has not expired. Returns the number evicted.
    pub fn remove_timed_out(&self, threshold: Instant) -> usize {
        let expired: Vec<_> = {
            let mut state = self.state.lock();
            let floor = if self.config.strict_min {
                self.config.min_size
            } else {
                0
            };
            let removable = state.connection_count().saturating_sub(floor);
            let count = state
                .available
                .iter()
                .take(removable)
                .take_while(|l| l.last_used() < threshold)
                .count();
            state.permits += count;
            state.available.drain(..count).collect()
        };

        if expired.is_empty() {
            return 0;
        }

        self.available_cond.notify_all();
        for listener in &expired {
            self.destroy_listener(listener);
        }
        self.metrics.record_idle_evictions(expired.len());
        debug!(pool = %self.name, evicted = expired.len(), "Evicted idle connections");

        if self.config.min_size > 0 {
            self.request_fill();
        }
        expired.len()
    }

    /// Destroys all idle connections and marks checked-out ones for destroy.
    pub fn flush(&self) {
        let (idle, in_use) = {
            let mut state = self.state.lock();
            let idle: Vec<_> = state.available.drain(..).collect();
            state.permits += idle.len();
            let in_use: Vec<_> = state.checked_out.values().cloned().collect();
            (idle, in_use)
        };

        self.available_cond.notify_all();
        for listener in &in_use {
            listener.mark_for_destroy();
        }
        for listener in &idle {
            self.destroy_listener(listener);
        }
        info!(
            pool = %self.name,
            destroyed = idle.len(),
            marked = in_use.len(),
            "Pool flushed"
        );

        if self.config.min_size > 0 {
            self.request_fill();
        }
    }

    /// Creates connections until the pool holds `min_size`.
    ///
    /// Runs on the background filler. Waits for permits up to the blocking
    /// timeout; failures are logged and end the fill.
    pub fn fill_to_min(&self) {
        loop {
            {
                let deadline = Instant::now() + self.config.blocking_timeout();
                let mut state = self.state.lock();
                loop {
                    if state.shutdown || state.connection_count() >= self.config.min_size {
                        return;
                    }
                    if state.permits > 0 {
                        break;
                    }
                    if self
                        .available_cond
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        debug!(pool = %self.name, "Gave up filling pool, no permit available");
                        return;
                    }
                }
                state.permits -= 1;
                state.creating += 1;
            }

            let created = self.create_listener(self.principal.as_ref(), &self.criteria);

            let mut state = self.state.lock();
            state.creating -= 1;
            match created {
                Ok(listener) if !state.shutdown => {
                    state.available.push(listener);
                    drop(state);
                    self.available_cond.notify_one();
                }
                Ok(listener) => {
                    state.permits += 1;
                    drop(state);
                    self.destroy_listener(&listener);
                    return;
                }
                Err(e) => {
                    state.permits += 1;
                    drop(state);
                    self.available_cond.notify_one();
                    warn!(pool = %self.name, error = %e, "Failed to fill pool to minimum size");
                    return;
                }
            }
        }
    }

    /// Asks the background filler to top the pool up to `min_size`.
    pub fn request_fill(&self) {
        if self.config.min_size == 0 || self.state.lock().shutdown {
            return;
        }
        self.workers.request_fill(self.this.clone());
    }

    /// Stops the pool: wakes waiters, destroys idle connections and leaves
    /// checked-out ones to be destroyed on return.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
        }
        self.available_cond.notify_all();
        self.workers.unregister(self.id);
        self.flush();
        info!(pool = %self.name, "Pool shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shutdown
    }

    pub fn stats(&self) -> PoolStatistics {
        let state = self.state.lock();
        PoolStatistics {
            max_size: self.config.max_size,
            connection_count: state.connection_count(),
            in_use: state.in_use(),
            idle: state.available.len(),
            available_permits: state.permits,
            created: self.metrics.get_created(),
            destroyed: self.metrics.get_destroyed(),
            max_used: state.max_used,
            blocking_timeouts: self.metrics.get_blocking_timeouts(),
            idle_evictions: self.metrics.get_idle_evictions(),
        }
    }

    fn create_listener(
        &self,
        principal: Option<&Principal>,
        criteria: &RequestCriteria,
    ) -> Result<Arc<ConnectionListener>> {
        let managed = self
            .factory
            .create_managed_connection(principal, criteria)
            .map_err(|e| {
                ConduitError::creation(
                    format!("Could not create connection for pool '{}'", self.name),
                    e,
                )
            })?;

        let listener = ConnectionListener::new(managed, self.this.clone(), self.sink.clone());
        self.metrics.record_created();
        debug!(pool = %self.name, listener = %listener.id(), "Created managed connection");
        Ok(listener)
    }

    fn destroy_checked_out(&self, listener: &Arc<ConnectionListener>) {
        {
            let mut state = self.state.lock();
            if state.checked_out.remove(&listener.id()).is_some() {
                state.permits += 1;
            }
        }
        self.available_cond.notify_one();
        self.destroy_listener(listener);
    }

    fn destroy_listener(&self, listener: &Arc<ConnectionListener>) {
        if listener.destroy() {
            self.metrics.record_destroyed();
        }
    }
}

impl Drop for PermitGatedPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for listener in state.available.drain(..) {
            listener.destroy();
        }
    }
}
