//! Background workers
//!
//! Two long-lived threads serve every pool in the process:
//!
//! - the [`IdleSweeper`] periodically evicts connections idle longer than
//!   their pool's idle timeout. Its interval is half the smallest timeout of
//!   the registered pools, and registering a pool with a shorter timeout
//!   wakes it early.
//! - the [`BackgroundFiller`] consumes fill requests from a queue and tops
//!   pools up to their minimum size, so callers never pay for it.
//!
//! Pools only hold weak references in both workers.

use conduit_core::types::ObjectId;
use conduit_core::{ConduitError, Result};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::pool::PermitGatedPool;

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

struct RegisteredPool {
    id: ObjectId,
    pool: Weak<PermitGatedPool>,
    idle_timeout: Duration,
}

#[derive(Default)]
struct SweeperState {
    pools: Vec<RegisteredPool>,
    interval: Option<Duration>,
    next_run: Option<Instant>,
    sweeps: u64,
    shutdown: bool,
}

impl SweeperState {
    fn recompute_interval(&mut self) -> Option<Duration> {
        self.pools
            .iter()
            .map(|r| r.idle_timeout)
            .min()
            .map(|t| (t / 2).max(MIN_SWEEP_INTERVAL))
    }

    fn targets(&mut self) -> Vec<(Arc<PermitGatedPool>, Duration)> {
        self.pools.retain(|r| r.pool.strong_count() > 0);
        self.pools
            .iter()
            .filter_map(|r| r.pool.upgrade().map(|p| (p, r.idle_timeout)))
            .collect()
    }
}

struct SweeperShared {
    state: Mutex<SweeperState>,
    wakeup: Condvar,
}

/// Evicts idle connections from registered pools.
pub struct IdleSweeper {
    shared: Arc<SweeperShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl IdleSweeper {
    fn new() -> Self {
        Self {
            shared: Arc::new(SweeperShared {
                state: Mutex::new(SweeperState::default()),
                wakeup: Condvar::new(),
            }),
            thread: Mutex::new(None),
        }
    }

    fn spawn(&self) -> Result<()> {
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("conduit-idle-sweeper".to_string())
            .spawn(move || Self::run(shared))
            .map_err(|e| ConduitError::resource("Could not start idle sweeper", e))?;
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    fn run(shared: Arc<SweeperShared>) {
        let mut state = shared.state.lock();
        loop {
            if state.shutdown {
                break;
            }
            match state.next_run {
                None => shared.wakeup.wait(&mut state),
                Some(at) if Instant::now() < at => {
                    shared.wakeup.wait_until(&mut state, at);
                }
                Some(_) => {
                    let targets = state.targets();
                    state.sweeps += 1;
                    state.next_run = state.interval.map(|i| Instant::now() + i);
                    MutexGuard::unlocked(&mut state, || sweep(&targets));
                }
            }
        }
        debug!("Idle sweeper stopped");
    }

    /// Starts sweeping `pool` with the given idle timeout.
    pub fn register(&self, pool: &Arc<PermitGatedPool>, idle_timeout: Duration) {
        let mut state = self.shared.state.lock();
        state.pools.retain(|r| r.id != pool.id());
        state.pools.push(RegisteredPool {
            id: pool.id(),
            pool: Arc::downgrade(pool),
            idle_timeout,
        });

        let interval = state.recompute_interval();
        let sooner = match (interval, state.interval) {
            (Some(new), Some(current)) => new < current,
            (Some(_), None) => true,
            _ => false,
        };
        state.interval = interval;
        if sooner {
            let next = interval.map(|i| Instant::now() + i);
            state.next_run = next;
            debug!(pool = %pool.name(), interval = ?interval, "Idle sweeper interval shortened");
            self.shared.wakeup.notify_one();
        }
    }

    pub fn unregister(&self, id: ObjectId) {
        let mut state = self.shared.state.lock();
        state.pools.retain(|r| r.id != id);
        state.interval = state.recompute_interval();
        if state.interval.is_none() {
            state.next_run = None;
        }
    }

    /// Current sweep interval, if any pool is registered.
    pub fn interval(&self) -> Option<Duration> {
        self.shared.state.lock().interval
    }

    pub fn registered_pools(&self) -> usize {
        self.shared.state.lock().pools.len()
    }

    /// Number of sweeps performed by the background thread.
    pub fn sweep_count(&self) -> u64 {
        self.shared.state.lock().sweeps
    }

    /// Sweeps every registered pool on the calling thread.
    pub fn sweep_now(&self) {
        let targets = self.shared.state.lock().targets();
        sweep(&targets);
    }

    fn signal_shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wakeup.notify_all();
    }
}

fn sweep(targets: &[(Arc<PermitGatedPool>, Duration)]) {
    let now = Instant::now();
    for (pool, idle_timeout) in targets {
        if let Some(threshold) = now.checked_sub(*idle_timeout) {
            pool.remove_timed_out(threshold);
        }
    }
}

enum FillRequest {
    Fill(Weak<PermitGatedPool>),
    Shutdown,
}

/// Fills pools to their minimum size off the caller's thread.
pub struct BackgroundFiller {
    tx: flume::Sender<FillRequest>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundFiller {
    fn detached() -> Self {
        let (tx, _rx) = flume::unbounded();
        Self {
            tx,
            thread: Mutex::new(None),
        }
    }

    fn start() -> Result<Self> {
        let (tx, rx) = flume::unbounded::<FillRequest>();
        let handle = thread::Builder::new()
            .name("conduit-pool-filler".to_string())
            .spawn(move || {
                while let Ok(request) = rx.recv() {
                    match request {
                        FillRequest::Fill(pool) => {
                            if let Some(pool) = pool.upgrade() {
                                pool.fill_to_min();
                            }
                        }
                        FillRequest::Shutdown => break,
                    }
                }
                debug!("Background filler stopped");
            })
            .map_err(|e| ConduitError::resource("Could not start background filler", e))?;

        Ok(Self {
            tx,
            thread: Mutex::new(Some(handle)),
        })
    }

    pub fn request_fill(&self, pool: Weak<PermitGatedPool>) {
        if self.tx.send(FillRequest::Fill(pool)).is_err() {
            debug!("Background filler not running, fill request dropped");
        }
    }

    fn signal_shutdown(&self) {
        let _ = self.tx.send(FillRequest::Shutdown);
    }
}

/// The sweeper and filler shared by a set of pools.
pub struct PoolWorkers {
    sweeper: IdleSweeper,
    filler: BackgroundFiller,
}

static GLOBAL: OnceLock<Arc<PoolWorkers>> = OnceLock::new();

impl PoolWorkers {
    /// Starts both background threads.
    pub fn start() -> Result<Arc<Self>> {
        let sweeper = IdleSweeper::new();
        sweeper.spawn()?;
        let filler = match BackgroundFiller::start() {
            Ok(filler) => filler,
            Err(e) => {
                sweeper.signal_shutdown();
                return Err(e);
            }
        };
        info!("Pool workers started");
        Ok(Arc::new(Self { sweeper, filler }))
    }

    /// Workers without threads: nothing is swept or filled in the background.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self {
            sweeper: IdleSweeper::new(),
            filler: BackgroundFiller::detached(),
        })
    }

    /// Process-wide workers, started on first use.
    pub fn global() -> Result<Arc<Self>> {
        if let Some(workers) = GLOBAL.get() {
            return Ok(Arc::clone(workers));
        }
        let workers = Self::start()?;
        if GLOBAL.set(Arc::clone(&workers)).is_err() {
            workers.shutdown();
        }
        Ok(Arc::clone(GLOBAL.get().unwrap_or(&workers)))
    }

    pub fn sweeper(&self) -> &IdleSweeper {
        &self.sweeper
    }

    pub fn filler(&self) -> &BackgroundFiller {
        &self.filler
    }

    /// Registers `pool` for idle eviction if it has an idle timeout.
    pub fn register(&self, pool: &Arc<PermitGatedPool>) {
        if let Some(idle_timeout) = pool.config().idle_timeout() {
            self.sweeper.register(pool, idle_timeout);
        }
    }

    pub fn unregister(&self, id: ObjectId) {
        self.sweeper.unregister(id);
    }

    pub fn request_fill(&self, pool: Weak<PermitGatedPool>) {
        self.filler.request_fill(pool);
    }

    /// Stops both threads and waits for them unless called from one of them.
    pub fn shutdown(&self) {
        self.sweeper.signal_shutdown();
        self.filler.signal_shutdown();

        let current = thread::current().id();
        for slot in [&self.sweeper.thread, &self.filler.thread] {
            let handle = slot.lock().take();
            if let Some(handle) = handle {
                if handle.thread().id() != current {
                    let _ = handle.join();
                }
            }
        }
    }
}

impl Drop for PoolWorkers {
    fn drop(&mut self) {
        // may run on a worker thread, so never join here
        self.sweeper.signal_shutdown();
        self.filler.signal_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spi::ManagedConnectionFactory;
    use crate::testkit::InMemoryFactory;
    use conduit_core::config::PoolConfig;
    use conduit_core::RequestCriteria;

    fn pool(
        workers: &Arc<PoolWorkers>,
        factory: &Arc<InMemoryFactory>,
        config: PoolConfig,
    ) -> Arc<PermitGatedPool> {
        let factory: Arc<dyn ManagedConnectionFactory> = factory.clone();
        PermitGatedPool::builder("test", factory, Arc::clone(workers))
            .config(config)
            .build()
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_interval_is_half_the_smallest_timeout() {
        let workers = PoolWorkers::detached();
        let factory = InMemoryFactory::new("test");

        let slow = pool(&workers, &factory, PoolConfig { idle_timeout_ms: 10_000, ..Default::default() });
        let fast = pool(&workers, &factory, PoolConfig { idle_timeout_ms: 2_000, ..Default::default() });

        workers.register(&slow);
        assert_eq!(workers.sweeper().interval(), Some(Duration::from_secs(5)));

        workers.register(&fast);
        assert_eq!(workers.sweeper().interval(), Some(Duration::from_secs(1)));

        workers.unregister(fast.id());
        assert_eq!(workers.sweeper().interval(), Some(Duration::from_secs(5)));
        assert_eq!(workers.sweeper().registered_pools(), 1);
    }

    #[test]
    fn test_zero_idle_timeout_is_not_registered() {
        let workers = PoolWorkers::detached();
        let factory = InMemoryFactory::new("test");
        let p = pool(&workers, &factory, PoolConfig { idle_timeout_ms: 0, ..Default::default() });

        workers.register(&p);
        assert_eq!(workers.sweeper().registered_pools(), 0);
        assert!(workers.sweeper().interval().is_none());
    }

    #[test]
    fn test_background_sweep_evicts_idle_connections() {
        let workers = PoolWorkers::start().unwrap();
        let factory = InMemoryFactory::new("test");
        let p = pool(
            &workers,
            &factory,
            PoolConfig {
                idle_timeout_ms: 40,
                max_size: 2,
                ..Default::default()
            },
        );
        workers.register(&p);

        let listener = p.checkout(None, &RequestCriteria::default()).unwrap();
        p.return_connection(&listener, false);
        assert_eq!(p.stats().idle, 1);

        assert!(wait_for(|| p.stats().idle == 0));
        assert!(listener.is_destroyed());
        assert!(workers.sweeper().sweep_count() > 0);
        workers.shutdown();
    }

    #[test]
    fn test_filler_reaches_min_size() {
        let workers = PoolWorkers::start().unwrap();
        let factory = InMemoryFactory::new("test");
        let p = pool(
            &workers,
            &factory,
            PoolConfig {
                min_size: 2,
                max_size: 4,
                ..Default::default()
            },
        );

        p.request_fill();
        assert!(wait_for(|| p.stats().idle == 2));
        assert_eq!(factory.created_count(), 2);
        workers.shutdown();
    }

    #[test]
    fn test_detached_filler_drops_requests() {
        let workers = PoolWorkers::detached();
        let factory = InMemoryFactory::new("test");
        let p = pool(&workers, &factory, PoolConfig { min_size: 1, ..Default::default() });

        p.request_fill();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(factory.created_count(), 0);
    }

    #[test]
    fn test_sweep_now_runs_on_caller() {
        let workers = PoolWorkers::detached();
        let factory = InMemoryFactory::new("test");
        let p = pool(&workers, &factory, PoolConfig { idle_timeout_ms: 1, ..Default::default() });
        workers.register(&p);

        let listener = p.checkout(None, &RequestCriteria::default()).unwrap();
        p.return_connection(&listener, false);
        thread::sleep(Duration::from_millis(10));

        workers.sweeper().sweep_now();
        assert_eq!(p.stats().idle, 0);
    }
}
