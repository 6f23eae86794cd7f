//! Metrics Collection
//!
//! Per-pool counters exported through the `metrics` facade and mirrored in
//! atomics so statistics can be read without a recorder installed:
//! - Connections created and destroyed
//! - Checkouts and blocking timeouts
//! - Idle evictions
//! - Connections in use

use metrics::{counter, describe_counter, describe_gauge, gauge};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

/// Snapshot of one pool, or an aggregate over several.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStatistics {
    /// Configured upper bound (summed when aggregated)
    pub max_size: usize,
    /// Open physical connections, idle and in use
    pub connection_count: usize,
    /// Connections checked out or being created
    pub in_use: usize,
    /// Connections waiting in the idle list
    pub idle: usize,
    /// Permits not consumed by any connection
    pub available_permits: usize,
    /// Connections created since start
    pub created: u64,
    /// Connections destroyed since start
    pub destroyed: u64,
    /// Highest in-use count observed
    pub max_used: usize,
    /// Checkouts that gave up waiting
    pub blocking_timeouts: u64,
    /// Connections evicted for being idle too long
    pub idle_evictions: u64,
}

impl PoolStatistics {
    /// Adds another snapshot into this one.
    pub fn accumulate(&mut self, other: &PoolStatistics) {
        self.max_size += other.max_size;
        self.connection_count += other.connection_count;
        self.in_use += other.in_use;
        self.idle += other.idle;
        self.available_permits += other.available_permits;
        self.created += other.created;
        self.destroyed += other.destroyed;
        self.max_used += other.max_used;
        self.blocking_timeouts += other.blocking_timeouts;
        self.idle_evictions += other.idle_evictions;
    }
}

static DESCRIBE: Once = Once::new();

fn describe() {
    DESCRIBE.call_once(|| {
        describe_counter!(
            "conduit_pool_connections_created_total",
            "Total physical connections created"
        );
        describe_counter!(
            "conduit_pool_connections_destroyed_total",
            "Total physical connections destroyed"
        );
        describe_counter!("conduit_pool_checkouts_total", "Total successful checkouts");
        describe_counter!(
            "conduit_pool_blocking_timeouts_total",
            "Total checkouts that timed out waiting for a connection"
        );
        describe_counter!(
            "conduit_pool_idle_evictions_total",
            "Total connections evicted by the idle sweeper"
        );
        describe_gauge!("conduit_pool_in_use", "Connections currently checked out");
    });
}

/// Pool metrics collector
#[derive(Debug)]
pub struct PoolMetrics {
    pool: String,
    created: AtomicU64,
    destroyed: AtomicU64,
    checkouts: AtomicU64,
    blocking_timeouts: AtomicU64,
    idle_evictions: AtomicU64,
}

impl PoolMetrics {
    pub fn new(pool: impl Into<String>) -> Self {
        describe();

        Self {
            pool: pool.into(),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            checkouts: AtomicU64::new(0),
            blocking_timeouts: AtomicU64::new(0),
            idle_evictions: AtomicU64::new(0),
        }
    }

    pub fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
        counter!("conduit_pool_connections_created_total", "pool" => self.pool.clone())
            .increment(1);
    }

    pub fn record_destroyed(&self) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        counter!("conduit_pool_connections_destroyed_total", "pool" => self.pool.clone())
            .increment(1);
    }

    pub fn record_checkout(&self, in_use: usize) {
        self.checkouts.fetch_add(1, Ordering::Relaxed);
        counter!("conduit_pool_checkouts_total", "pool" => self.pool.clone()).increment(1);
        self.record_in_use(in_use);
    }

    pub fn record_blocking_timeout(&self) {
        self.blocking_timeouts.fetch_add(1, Ordering::Relaxed);
        counter!("conduit_pool_blocking_timeouts_total", "pool" => self.pool.clone())
            .increment(1);
    }

    pub fn record_idle_evictions(&self, count: usize) {
        self.idle_evictions
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!("conduit_pool_idle_evictions_total", "pool" => self.pool.clone())
            .increment(count as u64);
    }

    pub fn record_in_use(&self, in_use: usize) {
        gauge!("conduit_pool_in_use", "pool" => self.pool.clone()).set(in_use as f64);
    }

    pub fn get_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn get_destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn get_checkouts(&self) -> u64 {
        self.checkouts.load(Ordering::Relaxed)
    }

    pub fn get_blocking_timeouts(&self) -> u64 {
        self.blocking_timeouts.load(Ordering::Relaxed)
    }

    pub fn get_idle_evictions(&self) -> u64 {
        self.idle_evictions.load(Ordering::Relaxed)
    }
}
