//! Broker client metrics
//!
//! Counters for sent messages, acknowledgements and transaction outcomes,
//! exported through the `metrics` facade and mirrored in atomics.

use metrics::{counter, describe_counter};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;

static DESCRIBE: Once = Once::new();

fn describe() {
    DESCRIBE.call_once(|| {
        describe_counter!("conduit_broker_messages_sent_total", "Messages sent to the broker");
        describe_counter!("conduit_broker_acks_total", "Positive acknowledgements sent");
        describe_counter!("conduit_broker_nacks_total", "Negative acknowledgements sent");
        describe_counter!("conduit_broker_commits_total", "Transaction branches committed");
        describe_counter!(
            "conduit_broker_rollbacks_total",
            "Transaction branches rolled back"
        );
    });
}

/// Snapshot of broker client activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStatistics {
    pub messages_sent: u64,
    pub acks: u64,
    pub nacks: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

impl fmt::Display for BrokerStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent={} acks={} nacks={} commits={} rollbacks={}",
            self.messages_sent, self.acks, self.nacks, self.commits, self.rollbacks
        )
    }
}

/// Metrics for one broker connection.
#[derive(Debug)]
pub struct BrokerMetrics {
    client_id: String,
    messages_sent: AtomicU64,
    acks: AtomicU64,
    nacks: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

impl BrokerMetrics {
    pub fn new(client_id: impl Into<String>) -> Self {
        describe();

        Self {
            client_id: client_id.into(),
            messages_sent: AtomicU64::new(0),
            acks: AtomicU64::new(0),
            nacks: AtomicU64::new(0),
            commits: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
        }
    }

    pub fn record_sent(&self, count: usize) {
        let count = count as u64;
        self.messages_sent.fetch_add(count, Ordering::Relaxed);
        counter!("conduit_broker_messages_sent_total", "client" => self.client_id.clone())
            .increment(count);
    }

    pub fn record_acks(&self, count: usize) {
        let count = count as u64;
        self.acks.fetch_add(count, Ordering::Relaxed);
        counter!("conduit_broker_acks_total", "client" => self.client_id.clone()).increment(count);
    }

    pub fn record_nacks(&self, count: usize) {
        let count = count as u64;
        self.nacks.fetch_add(count, Ordering::Relaxed);
        counter!("conduit_broker_nacks_total", "client" => self.client_id.clone())
            .increment(count);
    }

    pub fn record_commit(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        counter!("conduit_broker_commits_total", "client" => self.client_id.clone()).increment(1);
    }

    pub fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        counter!("conduit_broker_rollbacks_total", "client" => self.client_id.clone())
            .increment(1);
    }

    pub fn snapshot(&self) -> BrokerStatistics {
        BrokerStatistics {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            acks: self.acks.load(Ordering::Relaxed),
            nacks: self.nacks.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}
