//! Broker connection
//!
//! Owns the channel and the branch table shared by all sessions created on it.

use conduit_core::config::{AckMode, BrokerConfig};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::info;

use crate::channel::BrokerChannel;
use crate::metrics::BrokerStatistics;
use crate::session::Session;
use crate::transaction::TransactionManager;

/// One connection to a message broker.
pub struct BrokerConnection {
    config: BrokerConfig,
    transactions: Arc<TransactionManager>,
    sessions: Mutex<Vec<Weak<Session>>>,
}

impl BrokerConnection {
    pub fn new(channel: Arc<dyn BrokerChannel>, config: BrokerConfig) -> Self {
        info!(client_id = %config.client_id, xa = config.xa, "Broker connection opened");
        let transactions = Arc::new(TransactionManager::new(channel, &config));

        Self {
            config,
            transactions,
            sessions: Mutex::new(Vec::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.config.client_id
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    fn register(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        let mut sessions = self.sessions.lock();
        sessions.retain(|s| s.strong_count() > 0);
        sessions.push(Arc::downgrade(&session));
        session
    }

    /// Creates a session using the configured acknowledgement mode and XA setting.
    pub fn create_default_session(&self) -> Arc<Session> {
        self.register(Session::new(
            Arc::clone(&self.transactions),
            self.config.ack_mode,
            self.config.xa,
        ))
    }

    /// Creates a non-XA session.
    pub fn create_session(&self, ack_mode: AckMode) -> Arc<Session> {
        self.register(Session::new(Arc::clone(&self.transactions), ack_mode, false))
    }

    /// Creates a session whose transactions are driven by a transaction manager.
    pub fn create_xa_session(&self) -> Arc<Session> {
        self.register(Session::new(
            Arc::clone(&self.transactions),
            AckMode::Auto,
            true,
        ))
    }

    /// Number of sessions still alive and open.
    pub fn open_sessions(&self) -> usize {
        self.sessions
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|s| !s.is_closed())
            .count()
    }

    pub fn stats(&self) -> BrokerStatistics {
        self.transactions.metrics().snapshot()
    }

    /// Closes every session created on this connection.
    pub async fn close(&self) {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .lock()
            .drain(..)
            .filter_map(|s| s.upgrade())
            .collect();

        for session in sessions {
            session.close().await;
        }
        info!(client_id = %self.config.client_id, "Broker connection closed");
    }
}
