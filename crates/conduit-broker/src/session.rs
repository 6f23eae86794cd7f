//! Broker sessions
//!
//! A session sends and consumes messages under one acknowledgement mode.
//! Transacted and XA sessions route their work through the connection's
//! [`TransactionManager`]; the others talk to the channel directly.

use conduit_core::config::AckMode;
use conduit_core::xa::{Vote, XaError, Xid, TMNOFLAGS, XAER_RMERR};
use conduit_core::{ConduitError, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::message::{AckRequest, Message, Subscription, TxId};
use crate::transaction::TransactionManager;

#[derive(Default)]
struct SessionState {
    current: Option<TxId>,
    unacked: Vec<AckRequest>,
    subscriptions: Vec<String>,
    closed: bool,
}

/// A single-threaded unit of work on a broker connection.
pub struct Session {
    id: String,
    ack_mode: AckMode,
    xa: bool,
    transactions: Arc<TransactionManager>,
    state: Mutex<SessionState>,
    next_consumer: AtomicU64,
}

impl Session {
    pub fn new(transactions: Arc<TransactionManager>, ack_mode: AckMode, xa: bool) -> Self {
        let id = Uuid::new_v4().to_string();
        debug!(session = %id, ?ack_mode, xa, "Session created");

        Self {
            id,
            ack_mode,
            xa,
            transactions,
            state: Mutex::new(SessionState::default()),
            next_consumer: AtomicU64::new(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn ack_mode(&self) -> AckMode {
        self.ack_mode
    }

    pub fn is_xa(&self) -> bool {
        self.xa
    }

    /// True if sends and acknowledgements are buffered in a branch.
    pub fn is_transacted(&self) -> bool {
        self.xa || self.ack_mode == AckMode::Transacted
    }

    /// The branch the session is currently working in.
    pub fn current_transaction(&self) -> Option<TxId> {
        self.state.lock().current.clone()
    }

    /// Delivered messages waiting for a client acknowledgement.
    pub fn unacknowledged(&self) -> usize {
        self.state.lock().unacked.len()
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(ConduitError::Shutdown(format!("session {}", self.id)));
        }
        Ok(())
    }

    /// Returns the current branch, starting an anonymous one if needed.
    fn current_or_start(&self) -> Result<TxId> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(ConduitError::Shutdown(format!("session {}", self.id)));
        }
        if let Some(tx) = &state.current {
            return Ok(tx.clone());
        }
        let tx = self.transactions.start_anonymous();
        state.current = Some(tx.clone());
        Ok(tx)
    }

    // ------------------------------------------------------------------------
    // Producing and consuming
    // ------------------------------------------------------------------------

    /// Sends a message, buffering it when the session is transacted.
    pub async fn send(&self, message: Message) -> Result<()> {
        if self.is_transacted() {
            let tx = self.current_or_start()?;
            return self.transactions.add_message(&tx, message);
        }

        self.ensure_open()?;
        let channel = self.transactions.channel();
        self.transactions
            .request("send", channel.send(message))
            .await?;
        self.transactions.metrics().record_sent(1);
        Ok(())
    }

    /// Records that a message was delivered to one of this session's consumers.
    pub async fn deliver(&self, message: &Message, consumer_id: &str) -> Result<()> {
        let ack = AckRequest::ack(message, consumer_id);

        if self.is_transacted() {
            let tx = self.current_or_start()?;
            return self.transactions.ack_message(&tx, ack);
        }

        self.ensure_open()?;
        match self.ack_mode {
            AckMode::Client => {
                self.state.lock().unacked.push(ack);
                Ok(())
            }
            _ => self.send_acks(vec![ack]).await,
        }
    }

    /// Sends acknowledgements in order.
    ///
    /// The unsent remainder goes back to the front of the unacknowledged list
    /// when one fails.
    async fn send_acks(&self, acks: Vec<AckRequest>) -> Result<()> {
        let channel = self.transactions.channel();
        let mut pending = acks.into_iter();
        let mut sent = 0;

        while let Some(ack) = pending.next() {
            let result = self
                .transactions
                .request("acknowledge", channel.acknowledge(ack.clone()))
                .await;
            if let Err(e) = result {
                self.transactions.metrics().record_acks(sent);
                if self.ack_mode == AckMode::Client {
                    self.requeue(ack, pending);
                }
                return Err(e);
            }
            sent += 1;
        }

        self.transactions.metrics().record_acks(sent);
        Ok(())
    }

    /// Puts acknowledgements that were not sent back in front of the
    /// unacknowledged list, keeping delivery order.
    fn requeue(&self, failed: AckRequest, rest: impl Iterator<Item = AckRequest>) {
        let mut state = self.state.lock();
        let tail = std::mem::take(&mut state.unacked);
        state.unacked = std::iter::once(failed).chain(rest).chain(tail).collect();
    }

    /// Acknowledges every message delivered so far in client mode.
    pub async fn acknowledge(&self) -> Result<()> {
        self.ensure_open()?;
        if self.ack_mode != AckMode::Client || self.xa {
            return Ok(());
        }
        let acks = std::mem::take(&mut self.state.lock().unacked);
        self.send_acks(acks).await
    }

    /// Asks the broker to redeliver unacknowledged messages.
    pub async fn recover(&self) -> Result<()> {
        self.ensure_open()?;
        if self.is_transacted() {
            return Err(ConduitError::illegal_state(
                "recover is not allowed in a transacted session",
            ));
        }

        let acks = std::mem::take(&mut self.state.lock().unacked);
        let channel = self.transactions.channel();
        let mut pending = acks.into_iter();
        let mut nacked = 0;
        while let Some(ack) = pending.next() {
            let result = self
                .transactions
                .request("nack", channel.acknowledge(ack.nack()))
                .await;
            if let Err(e) = result {
                self.transactions.metrics().record_nacks(nacked);
                self.requeue(ack, pending);
                return Err(e);
            }
            nacked += 1;
        }
        self.transactions.metrics().record_nacks(nacked);
        debug!(session = %self.id, nacked, "Session recovered");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Local transactions
    // ------------------------------------------------------------------------

    fn ensure_local_transacted(&self, action: &str) -> Result<()> {
        self.ensure_open()?;
        if self.xa {
            return Err(ConduitError::illegal_state(format!(
                "{} is controlled by the transaction manager in an XA session",
                action
            )));
        }
        if self.ack_mode != AckMode::Transacted {
            return Err(ConduitError::illegal_state(format!(
                "{} requires a transacted session",
                action
            )));
        }
        Ok(())
    }

    fn clear_current(&self, tx: &TxId) {
        let mut state = self.state.lock();
        if state.current.as_ref() == Some(tx) {
            state.current = None;
        }
    }

    /// Commits the work done since the last commit or rollback.
    pub async fn commit(&self) -> Result<()> {
        self.ensure_local_transacted("commit")?;
        let Some(tx) = self.current_transaction() else {
            return Ok(());
        };
        self.transactions.commit(&tx, true).await?;
        self.clear_current(&tx);
        Ok(())
    }

    /// Discards the work done since the last commit or rollback.
    pub async fn rollback(&self) -> Result<()> {
        self.ensure_local_transacted("rollback")?;
        let Some(tx) = self.current_transaction() else {
            return Ok(());
        };
        self.transactions.rollback(&tx).await?;
        self.clear_current(&tx);
        Ok(())
    }

    /// Checks a message listener left no unclaimed work behind.
    ///
    /// In an XA session, a branch still anonymous after delivery was never
    /// started by a transaction manager. It is rolled back and reported.
    pub async fn after_delivery(&self) -> Result<()> {
        if !self.xa {
            return Ok(());
        }

        let abandoned = {
            let mut state = self.state.lock();
            if state.current.as_ref().is_some_and(TxId::is_anonymous) {
                state.current.take()
            } else {
                None
            }
        };
        let Some(tx) = abandoned else {
            return Ok(());
        };

        warn!(session = %self.id, tx = %tx, "Delivery work was never claimed by a transaction manager");
        if let Err(e) = self.transactions.rollback(&tx).await {
            warn!(session = %self.id, tx = %tx, error = %e, "Failed to roll back unclaimed branch");
        }
        Err(ConduitError::UnclaimedTransaction {
            branch: tx.to_string(),
        })
    }

    // ------------------------------------------------------------------------
    // Consumers
    // ------------------------------------------------------------------------

    /// Registers a consumer and returns its identifier.
    pub async fn subscribe(&self, destination: &str, selector: Option<&str>) -> Result<String> {
        self.ensure_open()?;
        let consumer_id = format!(
            "{}-{}",
            self.id,
            self.next_consumer.fetch_add(1, Ordering::Relaxed)
        );
        let mut subscription = Subscription::new(consumer_id.clone(), destination);
        if let Some(selector) = selector {
            subscription = subscription.with_selector(selector);
        }

        let channel = self.transactions.channel();
        self.transactions
            .request("subscribe", channel.subscribe(subscription))
            .await?;
        self.state.lock().subscriptions.push(consumer_id.clone());
        Ok(consumer_id)
    }

    /// Removes one of this session's consumers.
    pub async fn unsubscribe(&self, consumer_id: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.state.lock().subscriptions.iter().any(|c| c == consumer_id) {
            return Err(ConduitError::illegal_state(format!(
                "consumer {} does not belong to session {}",
                consumer_id, self.id
            )));
        }

        let channel = self.transactions.channel();
        self.transactions
            .request("unsubscribe", channel.unsubscribe(consumer_id))
            .await?;
        self.state.lock().subscriptions.retain(|c| c != consumer_id);
        Ok(())
    }

    /// Closes the session.
    ///
    /// Open work is rolled back, unacknowledged messages are released and
    /// consumers are removed. Failures are logged, never returned.
    pub async fn close(&self) {
        let (current, unacked, subscriptions) = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                state.current.take(),
                std::mem::take(&mut state.unacked),
                std::mem::take(&mut state.subscriptions),
            )
        };

        // Branches claimed by a transaction manager are completed by it.
        if let Some(tx) = current.filter(|tx| tx.is_anonymous()) {
            if let Err(e) = self.transactions.rollback(&tx).await {
                warn!(session = %self.id, tx = %tx, error = %e, "Rollback on close failed");
            }
        }

        let channel = self.transactions.channel();
        for ack in unacked {
            if let Err(e) = self
                .transactions
                .request("nack", channel.acknowledge(ack.nack()))
                .await
            {
                warn!(session = %self.id, message_id = %ack.message_id, error = %e, "NACK on close failed");
            }
        }

        for consumer_id in subscriptions {
            if let Err(e) = self
                .transactions
                .request("unsubscribe", channel.unsubscribe(&consumer_id))
                .await
            {
                warn!(session = %self.id, consumer = %consumer_id, error = %e, "Unsubscribe on close failed");
            }
        }

        debug!(session = %self.id, "Session closed");
    }

    /// XA resource bound to this session.
    pub fn xa_resource(self: &Arc<Self>) -> Result<SessionXaResource> {
        if !self.xa {
            return Err(ConduitError::illegal_state(format!(
                "session {} is not an XA session",
                self.id
            )));
        }
        Ok(SessionXaResource {
            session: Arc::clone(self),
        })
    }
}

// ============================================================================
// XA resource
// ============================================================================

fn to_xa(error: ConduitError) -> XaError {
    match error {
        ConduitError::Xa(e) => e,
        other => XaError::caused(XAER_RMERR, "broker request failed", other),
    }
}

/// Lets a transaction manager drive an XA session's branches.
#[derive(Clone)]
pub struct SessionXaResource {
    session: Arc<Session>,
}

impl SessionXaResource {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Associates the session with `xid`.
    ///
    /// Starting with no flags while the session holds an anonymous branch
    /// claims that branch, keeping the work buffered so far.
    pub async fn start(&self, xid: &Xid, flags: i32) -> std::result::Result<(), XaError> {
        let tm = &self.session.transactions;
        let mut state = self.session.state.lock();

        let tx = match &state.current {
            Some(anonymous) if flags == TMNOFLAGS && anonymous.is_anonymous() => {
                tm.convert_tx(anonymous, xid).map_err(to_xa)?
            }
            _ => tm.start(xid, flags).map_err(to_xa)?,
        };
        state.current = Some(tx);
        Ok(())
    }

    /// Dissociates the session from `xid`.
    pub async fn end(&self, xid: &Xid, flags: i32) -> std::result::Result<(), XaError> {
        let tx = TxId::Global(xid.clone());
        self.session.transactions.end(&tx, flags).map_err(to_xa)?;
        self.session.clear_current(&tx);
        Ok(())
    }

    pub async fn prepare(&self, xid: &Xid) -> std::result::Result<Vote, XaError> {
        let tx = TxId::Global(xid.clone());
        self.session.transactions.prepare(&tx).await.map_err(to_xa)
    }

    pub async fn commit(&self, xid: &Xid, one_phase: bool) -> std::result::Result<(), XaError> {
        let tx = TxId::Global(xid.clone());
        self.session
            .transactions
            .commit(&tx, one_phase)
            .await
            .map_err(to_xa)
    }

    pub async fn rollback(&self, xid: &Xid) -> std::result::Result<(), XaError> {
        let tx = TxId::Global(xid.clone());
        self.session.transactions.rollback(&tx).await.map_err(to_xa)?;
        self.session.clear_current(&tx);
        Ok(())
    }

    pub async fn forget(&self, xid: &Xid) -> std::result::Result<(), XaError> {
        self.session.transactions.forget(xid).await.map_err(to_xa)
    }

    pub async fn recover(&self, flags: i32) -> std::result::Result<Vec<Xid>, XaError> {
        self.session.transactions.recover(flags).await.map_err(to_xa)
    }

    /// True if both resources share a broker connection.
    pub fn is_same_rm(&self, other: &SessionXaResource) -> bool {
        Arc::ptr_eq(&self.session.transactions, &other.session.transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{AckKind, TxRequestKind};
    use crate::testkit::{ChannelCall, RecordingChannel};
    use conduit_core::config::BrokerConfig;
    use conduit_core::xa::{TMSUCCESS, XAER_PROTO};

    fn setup(ack_mode: AckMode, xa: bool) -> (Arc<Session>, Arc<RecordingChannel>) {
        let channel = RecordingChannel::new();
        let tm = Arc::new(TransactionManager::new(
            channel.clone(),
            &BrokerConfig::default(),
        ));
        (Arc::new(Session::new(tm, ack_mode, xa)), channel)
    }

    #[tokio::test]
    async fn test_auto_ack_sends_directly() {
        let (session, channel) = setup(AckMode::Auto, false);
        let message = Message::new("orders", "one");

        session.send(message.clone()).await.unwrap();
        session.deliver(&message, "c1").await.unwrap();

        assert_eq!(channel.sent(), vec![message.clone()]);
        assert_eq!(channel.acks(), vec![AckRequest::ack(&message, "c1")]);
        assert_eq!(session.current_transaction(), None);
    }

    #[tokio::test]
    async fn test_client_ack_waits_for_acknowledge() {
        let (session, channel) = setup(AckMode::Client, false);
        session.deliver(&Message::new("q", "1"), "c1").await.unwrap();
        session.deliver(&Message::new("q", "2"), "c1").await.unwrap();

        assert!(channel.acks().is_empty());
        assert_eq!(session.unacknowledged(), 2);

        session.acknowledge().await.unwrap();
        assert_eq!(channel.acks().len(), 2);
        assert_eq!(session.unacknowledged(), 0);
    }

    #[tokio::test]
    async fn test_recover_nacks_unacknowledged() {
        let (session, channel) = setup(AckMode::Client, false);
        session.deliver(&Message::new("q", "1"), "c1").await.unwrap();

        session.recover().await.unwrap();
        let acks = channel.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].kind, AckKind::Nack);
        assert_eq!(session.unacknowledged(), 0);
    }

    #[tokio::test]
    async fn test_failed_recover_keeps_unsent_nacks() {
        let (session, channel) = setup(AckMode::Client, false);
        let delivered: Vec<_> = (0..3).map(|i| Message::new("q", format!("{}", i))).collect();
        for message in &delivered {
            session.deliver(message, "c1").await.unwrap();
        }
        channel.fail_acks_after(Some(1));

        assert!(session.recover().await.is_err());
        assert_eq!(channel.acks().len(), 1);
        assert_eq!(session.unacknowledged(), 2);
        assert_eq!(session.transactions.metrics().snapshot().nacks, 1);

        channel.fail_acks_after(None);
        session.recover().await.unwrap();
        let acks = channel.acks();
        assert_eq!(acks.len(), 3);
        assert!(acks.iter().all(|ack| ack.kind == AckKind::Nack));
        let ids: Vec<_> = acks.iter().map(|ack| ack.message_id.clone()).collect();
        let expected: Vec<_> = delivered.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, expected);
        assert_eq!(session.unacknowledged(), 0);
    }

    #[tokio::test]
    async fn test_transacted_commit() {
        let (session, channel) = setup(AckMode::Transacted, false);
        let message = Message::new("orders", "one");

        session.send(message.clone()).await.unwrap();
        session.deliver(&Message::new("in", "x"), "c1").await.unwrap();
        assert!(channel.calls().is_empty());
        assert!(session.current_transaction().unwrap().is_anonymous());

        session.commit().await.unwrap();
        let requests = channel.transactions();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, TxRequestKind::OnePhaseCommit);
        assert_eq!(requests[0].messages, vec![message]);
        assert_eq!(requests[0].acks.len(), 1);
        assert_eq!(session.current_transaction(), None);

        assert!(session.recover().await.is_err());
    }

    #[tokio::test]
    async fn test_transacted_rollback_nacks() {
        let (session, channel) = setup(AckMode::Transacted, false);
        session.send(Message::new("orders", "one")).await.unwrap();
        session.deliver(&Message::new("in", "x"), "c1").await.unwrap();

        session.rollback().await.unwrap();
        assert!(channel.sent().is_empty());
        assert!(channel.transactions().is_empty());
        assert_eq!(channel.acks()[0].kind, AckKind::Nack);
    }

    #[tokio::test]
    async fn test_xa_session_rejects_local_commit() {
        let (session, _channel) = setup(AckMode::Auto, true);
        assert!(matches!(
            session.commit().await,
            Err(ConduitError::IllegalState(_))
        ));
        let (plain, _channel) = setup(AckMode::Auto, false);
        assert!(plain.xa_resource().is_err());
    }

    #[tokio::test]
    async fn test_xa_start_claims_anonymous_branch() {
        let (session, channel) = setup(AckMode::Auto, true);
        let inbound = Message::new("in", "x");
        session.deliver(&inbound, "c1").await.unwrap();
        session.send(Message::new("out", "y")).await.unwrap();

        let resource = session.xa_resource().unwrap();
        let xid = Xid::generate();
        resource.start(&xid, TMNOFLAGS).await.unwrap();
        assert_eq!(
            session.current_transaction(),
            Some(TxId::Global(xid.clone()))
        );

        resource.end(&xid, TMSUCCESS).await.unwrap();
        session.after_delivery().await.unwrap();
        assert_eq!(resource.prepare(&xid).await.unwrap(), Vote::Ok);
        resource.commit(&xid, false).await.unwrap();

        let requests = channel.transactions();
        assert_eq!(requests[0].tx, TxId::Global(xid));
        assert_eq!(requests[0].messages.len(), 1);
        assert_eq!(requests[0].acks, vec![AckRequest::ack(&inbound, "c1")]);
    }

    #[tokio::test]
    async fn test_unclaimed_branch_is_rolled_back() {
        let (session, channel) = setup(AckMode::Auto, true);
        session.deliver(&Message::new("in", "x"), "c1").await.unwrap();

        let err = session.after_delivery().await.unwrap_err();
        assert!(matches!(err, ConduitError::UnclaimedTransaction { .. }));
        assert_eq!(session.current_transaction(), None);
        assert_eq!(channel.acks()[0].kind, AckKind::Nack);
        assert!(channel.transactions().is_empty());
    }

    #[tokio::test]
    async fn test_xa_start_errors_map_to_codes() {
        let (session, _channel) = setup(AckMode::Auto, true);
        let resource = session.xa_resource().unwrap();
        let xid = Xid::generate();

        resource.start(&xid, TMNOFLAGS).await.unwrap();
        resource.end(&xid, TMSUCCESS).await.unwrap();
        assert_eq!(resource.end(&xid, TMSUCCESS).await.unwrap_err().code, XAER_PROTO);
        assert!(resource.is_same_rm(&session.xa_resource().unwrap()));
    }

    #[tokio::test]
    async fn test_close_releases_everything() {
        let (session, channel) = setup(AckMode::Client, false);
        let consumer = session.subscribe("orders", Some("priority > 3")).await.unwrap();
        session.deliver(&Message::new("orders", "1"), &consumer).await.unwrap();

        session.close().await;
        assert!(session.is_closed());

        let calls = channel.calls();
        assert!(matches!(calls[0], ChannelCall::Subscribe(_)));
        assert!(matches!(&calls[1], ChannelCall::Acknowledge(ack) if ack.kind == AckKind::Nack));
        assert_eq!(calls[2], ChannelCall::Unsubscribe(consumer));
        assert!(session.send(Message::new("q", "late")).await.is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_foreign_consumer() {
        let (session, _channel) = setup(AckMode::Auto, false);
        assert!(session.unsubscribe("someone-else").await.is_err());
        let consumer = session.subscribe("orders", None).await.unwrap();
        session.unsubscribe(&consumer).await.unwrap();
    }
}
