//! Client-side transaction branches
//!
//! Sent messages and acknowledgements made inside a transaction are not
//! forwarded as they happen. Each branch buffers them until it is prepared or
//! committed, when the whole batch travels to the broker in one request.
//! A branch rolled back before it was prepared never reaches the broker: its
//! messages are dropped and its acknowledgements are turned into NACKs so the
//! consumed messages get redelivered.

use conduit_core::config::BrokerConfig;
use conduit_core::xa::{
    Vote, XaError, Xid, TMFAIL, TMJOIN, TMNOFLAGS, TMRESUME, TMSTARTRSCAN, TMSUCCESS, TMSUSPEND,
    XAER_DUPID, XAER_INVAL, XAER_NOTA, XAER_PROTO, XAER_RMERR, XA_RBROLLBACK,
};
use conduit_core::{BoxError, ConduitError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::channel::BrokerChannel;
use crate::message::{AckRequest, Message, TransactionRequest, TxId, TxRequestKind};
use crate::metrics::BrokerMetrics;

/// Lifecycle position of a branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchPhase {
    /// Associated and accepting work
    Open,
    /// Association suspended, can be resumed
    Suspended,
    /// Association ended, awaiting completion
    Ended,
    /// Work recorded by the broker, awaiting commit or rollback
    Prepared,
}

#[derive(Debug)]
struct BranchState {
    phase: BranchPhase,
    rollback_only: bool,
    messages: Vec<Message>,
    acks: Vec<AckRequest>,
}

impl BranchState {
    fn new(phase: BranchPhase) -> Self {
        Self {
            phase,
            rollback_only: false,
            messages: Vec::new(),
            acks: Vec::new(),
        }
    }
}

fn xa(code: i32, message: impl Into<String>) -> ConduitError {
    ConduitError::Xa(XaError::new(code, message))
}

fn xa_caused(code: i32, message: impl Into<String>, source: impl Into<BoxError>) -> ConduitError {
    ConduitError::Xa(XaError::caused(code, message, source))
}

/// Branch table for one broker connection.
pub struct TransactionManager {
    channel: Arc<dyn BrokerChannel>,
    metrics: Arc<BrokerMetrics>,
    request_timeout: Duration,
    branches: Mutex<HashMap<TxId, BranchState>>,
    next_anonymous: AtomicU64,
}

impl TransactionManager {
    pub fn new(channel: Arc<dyn BrokerChannel>, config: &BrokerConfig) -> Self {
        Self {
            channel,
            metrics: Arc::new(BrokerMetrics::new(config.client_id.clone())),
            request_timeout: config.request_timeout(),
            branches: Mutex::new(HashMap::new()),
            next_anonymous: AtomicU64::new(1),
        }
    }

    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn metrics(&self) -> &Arc<BrokerMetrics> {
        &self.metrics
    }

    /// Runs a broker request under the configured timeout.
    pub(crate) async fn request<T, F>(&self, action: &str, request: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.request_timeout, request).await {
            Ok(result) => result,
            Err(elapsed) => Err(ConduitError::broker(
                format!("{} timed out after {:?}", action, self.request_timeout),
                elapsed,
            )),
        }
    }

    // ------------------------------------------------------------------------
    // Association
    // ------------------------------------------------------------------------

    /// Starts a branch no transaction manager has claimed yet.
    pub fn start_anonymous(&self) -> TxId {
        let tx = TxId::Anonymous(self.next_anonymous.fetch_add(1, Ordering::Relaxed));
        self.branches
            .lock()
            .insert(tx.clone(), BranchState::new(BranchPhase::Open));
        debug!(tx = %tx, "Started anonymous branch");
        tx
    }

    /// Starts, joins or resumes the branch for `xid`.
    pub fn start(&self, xid: &Xid, flags: i32) -> Result<TxId> {
        let tx = TxId::Global(xid.clone());
        let mut branches = self.branches.lock();

        match flags {
            TMNOFLAGS => {
                if branches.contains_key(&tx) {
                    return Err(xa(XAER_DUPID, format!("branch {} already exists", tx)));
                }
                branches.insert(tx.clone(), BranchState::new(BranchPhase::Open));
            }
            TMJOIN | TMRESUME => {
                let branch = branches
                    .get_mut(&tx)
                    .ok_or_else(|| xa(XAER_NOTA, format!("unknown branch {}", tx)))?;
                let allowed = match flags {
                    TMJOIN => matches!(branch.phase, BranchPhase::Open | BranchPhase::Ended),
                    _ => branch.phase == BranchPhase::Suspended,
                };
                if !allowed {
                    return Err(xa(
                        XAER_PROTO,
                        format!("cannot rejoin branch {} while {:?}", tx, branch.phase),
                    ));
                }
                branch.phase = BranchPhase::Open;
            }
            other => {
                return Err(xa(XAER_INVAL, format!("unsupported start flags {:#x}", other)));
            }
        }

        debug!(tx = %tx, flags, "Branch associated");
        Ok(tx)
    }

    /// Ends or suspends the association with a branch.
    pub fn end(&self, tx: &TxId, flags: i32) -> Result<()> {
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(tx)
            .ok_or_else(|| xa(XAER_NOTA, format!("unknown branch {}", tx)))?;

        match (flags, branch.phase) {
            (TMSUSPEND, BranchPhase::Open) => branch.phase = BranchPhase::Suspended,
            (TMSUCCESS, BranchPhase::Open | BranchPhase::Suspended) => {
                branch.phase = BranchPhase::Ended
            }
            (TMFAIL, BranchPhase::Open | BranchPhase::Suspended | BranchPhase::Ended) => {
                branch.phase = BranchPhase::Ended;
                branch.rollback_only = true;
            }
            (TMSUSPEND | TMSUCCESS | TMFAIL, phase) => {
                return Err(xa(
                    XAER_PROTO,
                    format!("cannot end branch {} while {:?}", tx, phase),
                ));
            }
            (other, _) => {
                return Err(xa(XAER_INVAL, format!("unsupported end flags {:#x}", other)));
            }
        }
        Ok(())
    }

    /// Re-keys an anonymous branch to a transaction manager identifier.
    ///
    /// The buffered messages and acknowledgements move with the branch.
    pub fn convert_tx(&self, anonymous: &TxId, xid: &Xid) -> Result<TxId> {
        if !anonymous.is_anonymous() {
            return Err(xa(XAER_INVAL, format!("{} is not an anonymous branch", anonymous)));
        }
        let target = TxId::Global(xid.clone());

        let mut branches = self.branches.lock();
        if branches.contains_key(&target) {
            return Err(xa(XAER_DUPID, format!("branch {} already exists", target)));
        }
        let branch = branches
            .remove(anonymous)
            .ok_or_else(|| xa(XAER_NOTA, format!("unknown branch {}", anonymous)))?;
        branches.insert(target.clone(), branch);

        debug!(from = %anonymous, to = %target, "Converted anonymous branch");
        Ok(target)
    }

    // ------------------------------------------------------------------------
    // Buffered work
    // ------------------------------------------------------------------------

    fn with_open<F>(&self, tx: &TxId, f: F) -> Result<()>
    where
        F: FnOnce(&mut BranchState),
    {
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(tx)
            .ok_or_else(|| xa(XAER_NOTA, format!("unknown branch {}", tx)))?;
        if branch.phase != BranchPhase::Open {
            return Err(xa(
                XAER_PROTO,
                format!("branch {} does not accept work while {:?}", tx, branch.phase),
            ));
        }
        f(branch);
        Ok(())
    }

    /// Buffers an outbound message in a branch.
    pub fn add_message(&self, tx: &TxId, message: Message) -> Result<()> {
        self.with_open(tx, |branch| branch.messages.push(message))
    }

    /// Buffers an acknowledgement in a branch.
    pub fn ack_message(&self, tx: &TxId, ack: AckRequest) -> Result<()> {
        self.with_open(tx, |branch| branch.acks.push(ack))
    }

    /// Marks a branch so that it can only roll back.
    pub fn set_rollback_only(&self, tx: &TxId) -> Result<()> {
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(tx)
            .ok_or_else(|| xa(XAER_NOTA, format!("unknown branch {}", tx)))?;
        branch.rollback_only = true;
        Ok(())
    }

    /// Takes the buffered work out of a completable branch.
    ///
    /// The branch is moved to `Ended` so no more work can be added while the
    /// request is in flight.
    fn take_work(&self, tx: &TxId) -> Result<(BranchPhase, Vec<Message>, Vec<AckRequest>)> {
        let mut branches = self.branches.lock();
        let branch = branches
            .get_mut(tx)
            .ok_or_else(|| xa(XAER_NOTA, format!("unknown branch {}", tx)))?;
        if !matches!(branch.phase, BranchPhase::Open | BranchPhase::Ended) {
            return Err(xa(
                XAER_PROTO,
                format!("branch {} cannot complete while {:?}", tx, branch.phase),
            ));
        }
        let previous = branch.phase;
        branch.phase = BranchPhase::Ended;
        Ok((
            previous,
            std::mem::take(&mut branch.messages),
            std::mem::take(&mut branch.acks),
        ))
    }

    fn restore_work(
        &self,
        tx: &TxId,
        phase: BranchPhase,
        messages: Vec<Message>,
        acks: Vec<AckRequest>,
    ) {
        if let Some(branch) = self.branches.lock().get_mut(tx) {
            branch.phase = phase;
            branch.messages = messages;
            branch.acks = acks;
        }
    }

    fn is_rollback_only_locked(&self, tx: &TxId) -> Result<bool> {
        self.branches
            .lock()
            .get(tx)
            .map(|branch| branch.rollback_only)
            .ok_or_else(|| xa(XAER_NOTA, format!("unknown branch {}", tx)))
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    /// Ships the buffered work to the broker as the first commit phase.
    pub async fn prepare(&self, tx: &TxId) -> Result<Vote> {
        if self.is_rollback_only_locked(tx)? {
            if let Err(e) = self.rollback(tx).await {
                error!(tx = %tx, error = %e, "Failed to roll back rollback-only branch");
            }
            return Err(xa(
                XA_RBROLLBACK,
                format!("branch {} was marked rollback-only", tx),
            ));
        }

        let (phase, messages, acks) = self.take_work(tx)?;
        if messages.is_empty() && acks.is_empty() {
            self.branches.lock().remove(tx);
            debug!(tx = %tx, "Prepared empty branch as read-only");
            return Ok(Vote::ReadOnly);
        }

        let request = TransactionRequest {
            kind: TxRequestKind::Prepare,
            tx: tx.clone(),
            messages: messages.clone(),
            acks: acks.clone(),
        };
        if let Err(e) = self.request("prepare", self.channel.transact(request)).await {
            self.restore_work(tx, phase, messages, acks);
            return Err(xa_caused(XAER_RMERR, format!("prepare of {} failed", tx), e));
        }

        match self.branches.lock().get_mut(tx) {
            Some(branch) => branch.phase = BranchPhase::Prepared,
            None => warn!(tx = %tx, "Branch completed while its prepare was in flight"),
        }
        self.metrics.record_sent(messages.len());
        self.metrics.record_acks(acks.len());
        debug!(tx = %tx, messages = messages.len(), acks = acks.len(), "Branch prepared");
        Ok(Vote::Ok)
    }

    /// Commits a branch.
    ///
    /// One-phase commit carries all buffered work in a single request.
    /// Two-phase commit confirms a branch that was prepared earlier.
    pub async fn commit(&self, tx: &TxId, one_phase: bool) -> Result<()> {
        if one_phase {
            self.commit_one_phase(tx).await
        } else {
            self.commit_prepared(tx).await
        }
    }

    async fn commit_one_phase(&self, tx: &TxId) -> Result<()> {
        if self.is_rollback_only_locked(tx)? {
            if let Err(e) = self.rollback(tx).await {
                error!(tx = %tx, error = %e, "Failed to roll back rollback-only branch");
            }
            return Err(xa(
                XA_RBROLLBACK,
                format!("branch {} was marked rollback-only", tx),
            ));
        }

        let (phase, messages, acks) = self.take_work(tx)?;
        let (sent, acked) = (messages.len(), acks.len());
        let request = TransactionRequest {
            kind: TxRequestKind::OnePhaseCommit,
            tx: tx.clone(),
            messages: messages.clone(),
            acks: acks.clone(),
        };
        if let Err(e) = self.request("commit", self.channel.transact(request)).await {
            self.restore_work(tx, phase, messages, acks);
            return Err(xa_caused(XAER_RMERR, format!("commit of {} failed", tx), e));
        }

        self.branches.lock().remove(tx);
        self.metrics.record_sent(sent);
        self.metrics.record_acks(acked);
        self.metrics.record_commit();
        debug!(tx = %tx, messages = sent, acks = acked, "Branch committed in one phase");
        Ok(())
    }

    async fn commit_prepared(&self, tx: &TxId) -> Result<()> {
        let phase = self.phase(tx);
        match phase {
            Some(BranchPhase::Prepared) => {}
            Some(other) => {
                return Err(xa(
                    XAER_PROTO,
                    format!("branch {} is not prepared ({:?})", tx, other),
                ));
            }
            None => return Err(xa(XAER_NOTA, format!("unknown branch {}", tx))),
        }

        let request = TransactionRequest::control(TxRequestKind::Commit, tx.clone());
        self.request("commit", self.channel.transact(request))
            .await
            .map_err(|e| xa_caused(XAER_RMERR, format!("commit of {} failed", tx), e))?;

        self.branches.lock().remove(tx);
        self.metrics.record_commit();
        debug!(tx = %tx, "Prepared branch committed");
        Ok(())
    }

    /// Rolls a branch back.
    pub async fn rollback(&self, tx: &TxId) -> Result<()> {
        let branch = self
            .branches
            .lock()
            .remove(tx)
            .ok_or_else(|| xa(XAER_NOTA, format!("unknown branch {}", tx)))?;

        if branch.phase == BranchPhase::Prepared {
            let request = TransactionRequest::control(TxRequestKind::Rollback, tx.clone());
            if let Err(e) = self.request("rollback", self.channel.transact(request)).await {
                self.branches.lock().insert(tx.clone(), branch);
                return Err(xa_caused(XAER_RMERR, format!("rollback of {} failed", tx), e));
            }
        } else {
            let mut nacked = 0;
            for ack in &branch.acks {
                let nack = ack.nack();
                match self.request("nack", self.channel.acknowledge(nack)).await {
                    Ok(()) => nacked += 1,
                    Err(e) => {
                        warn!(tx = %tx, message_id = %ack.message_id, error = %e, "Failed to NACK message")
                    }
                }
            }
            self.metrics.record_nacks(nacked);
            debug!(
                tx = %tx,
                dropped = branch.messages.len(),
                nacked,
                "Rolled back unprepared branch"
            );
        }

        self.metrics.record_rollback();
        Ok(())
    }

    /// Tells the broker to discard a heuristically completed branch.
    pub async fn forget(&self, xid: &Xid) -> Result<()> {
        let tx = TxId::Global(xid.clone());
        let request = TransactionRequest::control(TxRequestKind::Forget, tx.clone());
        self.request("forget", self.channel.transact(request))
            .await
            .map_err(|e| xa_caused(XAER_RMERR, format!("forget of {} failed", tx), e))?;
        self.branches.lock().remove(&tx);
        Ok(())
    }

    /// Lists branches the broker holds prepared.
    ///
    /// Only a call carrying `TMSTARTRSCAN` asks the broker; the rest of the
    /// scan returns nothing. Recovered branches are tracked as prepared so
    /// they can be completed through this manager.
    pub async fn recover(&self, flags: i32) -> Result<Vec<Xid>> {
        if flags & TMSTARTRSCAN == 0 {
            return Ok(Vec::new());
        }

        let xids = self
            .request("recover", self.channel.recover())
            .await
            .map_err(|e| xa_caused(XAER_RMERR, "recovery scan failed", e))?;

        let mut branches = self.branches.lock();
        for xid in &xids {
            branches
                .entry(TxId::Global(xid.clone()))
                .or_insert_with(|| BranchState::new(BranchPhase::Prepared));
        }
        debug!(count = xids.len(), "Recovered prepared branches");
        Ok(xids)
    }

    // ------------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------------

    pub fn phase(&self, tx: &TxId) -> Option<BranchPhase> {
        self.branches.lock().get(tx).map(|branch| branch.phase)
    }

    pub fn is_rollback_only(&self, tx: &TxId) -> bool {
        self.branches
            .lock()
            .get(tx)
            .map(|branch| branch.rollback_only)
            .unwrap_or(false)
    }

    pub fn branch_count(&self) -> usize {
        self.branches.lock().len()
    }

    /// Number of buffered messages and acknowledgements in a branch.
    pub fn buffered(&self, tx: &TxId) -> Option<(usize, usize)> {
        self.branches
            .lock()
            .get(tx)
            .map(|branch| (branch.messages.len(), branch.acks.len()))
    }
}
