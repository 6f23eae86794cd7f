//! In-memory broker channel for tests and demos.

use async_trait::async_trait;
use conduit_core::{ConduitError, Result, Xid};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::channel::BrokerChannel;
use crate::message::{AckRequest, Message, Subscription, TransactionRequest, TxId, TxRequestKind};

/// A request received by [`RecordingChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelCall {
    Send(Message),
    Acknowledge(AckRequest),
    Transact(TransactionRequest),
    Recover,
    Subscribe(Subscription),
    Unsubscribe(String),
}

/// Records every request and keeps track of prepared branches.
#[derive(Default)]
pub struct RecordingChannel {
    calls: Mutex<Vec<ChannelCall>>,
    prepared: Mutex<Vec<Xid>>,
    fail_transactions: AtomicBool,
    ack_budget: Mutex<Option<usize>>,
    delay: Mutex<Option<Duration>>,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Makes transaction requests fail until reset.
    pub fn fail_transactions(&self, fail: bool) {
        self.fail_transactions.store(fail, Ordering::SeqCst);
    }

    /// Accepts `count` more acknowledgements and fails the rest, or accepts
    /// all of them again with `None`.
    pub fn fail_acks_after(&self, count: Option<usize>) {
        *self.ack_budget.lock() = count;
    }

    /// Delays every request by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Seeds a branch the broker reports on recovery.
    pub fn add_prepared(&self, xid: Xid) {
        self.prepared.lock().push(xid);
    }

    pub fn prepared(&self) -> Vec<Xid> {
        self.prepared.lock().clone()
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.calls.lock().clone()
    }

    /// Messages sent outside a transaction.
    pub fn sent(&self) -> Vec<Message> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ChannelCall::Send(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Acknowledgements sent outside a transaction.
    pub fn acks(&self) -> Vec<AckRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ChannelCall::Acknowledge(ack) => Some(ack.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn transactions(&self) -> Vec<TransactionRequest> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                ChannelCall::Transact(request) => Some(request.clone()),
                _ => None,
            })
            .collect()
    }

    async fn pause(&self) {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn record(&self, call: ChannelCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BrokerChannel for RecordingChannel {
    async fn send(&self, message: Message) -> Result<()> {
        self.pause().await;
        self.record(ChannelCall::Send(message));
        Ok(())
    }

    async fn acknowledge(&self, ack: AckRequest) -> Result<()> {
        self.pause().await;
        {
            let mut budget = self.ack_budget.lock();
            match budget.as_mut() {
                Some(0) => {
                    return Err(ConduitError::Broker {
                        message: format!("injected failure for {}", ack.message_id),
                        source: None,
                    })
                }
                Some(left) => *left -= 1,
                None => {}
            }
        }
        self.record(ChannelCall::Acknowledge(ack));
        Ok(())
    }

    async fn transact(&self, request: TransactionRequest) -> Result<()> {
        self.pause().await;
        if self.fail_transactions.load(Ordering::SeqCst) {
            return Err(ConduitError::Broker {
                message: format!("injected failure for {}", request.tx),
                source: None,
            });
        }

        if let TxId::Global(xid) = &request.tx {
            let mut prepared = self.prepared.lock();
            match request.kind {
                TxRequestKind::Prepare => prepared.push(xid.clone()),
                TxRequestKind::Commit | TxRequestKind::Rollback | TxRequestKind::Forget => {
                    prepared.retain(|p| p != xid)
                }
                TxRequestKind::OnePhaseCommit => {}
            }
        }
        self.record(ChannelCall::Transact(request));
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<Xid>> {
        self.pause().await;
        self.record(ChannelCall::Recover);
        Ok(self.prepared())
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        self.pause().await;
        self.record(ChannelCall::Subscribe(subscription));
        Ok(())
    }

    async fn unsubscribe(&self, consumer_id: &str) -> Result<()> {
        self.pause().await;
        self.record(ChannelCall::Unsubscribe(consumer_id.to_string()));
        Ok(())
    }
}
