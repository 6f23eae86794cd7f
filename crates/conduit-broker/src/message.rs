//! Broker message envelopes and requests
//!
//! The body and property table are carried opaquely; their byte-level
//! encoding belongs to the transport behind [`crate::channel::BrokerChannel`].

use bytes::Bytes;
use conduit_core::Xid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Identifier assigned to a message by its producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a unique identifier.
    pub fn generate() -> Self {
        Self(format!("ID:{}", Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message travelling to or from the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    /// Queue or topic name
    pub destination: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    pub body: Bytes,
    /// Set by the broker when the message was delivered before
    #[serde(default)]
    pub redelivered: bool,
    #[serde(default)]
    pub delivery_count: u32,
}

impl Message {
    pub fn new(destination: impl Into<String>, body: impl Into<Bytes>) -> Self {
        Self {
            id: MessageId::generate(),
            destination: destination.into(),
            properties: BTreeMap::new(),
            body: body.into(),
            redelivered: false,
            delivery_count: 0,
        }
    }

    /// Adds a property, replacing any previous value.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Positive or negative acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckKind {
    /// Message consumed
    Ack,
    /// Message should be redelivered
    Nack,
}

/// Acknowledgement of one delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckRequest {
    pub message_id: MessageId,
    pub destination: String,
    pub consumer_id: String,
    pub kind: AckKind,
}

impl AckRequest {
    /// Positive acknowledgement of a delivered message.
    pub fn ack(message: &Message, consumer_id: impl Into<String>) -> Self {
        Self {
            message_id: message.id.clone(),
            destination: message.destination.clone(),
            consumer_id: consumer_id.into(),
            kind: AckKind::Ack,
        }
    }

    /// The same acknowledgement turned negative.
    pub fn nack(&self) -> Self {
        Self {
            kind: AckKind::Nack,
            ..self.clone()
        }
    }
}

/// Identifies a branch in the client-side transaction table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxId {
    /// Started by the session before any transaction manager claimed it
    Anonymous(u64),
    /// Started by a transaction manager
    Global(Xid),
}

impl TxId {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, TxId::Anonymous(_))
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxId::Anonymous(n) => write!(f, "anonymous-{}", n),
            TxId::Global(xid) => write!(f, "{}", xid),
        }
    }
}

/// What a transaction request asks the broker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxRequestKind {
    /// Apply the carried work and commit in one step
    OnePhaseCommit,
    /// Durably record the carried work under the branch id
    Prepare,
    /// Commit a prepared branch
    Commit,
    /// Roll back a prepared branch
    Rollback,
    /// Discard a heuristically completed branch
    Forget,
}

/// Transactional work shipped to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub kind: TxRequestKind,
    pub tx: TxId,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub acks: Vec<AckRequest>,
}

impl TransactionRequest {
    /// A request that carries no buffered work.
    pub fn control(kind: TxRequestKind, tx: TxId) -> Self {
        Self {
            kind,
            tx,
            messages: Vec::new(),
            acks: Vec::new(),
        }
    }
}

/// A consumer registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub consumer_id: String,
    pub destination: String,
    #[serde(default)]
    pub selector: Option<String>,
}

impl Subscription {
    pub fn new(consumer_id: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            destination: destination.into(),
            selector: None,
        }
    }

    pub fn with_selector(mut self, selector: impl Into<String>) -> Self {
        self.selector = Some(selector.into());
        self
    }
}
