//! Transaction enlistment policies
//!
//! A connection manager delegates everything transaction specific to one
//! [`EnlistmentPolicy`], chosen from its configured [`TransactionSupport`]:
//!
//! - [`NoTransactionPolicy`] never enlists.
//! - [`LocalTransactionPolicy`] enlists a [`LocalTransactionBridge`] wrapping
//!   the connection's local transaction.
//! - [`XaTransactionPolicy`] enlists the connection's own XA resource.

use conduit_core::config::TransactionSupport;
use conduit_core::xa::{Xid, TMFAIL, TMSUCCESS};
use conduit_core::{ConduitError, Result};
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::listener::{ConnectionListener, Enlistment};
use crate::local_tx::LocalTransactionBridge;
use crate::spi::{Synchronization, Transaction, TransactionStatus, XaResource};

/// Enlists and delists listeners in global transactions.
pub trait EnlistmentPolicy: Send + Sync {
    /// Returns true if connections take part in transactions.
    fn is_transactional(&self) -> bool;

    /// Enlists the listener's resource in `transaction`.
    ///
    /// Returns true if it was newly enlisted, false if it already was.
    fn enlist(
        &self,
        listener: &Arc<ConnectionListener>,
        transaction: &Arc<dyn Transaction>,
    ) -> Result<bool>;

    /// Ends the listener's enlistment, if any.
    fn delist(&self, listener: &Arc<ConnectionListener>) -> Result<()>;
}

/// Builds the policy for a transaction support level.
pub fn policy_for(support: TransactionSupport) -> Box<dyn EnlistmentPolicy> {
    match support {
        TransactionSupport::None => Box::new(NoTransactionPolicy),
        TransactionSupport::Local => Box::new(LocalTransactionPolicy),
        TransactionSupport::Xa => Box::new(XaTransactionPolicy),
    }
}

/// Policy for resources that never take part in transactions.
#[derive(Debug, Default)]
pub struct NoTransactionPolicy;

impl EnlistmentPolicy for NoTransactionPolicy {
    fn is_transactional(&self) -> bool {
        false
    }

    fn enlist(
        &self,
        _listener: &Arc<ConnectionListener>,
        _transaction: &Arc<dyn Transaction>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn delist(&self, _listener: &Arc<ConnectionListener>) -> Result<()> {
        Ok(())
    }
}

/// Policy bridging local transactions into global ones.
#[derive(Debug, Default)]
pub struct LocalTransactionPolicy;

impl EnlistmentPolicy for LocalTransactionPolicy {
    fn is_transactional(&self) -> bool {
        true
    }

    fn enlist(
        &self,
        listener: &Arc<ConnectionListener>,
        transaction: &Arc<dyn Transaction>,
    ) -> Result<bool> {
        enlist_resource(listener, transaction, || {
            let local = listener.managed_connection().local_transaction()?;
            let bridge: Arc<dyn XaResource> =
                Arc::new(LocalTransactionBridge::new(Arc::downgrade(listener), local));
            Ok(bridge)
        })
    }

    fn delist(&self, listener: &Arc<ConnectionListener>) -> Result<()> {
        delist_resource(listener)
    }
}

/// Policy enlisting the connection's XA resource.
#[derive(Debug, Default)]
pub struct XaTransactionPolicy;

impl EnlistmentPolicy for XaTransactionPolicy {
    fn is_transactional(&self) -> bool {
        true
    }

    fn enlist(
        &self,
        listener: &Arc<ConnectionListener>,
        transaction: &Arc<dyn Transaction>,
    ) -> Result<bool> {
        enlist_resource(listener, transaction, || {
            listener.managed_connection().xa_resource()
        })
    }

    fn delist(&self, listener: &Arc<ConnectionListener>) -> Result<()> {
        delist_resource(listener)
    }
}

fn enlist_resource<F>(
    listener: &Arc<ConnectionListener>,
    transaction: &Arc<dyn Transaction>,
    create: F,
) -> Result<bool>
where
    F: FnOnce() -> std::result::Result<Arc<dyn XaResource>, conduit_core::BoxError>,
{
    let xid = transaction.xid();
    if let Some(current) = listener.enlisted_xid() {
        if current == xid {
            return Ok(false);
        }
        return Err(ConduitError::illegal_state(format!(
            "connection {} is already enlisted in {} and cannot join {}",
            listener.id(),
            current,
            xid
        )));
    }

    let resource = listener.xa_resource_with(create)?;
    transaction
        .enlist_resource(Arc::clone(&resource))
        .map_err(|e| {
            ConduitError::enlistment_caused(format!("Could not enlist in transaction {}", xid), e)
        })?;

    listener.set_enlistment(Enlistment {
        transaction: Arc::clone(transaction),
        xid: xid.clone(),
        resource,
    });

    let clear = Arc::new(ClearEnlistment {
        listener: Arc::downgrade(listener),
        xid: xid.clone(),
    });
    if let Err(e) = transaction.register_synchronization(clear) {
        debug!(listener = %listener.id(), xid = %xid, error = %e, "Could not register enlistment cleanup");
    }

    debug!(listener = %listener.id(), xid = %xid, "Enlisted connection");
    Ok(true)
}

fn delist_resource(listener: &Arc<ConnectionListener>) -> Result<()> {
    let Some(enlistment) = listener.take_enlistment() else {
        return Ok(());
    };
    if !enlistment.transaction.status().is_unresolved() {
        return Ok(());
    }

    let flags = if listener.is_marked_for_destroy() {
        TMFAIL
    } else {
        TMSUCCESS
    };
    enlistment
        .transaction
        .delist_resource(enlistment.resource, flags)
        .map_err(|e| {
            ConduitError::enlistment_caused(
                format!("Could not delist from transaction {}", enlistment.xid),
                e,
            )
        })?;

    debug!(listener = %listener.id(), xid = %enlistment.xid, "Delisted connection");
    Ok(())
}

/// Forgets a listener's enlistment once its transaction has completed.
struct ClearEnlistment {
    listener: Weak<ConnectionListener>,
    xid: Xid,
}

impl Synchronization for ClearEnlistment {
    fn after_completion(&self, _status: TransactionStatus) {
        if let Some(listener) = self.listener.upgrade() {
            listener.clear_enlistment_for(&self.xid);
        }
    }
}
