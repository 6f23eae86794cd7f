//! Local transaction bridge
//!
//! Lets a resource that only supports single-resource transactions take part
//! in a global transaction as a one-phase participant. Preparing always votes
//! yes, so the global outcome is only atomic when the bridged resource is the
//! last one to commit.

use conduit_core::xa::{
    Vote, XaError, Xid, TMJOIN, TMNOFLAGS, TMRESUME, XAER_INVAL, XAER_PROTO, XAER_RMERR,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

use crate::listener::ConnectionListener;
use crate::spi::{ConnectionEventListener, LocalTransaction, XaResource};

/// Adapts a [`LocalTransaction`] to the [`XaResource`] contract.
pub struct LocalTransactionBridge {
    listener: Weak<ConnectionListener>,
    local: Arc<dyn LocalTransaction>,
    current: Mutex<Option<Xid>>,
    warned: AtomicBool,
}

impl LocalTransactionBridge {
    pub fn new(listener: Weak<ConnectionListener>, local: Arc<dyn LocalTransaction>) -> Self {
        Self {
            listener,
            local,
            current: Mutex::new(None),
            warned: AtomicBool::new(false),
        }
    }

    /// The branch currently running on the local transaction.
    pub fn current_xid(&self) -> Option<Xid> {
        self.current.lock().clone()
    }

    fn expect_current(&self, xid: &Xid) -> Result<(), XaError> {
        match self.current.lock().as_ref() {
            Some(current) if current == xid => Ok(()),
            Some(current) => Err(XaError::new(
                XAER_PROTO,
                format!("local transaction is running {}, not {}", current, xid),
            )),
            None => Err(XaError::new(
                XAER_PROTO,
                format!("no local transaction is running for {}", xid),
            )),
        }
    }

    /// Destroys the owning connection, reporting it like a driver error so
    /// its handles, enlistment and permit are released.
    fn fail_connection(&self, error: &str) {
        if let Some(listener) = self.listener.upgrade() {
            listener.connection_error_occurred(None, error);
        }
    }

    fn finish<F>(&self, xid: &Xid, action: &str, complete: F) -> Result<(), XaError>
    where
        F: FnOnce() -> Result<(), conduit_core::BoxError>,
    {
        self.expect_current(xid)?;
        self.current.lock().take();

        if let Err(e) = complete() {
            let message = format!("local transaction {} failed for {}", action, xid);
            warn!(xid = %xid, action, error = %e, "Local transaction failed, destroying connection");
            self.fail_connection(&message);
            return Err(XaError::caused(XAER_RMERR, message, e));
        }

        debug!(xid = %xid, action, "Local transaction completed");
        Ok(())
    }
}

impl XaResource for LocalTransactionBridge {
    fn start(&self, xid: &Xid, flags: i32) -> Result<(), XaError> {
        match flags {
            TMNOFLAGS => {
                if let Some(current) = self.current.lock().as_ref() {
                    return Err(XaError::new(
                        XAER_PROTO,
                        format!("local transaction already running for {}", current),
                    ));
                }
                self.local.begin().map_err(|e| {
                    XaError::caused(XAER_RMERR, "could not begin local transaction", e)
                })?;
                *self.current.lock() = Some(xid.clone());
                Ok(())
            }
            TMJOIN | TMRESUME => self.expect_current(xid),
            other => Err(XaError::new(
                XAER_INVAL,
                format!("unsupported start flags {:#x}", other),
            )),
        }
    }

    fn end(&self, _xid: &Xid, _flags: i32) -> Result<(), XaError> {
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> Result<Vote, XaError> {
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!(xid = %xid, "Preparing a local transaction resource; the outcome is not atomic");
        }
        Ok(Vote::Ok)
    }

    fn commit(&self, xid: &Xid, _one_phase: bool) -> Result<(), XaError> {
        self.finish(xid, "commit", || self.local.commit())
    }

    fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.finish(xid, "rollback", || self.local.rollback())
    }

    fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        Err(XaError::new(
            XAER_RMERR,
            format!("local transactions cannot forget {}", xid),
        ))
    }

    fn recover(&self, _flags: i32) -> Result<Vec<Xid>, XaError> {
        Ok(Vec::new())
    }
}
