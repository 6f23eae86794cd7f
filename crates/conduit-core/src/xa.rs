//! XA vocabulary shared by the connection manager and the broker client.
//!
//! Flag and return-code values follow the X/Open XA specification so that
//! identifiers and codes can be passed to external transaction managers
//! unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Flags
// ============================================================================

/// No flags set.
pub const TMNOFLAGS: i32 = 0x0000_0000;
/// Caller is joining an existing transaction branch.
pub const TMJOIN: i32 = 0x0020_0000;
/// Caller is resuming association with a suspended branch.
pub const TMRESUME: i32 = 0x0800_0000;
/// Dissociate caller from the branch, work succeeded.
pub const TMSUCCESS: i32 = 0x0400_0000;
/// Dissociate caller from the branch, work failed.
pub const TMFAIL: i32 = 0x2000_0000;
/// Suspend (not end) the association with the branch.
pub const TMSUSPEND: i32 = 0x0200_0000;
/// Start a recovery scan.
pub const TMSTARTRSCAN: i32 = 0x0100_0000;
/// End a recovery scan.
pub const TMENDRSCAN: i32 = 0x0080_0000;
/// Use one-phase commit.
pub const TMONEPHASE: i32 = 0x4000_0000;

// ============================================================================
// Return and error codes
// ============================================================================

/// Rollback caused by an unspecified reason.
pub const XA_RBROLLBACK: i32 = 100;
/// Rollback caused by a communication failure.
pub const XA_RBCOMMFAIL: i32 = 101;
/// The branch was heuristically committed.
pub const XA_HEURCOM: i32 = 7;
/// The branch was heuristically rolled back.
pub const XA_HEURRB: i32 = 6;
/// Resource manager error.
pub const XAER_RMERR: i32 = -3;
/// The XID is not valid.
pub const XAER_NOTA: i32 = -4;
/// Invalid arguments were given.
pub const XAER_INVAL: i32 = -5;
/// Routine invoked in an improper context.
pub const XAER_PROTO: i32 = -6;
/// Resource manager unavailable.
pub const XAER_RMFAIL: i32 = -7;
/// The XID already exists.
pub const XAER_DUPID: i32 = -8;

/// Returns a readable name for an XA code.
pub fn code_name(code: i32) -> &'static str {
    match code {
        XA_RBROLLBACK => "XA_RBROLLBACK",
        XA_RBCOMMFAIL => "XA_RBCOMMFAIL",
        XA_HEURCOM => "XA_HEURCOM",
        XA_HEURRB => "XA_HEURRB",
        XAER_RMERR => "XAER_RMERR",
        XAER_NOTA => "XAER_NOTA",
        XAER_INVAL => "XAER_INVAL",
        XAER_PROTO => "XAER_PROTO",
        XAER_RMFAIL => "XAER_RMFAIL",
        XAER_DUPID => "XAER_DUPID",
        _ => "XA_UNKNOWN",
    }
}

/// Vote returned from `prepare`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    /// Ready to commit.
    Ok,
    /// Branch did no work and is already complete.
    ReadOnly,
}

/// An XA failure carrying a specification error code.
#[derive(Debug, Error)]
#[error("XA error {} ({code}): {message}", code_name(*code))]
pub struct XaError {
    pub code: i32,
    pub message: String,
    #[source]
    pub source: Option<crate::error::BoxError>,
}

impl XaError {
    /// Creates an XA error without an underlying cause.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Creates an XA error carrying its cause.
    pub fn caused(
        code: i32,
        message: impl Into<String>,
        source: impl Into<crate::error::BoxError>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Returns true if the code reports a rollback.
    pub fn is_rollback(&self) -> bool {
        (XA_RBROLLBACK..=XA_RBROLLBACK + 7).contains(&self.code)
    }
}

// ============================================================================
// Transaction identifier
// ============================================================================

/// XA transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    global_transaction_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    /// Maximum length for the global transaction id.
    pub const MAXGTRIDSIZE: usize = 64;
    /// Maximum length for the branch qualifier.
    pub const MAXBQUALSIZE: usize = 64;

    /// Creates a branch identifier.
    ///
    /// Returns an `XAER_INVAL` error when either part exceeds its maximum size.
    pub fn new(
        format_id: i32,
        global_transaction_id: &[u8],
        branch_qualifier: &[u8],
    ) -> Result<Self, XaError> {
        if global_transaction_id.len() > Self::MAXGTRIDSIZE {
            return Err(XaError::new(
                XAER_INVAL,
                format!(
                    "global transaction id exceeds {} bytes",
                    Self::MAXGTRIDSIZE
                ),
            ));
        }
        if branch_qualifier.len() > Self::MAXBQUALSIZE {
            return Err(XaError::new(
                XAER_INVAL,
                format!("branch qualifier exceeds {} bytes", Self::MAXBQUALSIZE),
            ));
        }
        Ok(Self {
            format_id,
            global_transaction_id: global_transaction_id.to_vec(),
            branch_qualifier: branch_qualifier.to_vec(),
        })
    }

    /// Generates a fresh random identifier.
    pub fn generate() -> Self {
        let uuid = Uuid::new_v4();
        Self {
            format_id: 0,
            global_transaction_id: uuid.as_bytes().to_vec(),
            branch_qualifier: vec![0u8; 8],
        }
    }

    /// Returns a new branch of the same global transaction.
    pub fn branch(&self, qualifier: &[u8]) -> Result<Self, XaError> {
        Self::new(self.format_id, &self.global_transaction_id, qualifier)
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_transaction_id(&self) -> &[u8] {
        &self.global_transaction_id
    }

    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.format_id)?;
        for b in &self.global_transaction_id {
            write!(f, "{:02x}", b)?;
        }
        f.write_str(":")?;
        for b in &self.branch_qualifier {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xid_size_limits() {
        assert!(Xid::new(0, &[1u8; 64], &[2u8; 64]).is_ok());
        let err = Xid::new(0, &[1u8; 65], b"b").unwrap_err();
        assert_eq!(err.code, XAER_INVAL);
        assert!(Xid::new(0, b"g", &[0u8; 65]).is_err());
    }

    #[test]
    fn test_generated_xids_are_distinct() {
        let a = Xid::generate();
        let b = Xid::generate();
        assert_ne!(a, b);
        assert_eq!(a.global_transaction_id().len(), 16);
    }

    #[test]
    fn test_branch_shares_global_id() {
        let xid = Xid::generate();
        let branch = xid.branch(b"rm-2").unwrap();
        assert_eq!(branch.global_transaction_id(), xid.global_transaction_id());
        assert_ne!(branch, xid);
    }

    #[test]
    fn test_display_is_hex() {
        let xid = Xid::new(7, &[0xab, 0x01], &[0xff]).unwrap();
        assert_eq!(xid.to_string(), "7:ab01:ff");
    }

    #[test]
    fn test_error_display_names_code() {
        let err = XaError::new(XAER_DUPID, "branch exists");
        assert_eq!(err.to_string(), "XA error XAER_DUPID (-8): branch exists");
        assert!(!err.is_rollback());
        assert!(XaError::new(XA_RBROLLBACK, "rb").is_rollback());
    }
}
