//! Error types for the Conduit connection and broker cores.
//!
//! Every failure that leaves a public operation is a [`ConduitError`]. Errors
//! raised by drivers, transaction coordinators or the broker transport are
//! never passed through raw: they are wrapped into one of the variants below
//! with the original error kept as the `source`, so the full cause chain is
//! available to whoever logs it.

use std::time::Duration;
use thiserror::Error;

use crate::xa::XaError;

/// Boxed error used for causes coming from external collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type alias using ConduitError as the error type.
pub type Result<T> = std::result::Result<T, ConduitError>;

/// Top-level error type for all Conduit operations.
#[derive(Debug, Error)]
pub enum ConduitError {
    /// No connection could be handed out before the blocking timeout expired
    #[error("No managed connection available in pool '{pool}' after {waited:?} (max size {max_size})")]
    ResourceUnavailable {
        pool: String,
        waited: Duration,
        max_size: usize,
    },

    /// Creating a physical connection failed
    #[error("Could not create connection: {message}")]
    Creation {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Enlisting or delisting a connection in a transaction failed
    #[error("Transaction enlistment failed: {message}")]
    Enlistment {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Re-associating connections on context entry failed
    #[error("Could not reconnect connections for context: {message}")]
    Reconnect {
        message: String,
        #[source]
        source: Option<Box<ConduitError>>,
    },

    /// Generic wrapped resource failure
    #[error("Resource error: {message}")]
    Resource {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// XA protocol errors
    #[error(transparent)]
    Xa(#[from] XaError),

    /// Broker transport errors
    #[error("Broker error: {message}")]
    Broker {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// An anonymous transaction branch was never claimed by a transaction manager
    #[error("Message delivery was not controlled by a transaction manager (branch {branch} rolled back)")]
    UnclaimedTransaction { branch: String },

    /// A connection was requested through a factory this manager does not own
    #[error("Wrong connection factory: expected '{expected}', got '{actual}'")]
    WrongFactory { expected: String, actual: String },

    /// An operation was called in a state that does not allow it
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The component has been shut down
    #[error("'{0}' has been shut down")]
    Shutdown(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ConduitError {
    /// Wraps an external failure into a resource error.
    pub fn resource(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Resource {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates a connection creation error carrying its cause.
    pub fn creation(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Creation {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates an enlistment error carrying its cause.
    pub fn enlistment_caused(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Enlistment {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates a reconnect error wrapping the failure of one manager.
    pub fn reconnect(message: impl Into<String>, source: ConduitError) -> Self {
        Self::Reconnect {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a broker transport error carrying its cause.
    pub fn broker(message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self::Broker {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Creates an illegal state error.
    pub fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Returns true if this error reports pool exhaustion.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, ConduitError::ResourceUnavailable { .. })
    }

    /// Returns the XA error code if this error is an XA error.
    pub fn xa_code(&self) -> Option<i32> {
        match self {
            ConduitError::Xa(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Errors related to configuration.
///
/// These errors occur when loading, parsing, or validating configuration files.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to load configuration
    #[error("Failed to load configuration from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// Invalid configuration format
    #[error("Invalid configuration format: {reason}")]
    InvalidFormat { reason: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    /// Duplicate resource name
    #[error("Duplicate resource name: {name}")]
    DuplicateResourceName { name: String },
}

impl ConfigError {
    /// Creates an invalid value error.
    pub fn invalid_value(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Extension trait for wrapping foreign errors into a [`ConduitError::Resource`].
pub trait ResultExt<T> {
    /// Wraps the error as a resource error with the given context.
    fn resource_context(self, context: &str) -> Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: Into<BoxError>,
{
    fn resource_context(self, context: &str) -> Result<T> {
        self.map_err(|e| ConduitError::resource(context, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xa::{XaError, XAER_PROTO};
    use std::error::Error as _;
    use std::io;

    #[test]
    fn test_unavailable_display() {
        let err = ConduitError::ResourceUnavailable {
            pool: "jdbc/orders".to_string(),
            waited: Duration::from_millis(100),
            max_size: 2,
        };
        let display = err.to_string();
        assert!(display.contains("jdbc/orders"));
        assert!(display.contains("max size 2"));
        assert!(err.is_unavailable());
    }

    #[test]
    fn test_resource_keeps_cause_chain() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused");
        let err = ConduitError::resource("could not open socket", io_err);
        let source = err.source().expect("cause should be preserved");
        assert!(source.to_string().contains("connection refused"));
    }

    #[test]
    fn test_reconnect_nests_conduit_error() {
        let inner = ConduitError::illegal_state("already associated");
        let err = ConduitError::reconnect("jdbc/orders", inner);
        let source = err.source().unwrap();
        assert!(source.to_string().contains("already associated"));
    }

    #[test]
    fn test_xa_code_passthrough() {
        let err: ConduitError = XaError::new(XAER_PROTO, "bad flags").into();
        assert_eq!(err.xa_code(), Some(XAER_PROTO));
        assert!(ConduitError::Shutdown("pool".into()).xa_code().is_none());
    }

    #[test]
    fn test_result_ext_wraps() {
        let res: std::result::Result<(), io::Error> =
            Err(io::Error::new(io::ErrorKind::Other, "boom"));
        let err = res.resource_context("cleanup").unwrap_err();
        assert!(matches!(err, ConduitError::Resource { .. }));
        assert_eq!(err.to_string(), "Resource error: cleanup");
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConduitError>();
    }
}
