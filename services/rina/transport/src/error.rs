//! Transport and manager error types.

use rina_fabric::FabricError;
use rina_wire::WireError;
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors surfaced by transports and listeners.
///
/// Cloneable so one close reason can complete every pending send.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The transport is not (or no longer) connected
    #[error("transport not connected")]
    NotConnected,

    /// A delayed send expired before the transport connected
    #[error("send timed out before the transport connected")]
    Timeout,

    /// The peer closed the flow
    #[error("flow closed by peer")]
    Closed,

    /// Stream or fabric I/O failure
    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    /// The byte stream no longer parses as SIP
    #[error("invalid message on stream: {0}")]
    InvalidMessage(#[from] WireError),

    /// The transport manager rejected a request
    #[error("transport manager error: {0}")]
    Manager(#[from] ManagerError),

    /// Invalid listener or transport configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Called outside a Tokio runtime
    #[error("no async runtime available: {0}")]
    NoRuntime(String),
}

impl TransportError {
    /// Whether this is the "not connected" rejection of a send
    pub fn is_not_connected(&self) -> bool {
        matches!(self, TransportError::NotConnected)
    }

    /// I/O error kind, if the error came from the stream or the fabric
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            TransportError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

impl From<io::Error> for TransportError {
    fn from(err: io::Error) -> Self {
        TransportError::Io(Arc::new(err))
    }
}

impl From<FabricError> for TransportError {
    fn from(err: FabricError) -> Self {
        TransportError::Io(Arc::new(err.into_io()))
    }
}

/// Errors reported by a transport manager
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManagerError {
    /// A factory for this transport type is already registered
    #[error("factory for transport type {0} already registered")]
    AlreadyRegistered(String),

    /// No factory is registered for this transport type
    #[error("no factory registered for transport type {0}")]
    NoFactory(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fabric_error_becomes_io() {
        let err: TransportError = FabricError::Alloc {
            remote: "sip.B".to_string(),
            source: io::Error::from(io::ErrorKind::ConnectionRefused),
        }
        .into();

        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused));
        assert!(err.to_string().contains("sip.B"));
    }

    #[test]
    fn test_manager_errors_name_the_type() {
        for err in [
            ManagerError::AlreadyRegistered("RINA".to_string()),
            ManagerError::NoFactory("RINA".to_string()),
        ] {
            let type_name = match &err {
                ManagerError::AlreadyRegistered(t) | ManagerError::NoFactory(t) => t.clone(),
            };
            assert!(TransportError::from(err).to_string().contains(&type_name));
        }
    }

    #[test]
    fn test_clone_shares_io_source() {
        let err = TransportError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        let copy = err.clone();
        assert_eq!(copy.io_kind(), Some(io::ErrorKind::BrokenPipe));
        assert_eq!(copy.to_string(), err.to_string());
    }
}
