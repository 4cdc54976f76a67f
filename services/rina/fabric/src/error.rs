//! Fabric error types.

use std::io;
use thiserror::Error;

/// Errors returned by the blocking fabric primitives
#[derive(Error, Debug)]
pub enum FabricError {
    /// Control handle could not be opened
    #[error("failed to open control handle: {0}")]
    Open(#[source] io::Error),

    /// Application registration failed
    #[error("failed to register application {app}: {source}")]
    Register {
        /// Application name
        app: String,
        /// Underlying reason
        #[source]
        source: io::Error,
    },

    /// Blocking flow accept failed
    #[error("failed to accept flow: {0}")]
    Accept(#[source] io::Error),

    /// Flow allocation towards a remote application failed
    #[error("failed to allocate flow to application {remote}: {source}")]
    Alloc {
        /// Remote application name
        remote: String,
        /// Underlying reason
        #[source]
        source: io::Error,
    },

    /// The control handle was closed (expected during shutdown)
    #[error("control handle {0} closed")]
    Closed(u64),
}

impl FabricError {
    /// Whether the error only reports that the control handle was closed
    pub fn is_closed(&self) -> bool {
        matches!(self, FabricError::Closed(_))
    }

    /// I/O error kind of the underlying reason
    pub fn kind(&self) -> io::ErrorKind {
        match self {
            FabricError::Open(e) | FabricError::Accept(e) => e.kind(),
            FabricError::Register { source, .. } | FabricError::Alloc { source, .. } => {
                source.kind()
            }
            FabricError::Closed(_) => io::ErrorKind::NotConnected,
        }
    }

    /// Wrap the fabric reason as an I/O error, keeping this error as source
    pub fn into_io(self) -> io::Error {
        io::Error::new(self.kind(), self)
    }
}
