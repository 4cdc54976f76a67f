//! RINA flow fabric primitives.
//!
//! This crate is the boundary between the SIP transport and the networking
//! fabric. The fabric is modelled as a small set of **blocking** calls:
//!
//! - `open` a control handle for an application
//! - `register` the application name (optionally inside a DIF)
//! - `accept_flow` waits for the next incoming flow on the handle
//! - `alloc_flow` opens a flow towards a remote application
//! - `close` the control handle, waking any blocked accept
//!
//! Flows are full-duplex byte streams exposed as Unix sockets, so they can
//! be driven by any async runtime once allocated.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod addr;
pub mod error;
pub mod mem;

// Re-export main types
pub use addr::{AppAddr, HostPort, APP_ADDR_LEN, DEFAULT_SIP_PORT};
pub use error::FabricError;
pub use mem::MemFabric;

use std::fmt;
use std::os::unix::net::UnixStream;

/// Opaque control handle returned by [`Fabric::open`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlHandle {
    id: u64,
}

impl ControlHandle {
    /// Wrap a fabric-assigned handle id
    pub fn new(id: u64) -> Self {
        Self { id }
    }

    /// Handle id
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for ControlHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cfd{}", self.id)
    }
}

/// An allocated flow: a connected, full-duplex byte stream
#[derive(Debug)]
pub struct Flow {
    port_id: u64,
    stream: UnixStream,
}

impl Flow {
    /// Wrap a connected stream
    pub fn new(port_id: u64, stream: UnixStream) -> Self {
        Self { port_id, stream }
    }

    /// Fabric port id of the flow
    pub fn port_id(&self) -> u64 {
        self.port_id
    }

    /// Take the underlying stream
    pub fn into_std(self) -> UnixStream {
        self.stream
    }
}

/// Blocking fabric primitives.
///
/// Every method may block the calling thread; async callers must use a
/// blocking-capable thread.
pub trait Fabric: Send + Sync + fmt::Debug {
    /// Open a control handle
    fn open(&self) -> Result<ControlHandle, FabricError>;

    /// Register an application name on the handle, in `dif` or any DIF
    fn register(
        &self,
        handle: ControlHandle,
        app: &str,
        dif: Option<&str>,
    ) -> Result<(), FabricError>;

    /// Wait for the next incoming flow; returns it with the remote application name
    fn accept_flow(&self, handle: ControlHandle) -> Result<(Flow, String), FabricError>;

    /// Allocate a flow from `local_app` to `remote_app`
    fn alloc_flow(
        &self,
        dif: Option<&str>,
        local_app: &str,
        remote_app: &str,
    ) -> Result<Flow, FabricError>;

    /// Close the handle; blocked `accept_flow` calls return [`FabricError::Closed`]
    fn close(&self, handle: ControlHandle);
}
