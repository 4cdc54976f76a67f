//! In-process fabric.
//!
//! Applications register on a control handle; allocating a flow towards a
//! registered application creates a connected socket pair, hands one end to
//! the caller and queues the other end for the application's accept loop.
//! Used by the service binary and by the transport test-suite.

use crate::{ControlHandle, Fabric, FabricError, Flow};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::io;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

type RegistrationKey = (Option<String>, String);

/// In-memory fabric backed by Unix socket pairs
#[derive(Debug, Default)]
pub struct MemFabric {
    next_id: AtomicU64,
    handles: DashMap<u64, Arc<Endpoint>>,
    apps: DashMap<RegistrationKey, Arc<Endpoint>>,
}

#[derive(Debug, Default)]
struct Endpoint {
    state: Mutex<EndpointState>,
    ready: Condvar,
}

#[derive(Debug, Default)]
struct EndpointState {
    closed: bool,
    app: Option<RegistrationKey>,
    pending: VecDeque<(Flow, String)>,
}

impl Endpoint {
    fn lock(&self) -> MutexGuard<'_, EndpointState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemFabric {
    /// Create an empty fabric
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an application is registered (in any DIF)
    pub fn is_registered(&self, app: &str) -> bool {
        self.apps.iter().any(|entry| entry.key().1 == app)
    }

    /// Number of open control handles
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn endpoint(&self, handle: ControlHandle) -> Option<Arc<Endpoint>> {
        self.handles.get(&handle.id()).map(|e| Arc::clone(e.value()))
    }

    /// Find the registration serving `app`.
    ///
    /// An exact (DIF, name) match wins; a lookup or registration without a
    /// DIF matches the name in any DIF.
    fn find_app(&self, dif: Option<&str>, app: &str) -> Option<Arc<Endpoint>> {
        let key = (dif.map(str::to_owned), app.to_owned());
        if let Some(endpoint) = self.apps.get(&key) {
            return Some(Arc::clone(endpoint.value()));
        }

        self.apps
            .iter()
            .find(|entry| entry.key().1 == app && (dif.is_none() || entry.key().0.is_none()))
            .map(|entry| Arc::clone(entry.value()))
    }
}

impl Fabric for MemFabric {
    fn open(&self) -> Result<ControlHandle, FabricError> {
        let id = self.next_id();
        self.handles.insert(id, Arc::new(Endpoint::default()));
        trace!("Opened control handle {}", id);
        Ok(ControlHandle::new(id))
    }

    fn register(
        &self,
        handle: ControlHandle,
        app: &str,
        dif: Option<&str>,
    ) -> Result<(), FabricError> {
        let register_err = |kind: io::ErrorKind, msg: &str| FabricError::Register {
            app: app.to_string(),
            source: io::Error::new(kind, msg.to_string()),
        };

        let endpoint = self
            .endpoint(handle)
            .ok_or_else(|| register_err(io::ErrorKind::NotFound, "unknown control handle"))?;

        let key = (dif.map(str::to_owned), app.to_owned());
        let mut state = endpoint.lock();
        if state.closed {
            return Err(register_err(io::ErrorKind::NotConnected, "control handle closed"));
        }

        match self.apps.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                if !Arc::ptr_eq(existing.get(), &endpoint) {
                    return Err(register_err(
                        io::ErrorKind::AddrInUse,
                        "application already registered",
                    ));
                }
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&endpoint));
            }
        }
        state.app = Some(key);

        debug!("Registered application {} (dif: {:?})", app, dif);
        Ok(())
    }

    fn accept_flow(&self, handle: ControlHandle) -> Result<(Flow, String), FabricError> {
        let endpoint = self
            .endpoint(handle)
            .ok_or(FabricError::Closed(handle.id()))?;

        let mut state = endpoint.lock();
        loop {
            if state.closed {
                return Err(FabricError::Closed(handle.id()));
            }
            if let Some(accepted) = state.pending.pop_front() {
                return Ok(accepted);
            }
            if state.app.is_none() {
                return Err(FabricError::Accept(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no application registered on control handle",
                )));
            }
            state = endpoint
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn alloc_flow(
        &self,
        dif: Option<&str>,
        local_app: &str,
        remote_app: &str,
    ) -> Result<Flow, FabricError> {
        let alloc_err = |source: io::Error| FabricError::Alloc {
            remote: remote_app.to_string(),
            source,
        };
        let refused = || {
            alloc_err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "no application registered under that name",
            ))
        };

        let endpoint = self.find_app(dif, remote_app).ok_or_else(refused)?;
        let (local, remote) = UnixStream::pair().map_err(alloc_err)?;

        {
            let mut state = endpoint.lock();
            if state.closed {
                return Err(refused());
            }
            state
                .pending
                .push_back((Flow::new(self.next_id(), remote), local_app.to_string()));
        }
        endpoint.ready.notify_one();

        let flow = Flow::new(self.next_id(), local);
        debug!(
            "Allocated flow {} from {} to {}",
            flow.port_id(),
            local_app,
            remote_app
        );
        Ok(flow)
    }

    fn close(&self, handle: ControlHandle) {
        let Some((_, endpoint)) = self.handles.remove(&handle.id()) else {
            return;
        };

        {
            let mut state = endpoint.lock();
            state.closed = true;
            state.pending.clear();
            if let Some(key) = state.app.take() {
                self.apps
                    .remove_if(&key, |_, registered| Arc::ptr_eq(registered, &endpoint));
            }
        }
        endpoint.ready.notify_all();
        trace!("Closed control handle {}", handle.id());
    }
}
