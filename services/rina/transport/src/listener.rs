//! Listener: registers a local application and produces transports.
//!
//! The fabric's accept primitive blocks, so every listener owns one OS
//! thread running the accept loop. Outbound flow allocation blocks too and
//! runs on the runtime's blocking pool; both directions then go through the
//! same `on_connected` transition on the new transport.

use crate::config::ListenerConfig;
use crate::connection::{Direction, Transport};
use crate::manager::{TransportFactory, TransportManager};
use crate::{ManagerError, Result, TransportError};
use rina_fabric::{AppAddr, ControlHandle, Fabric, Flow, HostPort};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Transport type registered with the manager
pub const TRANSPORT_TYPE: &str = "RINA";

/// Pause before retrying after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A started listener. Stopped on drop.
pub struct Listener {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    name: String,
    config: ListenerConfig,
    local: AppAddr,
    fabric: Arc<dyn Fabric>,
    manager: Arc<dyn TransportManager>,
    runtime: Handle,
    handle: ControlHandle,
    running: AtomicBool,
    state: Mutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    /// This listener owns the factory registration
    registered: bool,
    stopped: bool,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl Listener {
    /// Register `config.local_app` with the fabric and the manager and
    /// start accepting flows. Must be called from within a Tokio runtime.
    pub fn start(
        config: ListenerConfig,
        fabric: Arc<dyn Fabric>,
        manager: Arc<dyn TransportManager>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime =
            Handle::try_current().map_err(|e| TransportError::NoRuntime(e.to_string()))?;

        let handle = fabric.open()?;
        if let Err(e) = fabric.register(handle, &config.local_app, config.dif.as_deref()) {
            error!("Failed to register application {}: {}", config.local_app, e);
            fabric.close(handle);
            return Err(e.into());
        }

        let local = AppAddr::from_name(&config.local_app);
        let inner = Arc::new(ListenerInner {
            name: format!("rinalis:{}", config.local_app),
            config,
            local,
            fabric,
            manager,
            runtime,
            handle,
            running: AtomicBool::new(true),
            state: Mutex::new(ListenerState::default()),
        });

        let factory: Arc<dyn TransportFactory> = inner.clone();
        let registered = match inner.manager.register_factory(factory) {
            Ok(()) => true,
            Err(ManagerError::AlreadyRegistered(type_name)) => {
                debug!(
                    "{}: {} factory already registered, sharing it",
                    inner.name, type_name
                );
                false
            }
            Err(e) => {
                inner.running.store(false, Ordering::SeqCst);
                inner.fabric.close(inner.handle);
                return Err(e.into());
            }
        };
        inner.lock().registered = registered;

        let listener = Listener { inner };
        let accept_inner = Arc::clone(&listener.inner);
        let spawned = thread::Builder::new()
            .name(format!("{}-accept", listener.inner.name))
            .spawn(move || accept_inner.accept_loop());

        match spawned {
            Ok(thread) => listener.inner.lock().accept_thread = Some(thread),
            Err(e) => {
                error!("{}: failed to spawn accept thread: {}", listener.name(), e);
                listener.stop();
                return Err(e.into());
            }
        }

        info!(
            "{}: listening as {} (dif: {})",
            listener.name(),
            listener.local_name(),
            listener.inner.config.dif.as_deref().unwrap_or("any")
        );
        Ok(listener)
    }

    /// Listener object name (`rinalis:<app>`)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Local application address
    pub fn local_addr(&self) -> &AppAddr {
        &self.inner.local
    }

    /// Host-port name advertised to the manager
    pub fn local_name(&self) -> HostPort {
        self.inner.local.host_port()
    }

    /// Settings the listener was started with
    pub fn config(&self) -> &ListenerConfig {
        &self.inner.config
    }

    /// Whether the accept loop is (still) supposed to run
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Whether this listener owns the factory registration
    pub fn is_factory_registered(&self) -> bool {
        self.inner.lock().registered
    }

    /// Create an outbound transport to `remote_app` without waiting.
    ///
    /// The transport starts in `Connecting`; sends are queued until the flow
    /// is allocated. `dif` overrides the listener's DIF.
    pub fn begin_outbound(&self, remote_app: &str, dif: Option<&str>) -> Result<Transport> {
        self.inner.begin_outbound(remote_app, dif)
    }

    /// Create an outbound transport to `remote_app` and wait until it is
    /// connected. Allocation failures come back as I/O errors.
    pub async fn create_outbound(&self, remote_app: &str, dif: Option<&str>) -> Result<Transport> {
        self.inner.create_outbound(remote_app, dif).await
    }

    /// Stop accepting, unregister the factory and close the control handle.
    /// Idempotent; blocks until the accept thread has exited.
    pub fn stop(&self) {
        self.inner.stop();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.inner.stop();
    }
}

impl ListenerInner {
    fn lock(&self) -> MutexGuard<'_, ListenerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accept_loop(self: Arc<Self>) {
        // Flows are adopted by the runtime's reactor from this thread
        let _runtime = self.runtime.enter();
        debug!("{}: accept loop started", self.name);

        while self.running.load(Ordering::SeqCst) {
            match self.fabric.accept_flow(self.handle) {
                Ok((flow, remote_app)) => self.on_accept(flow, &remote_app),
                Err(e) if e.is_closed() || !self.running.load(Ordering::SeqCst) => break,
                Err(e) => {
                    warn!("{}: accept failed: {}", self.name, e);
                    thread::sleep(ACCEPT_RETRY_DELAY);
                }
            }
        }

        debug!("{}: accept loop exited", self.name);
    }

    fn on_accept(&self, flow: Flow, remote_app: &str) {
        let transport = Transport::new(
            Direction::Inbound,
            self.local,
            AppAddr::from_name(remote_app),
            self.config.transport.clone(),
            Arc::clone(&self.manager),
            self.runtime.clone(),
        );
        debug!(
            "{}: accepted flow {} from {} as {}",
            self.name,
            flow.port_id(),
            remote_app,
            transport.name()
        );

        if let Err(e) = transport.on_connected(flow) {
            warn!("{}: failed to set up {}: {}", self.name, transport.name(), e);
        }
    }

    fn begin_outbound(&self, remote_app: &str, dif: Option<&str>) -> Result<Transport> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let transport = Transport::new(
            Direction::Outbound,
            self.local,
            AppAddr::from_name(remote_app),
            self.config.transport.clone(),
            Arc::clone(&self.manager),
            self.runtime.clone(),
        );
        debug!(
            "{}: allocating flow to {} for {}",
            self.name,
            remote_app,
            transport.name()
        );

        let fabric = Arc::clone(&self.fabric);
        let dif = dif.or(self.config.dif.as_deref()).map(str::to_owned);
        let local_app = self.config.local_app.clone();
        let remote_app = remote_app.to_owned();
        let pending = transport.clone();

        self.runtime.spawn(async move {
            let allocated = tokio::task::spawn_blocking(move || {
                fabric.alloc_flow(dif.as_deref(), &local_app, &remote_app)
            })
            .await;

            match allocated {
                Ok(Ok(flow)) => {
                    // Failures are logged and recorded on the transport
                    let _ = pending.on_connected(flow);
                }
                Ok(Err(e)) => pending.on_connect_failed(e.into()),
                Err(e) => pending.on_connect_failed(
                    io::Error::new(io::ErrorKind::Other, format!("flow allocation aborted: {}", e))
                        .into(),
                ),
            }
        });

        Ok(transport)
    }

    async fn create_outbound(&self, remote_app: &str, dif: Option<&str>) -> Result<Transport> {
        let transport = self.begin_outbound(remote_app, dif)?;
        transport.wait_connected().await?;
        Ok(transport)
    }

    fn stop(&self) {
        let (registered, accept_thread) = {
            let mut state = self.lock();
            if state.stopped {
                return;
            }
            state.stopped = true;
            let registered = std::mem::take(&mut state.registered);
            (registered, state.accept_thread.take())
        };

        self.running.store(false, Ordering::SeqCst);
        if registered {
            self.manager.unregister_factory(self);
        }
        // Wakes the accept thread out of its blocking call
        self.fabric.close(self.handle);

        if let Some(accept_thread) = accept_thread {
            if accept_thread.thread().id() == thread::current().id() {
                debug!("{}: stopped from the accept thread, not joining", self.name);
            } else if accept_thread.join().is_err() {
                error!("{}: accept thread panicked", self.name);
            }
        }

        info!("{}: stopped", self.name);
    }
}

impl TransportFactory for ListenerInner {
    fn type_name(&self) -> &str {
        TRANSPORT_TYPE
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn local_addr(&self) -> &AppAddr {
        &self.local
    }

    fn begin_transport(&self, remote: &AppAddr) -> Result<Transport> {
        self.begin_outbound(remote.name(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::connection::TransportState;
    use crate::manager::TransportRegistry;
    use rina_fabric::MemFabric;

    fn config(app: &str) -> ListenerConfig {
        ListenerConfig::new(app).with_transport(TransportConfig {
            keepalive_interval: Duration::ZERO,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let fabric = Arc::new(MemFabric::new());
        let (registry, _handle) = TransportRegistry::new();

        let listener = Listener::start(config("sip.A"), fabric.clone(), registry.clone()).unwrap();
        assert_eq!(listener.name(), "rinalis:sip.A");
        assert_eq!(listener.local_name().to_string(), "sip.A:5060");
        assert!(listener.is_running());
        assert!(listener.is_factory_registered());
        assert!(fabric.is_registered("sip.A"));
        assert!(registry.has_factory(TRANSPORT_TYPE));

        listener.stop();
        assert!(!listener.is_running());
        assert!(!fabric.is_registered("sip.A"));
        assert!(!registry.has_factory(TRANSPORT_TYPE));
        assert_eq!(fabric.open_handles(), 0);

        // Second stop and drop are no-ops
        listener.stop();
        drop(listener);
    }

    #[tokio::test]
    async fn test_registration_failure_is_returned_and_cleaned_up() {
        let fabric = Arc::new(MemFabric::new());
        let (registry, _handle) = TransportRegistry::new();

        let first = Listener::start(config("sip.A"), fabric.clone(), registry.clone()).unwrap();
        let err = Listener::start(config("sip.A"), fabric.clone(), registry.clone())
            .err()
            .unwrap();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::AddrInUse));
        assert_eq!(fabric.open_handles(), 1);

        drop(first);
        assert_eq!(fabric.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_second_listener_shares_factory_type() {
        let fabric = Arc::new(MemFabric::new());
        let (registry, _handle) = TransportRegistry::new();

        let a = Listener::start(config("sip.A"), fabric.clone(), registry.clone()).unwrap();
        let c = Listener::start(config("sip.C"), fabric.clone(), registry.clone()).unwrap();
        assert!(a.is_factory_registered());
        assert!(!c.is_factory_registered());

        // Stopping the non-owner leaves the registration alone
        c.stop();
        assert!(registry.has_factory(TRANSPORT_TYPE));
        a.stop();
        assert!(!registry.has_factory(TRANSPORT_TYPE));
    }

    #[tokio::test]
    async fn test_outbound_to_unknown_app_fails() {
        let fabric = Arc::new(MemFabric::new());
        let (registry, _handle) = TransportRegistry::new();
        let listener = Listener::start(config("sip.A"), fabric, registry.clone()).unwrap();

        let pending = listener.begin_outbound("nobody", None).unwrap();
        let err = listener.create_outbound("nobody", None).await.unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused));

        let factory: Arc<dyn TransportFactory> = listener.inner.clone();
        let err = factory
            .create_transport(&AppAddr::from_name("nobody"))
            .await
            .unwrap_err();
        assert_eq!(err.io_kind(), Some(io::ErrorKind::ConnectionRefused));

        let mut state_rx = pending.subscribe();
        state_rx
            .wait_for(|s| *s == TransportState::Destroyed)
            .await
            .unwrap();
        assert!(pending.is_failed());
        assert_eq!(registry.transport_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_config_and_stopped_listener() {
        let fabric = Arc::new(MemFabric::new());
        let (registry, _handle) = TransportRegistry::new();

        let err = Listener::start(ListenerConfig::new(""), fabric.clone(), registry.clone())
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Config(_)));
        assert_eq!(fabric.open_handles(), 0);

        let listener = Listener::start(config("sip.A"), fabric, registry).unwrap();
        listener.stop();
        assert!(listener
            .begin_outbound("sip.B", None)
            .unwrap_err()
            .is_not_connected());
    }
}
