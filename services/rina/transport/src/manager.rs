//! Transport manager contract and the stock registry.
//!
//! Transports and listeners never talk to the SIP layer directly. They
//! report to a [`TransportManager`]: factories and transports register with
//! it, received bytes are handed to it for parsing, and lifecycle changes
//! are reported to it. [`TransportRegistry`] is the manager used by the
//! service; it frames SIP messages and forwards them over channels.

use crate::connection::{SendOutcome, Transport, TransportState};
use crate::{ManagerError, Result, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rina_fabric::{AppAddr, HostPort};
use rina_wire::{FrameDecoder, WireError};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Bytes received on a transport, valid for one receive cycle
#[derive(Debug)]
pub struct RxData<'a> {
    /// Transport the bytes arrived on
    pub transport: &'a Transport,
    /// Everything buffered and not yet consumed
    pub packet: &'a [u8],
    /// When the read completed
    pub received_at: Instant,
}

/// Lifecycle notification sent to the manager
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport is connected and reading
    Connected,
    /// The transport failed and is shutting down
    Disconnected {
        /// First error seen on the transport
        reason: TransportError,
    },
}

/// Produces transports of one type (a listener)
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Transport type served by this factory
    fn type_name(&self) -> &str;

    /// Factory object name
    fn name(&self) -> &str;

    /// Local address transports are created from
    fn local_addr(&self) -> &AppAddr;

    /// Host-port name advertised for this factory
    fn local_name(&self) -> HostPort {
        self.local_addr().host_port()
    }

    /// Start a transport towards `remote` without waiting for it to
    /// connect; sends on it are delayed until it does
    fn begin_transport(&self, remote: &AppAddr) -> Result<Transport>;

    /// Create a connected transport towards `remote`
    async fn create_transport(&self, remote: &AppAddr) -> Result<Transport> {
        let transport = self.begin_transport(remote)?;
        transport.wait_connected().await?;
        Ok(transport)
    }
}

/// Host-side registry of factories and live transports
pub trait TransportManager: Send + Sync {
    /// Register a factory; fails with [`ManagerError::AlreadyRegistered`]
    /// when its transport type is taken
    fn register_factory(
        &self,
        factory: Arc<dyn TransportFactory>,
    ) -> std::result::Result<(), ManagerError>;

    /// Remove a factory previously registered
    fn unregister_factory(&self, factory: &dyn TransportFactory);

    /// Start tracking a transport that is about to connect
    fn register_transport(&self, transport: &Transport) -> std::result::Result<(), ManagerError>;

    /// Stop tracking a transport; may call [`Transport::destroy`]
    fn unregister_transport(&self, transport: &Transport);

    /// Parse buffered bytes; returns how many were consumed
    fn receive_packet(&self, rdata: &RxData<'_>) -> std::result::Result<usize, WireError>;

    /// Lifecycle notification
    fn on_state(&self, transport: &Transport, event: &TransportEvent);
}

/// A complete SIP message received from a peer
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Receiving transport id
    pub transport_id: u64,
    /// Remote application
    pub remote: AppAddr,
    /// Raw message bytes
    pub payload: Bytes,
    /// When the bytes were read
    pub received_at: Instant,
}

/// Lifecycle events published by the registry
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A transport connected
    Connected {
        /// Transport id
        transport_id: u64,
        /// Transport object name
        name: String,
        /// Remote application
        remote: AppAddr,
    },
    /// A transport failed
    Disconnected {
        /// Transport id
        transport_id: u64,
        /// Transport object name
        name: String,
        /// Remote application
        remote: AppAddr,
        /// First error seen on the transport
        reason: TransportError,
    },
}

/// Receiving ends of the registry channels
#[derive(Debug)]
pub struct RegistryHandle {
    /// Parsed inbound messages
    pub messages: mpsc::UnboundedReceiver<InboundMessage>,
    /// Lifecycle events
    pub events: mpsc::UnboundedReceiver<RegistryEvent>,
}

struct FactoryEntry {
    name: String,
    factory: Weak<dyn TransportFactory>,
}

/// Transport manager tracking factories and transports in memory
pub struct TransportRegistry {
    decoder: FrameDecoder,
    factories: DashMap<String, FactoryEntry>,
    transports: DashMap<u64, Transport>,
    /// Outbound transports not yet registered, by remote
    connecting: DashMap<AppAddr, Transport>,
    message_tx: mpsc::UnboundedSender<InboundMessage>,
    event_tx: mpsc::UnboundedSender<RegistryEvent>,
}

impl TransportRegistry {
    /// Create a registry and the receivers for its messages and events
    pub fn new() -> (Arc<Self>, RegistryHandle) {
        let (message_tx, messages) = mpsc::unbounded_channel();
        let (event_tx, events) = mpsc::unbounded_channel();

        let registry = Arc::new(Self {
            decoder: FrameDecoder::new(),
            factories: DashMap::new(),
            transports: DashMap::new(),
            connecting: DashMap::new(),
            message_tx,
            event_tx,
        });
        (registry, RegistryHandle { messages, events })
    }

    /// Number of live transports
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    /// Whether a factory serves `type_name`
    pub fn has_factory(&self, type_name: &str) -> bool {
        self.factory(type_name).is_some()
    }

    /// Snapshot of live transports
    pub fn transports(&self) -> Vec<Transport> {
        self.transports.iter().map(|e| e.value().clone()).collect()
    }

    /// A usable transport to `remote`: a connected one first, otherwise
    /// one still connecting
    pub fn find(&self, remote: &AppAddr) -> Option<Transport> {
        let registered: Vec<Transport> = self
            .transports()
            .into_iter()
            .filter(|t| t.remote_addr() == remote && is_usable(t))
            .collect();
        let connected = registered
            .iter()
            .find(|t| t.state() == TransportState::Connected)
            .or_else(|| registered.first())
            .cloned();
        connected.or_else(|| {
            self.connecting
                .get(remote)
                .map(|entry| entry.value().clone())
                .filter(is_usable)
        })
    }

    /// Reuse a transport to `remote` or have the factory for `type_name`
    /// start one, then wait until it is connected
    pub async fn acquire(&self, type_name: &str, remote: &AppAddr) -> Result<Transport> {
        let transport = self.begin(type_name, remote)?;
        if let Err(e) = transport.wait_connected().await {
            self.forget_connecting(&transport);
            return Err(e);
        }
        Ok(transport)
    }

    /// Send `data` to `remote`. Without a connected transport the send is
    /// queued on a connecting one, started if needed.
    pub fn send_to(&self, type_name: &str, remote: &AppAddr, data: Bytes) -> Result<SendOutcome> {
        let transport = self.begin(type_name, remote)?;
        transport.send(data, None)
    }

    /// Shut down and destroy every transport
    pub fn shutdown_all(&self) {
        let mut transports = self.transports();
        transports.extend(self.connecting.iter().map(|e| e.value().clone()));
        self.connecting.clear();

        if !transports.is_empty() {
            info!("Shutting down {} transport(s)", transports.len());
        }
        for transport in transports {
            transport.shutdown();
            transport.destroy(None);
        }
    }

    fn begin(&self, type_name: &str, remote: &AppAddr) -> Result<Transport> {
        if let Some(transport) = self.find(remote) {
            trace!("Reusing {} for {}", transport.name(), remote);
            return Ok(transport);
        }

        let factory = self
            .factory(type_name)
            .ok_or_else(|| ManagerError::NoFactory(type_name.to_string()))?;

        // One connecting transport per remote, even under concurrent callers
        match self.connecting.entry(*remote) {
            Entry::Occupied(slot) if is_usable(slot.get()) => Ok(slot.get().clone()),
            slot => {
                debug!("Creating {} transport to {} via {}", type_name, remote, factory.name());
                let transport = factory.begin_transport(remote)?;
                slot.insert(transport.clone());
                Ok(transport)
            }
        }
    }

    fn forget_connecting(&self, transport: &Transport) {
        self.connecting
            .remove_if(transport.remote_addr(), |_, t| t.id() == transport.id());
    }

    fn factory(&self, type_name: &str) -> Option<Arc<dyn TransportFactory>> {
        self.factories
            .get(type_name)
            .and_then(|entry| entry.factory.upgrade())
    }
}

impl TransportManager for TransportRegistry {
    fn register_factory(
        &self,
        factory: Arc<dyn TransportFactory>,
    ) -> std::result::Result<(), ManagerError> {
        let type_name = factory.type_name().to_string();
        let entry = FactoryEntry {
            name: factory.name().to_string(),
            factory: Arc::downgrade(&factory),
        };

        match self.factories.entry(type_name.clone()) {
            Entry::Occupied(mut slot) => {
                // A dropped factory no longer owns its type
                if slot.get().factory.strong_count() > 0 {
                    return Err(ManagerError::AlreadyRegistered(type_name));
                }
                slot.insert(entry);
            }
            Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
        info!("Registered {} factory {}", type_name, factory.name());
        Ok(())
    }

    fn unregister_factory(&self, factory: &dyn TransportFactory) {
        let removed = self
            .factories
            .remove_if(factory.type_name(), |_, entry| entry.name == factory.name());
        if removed.is_some() {
            info!("Unregistered {} factory {}", factory.type_name(), factory.name());
        }
    }

    fn register_transport(&self, transport: &Transport) -> std::result::Result<(), ManagerError> {
        self.transports.insert(transport.id(), transport.clone());
        self.forget_connecting(transport);
        debug!(
            "Registered transport {} ({})",
            transport.name(),
            transport.info()
        );
        Ok(())
    }

    fn unregister_transport(&self, transport: &Transport) {
        // The guard must be gone before calling back into the transport
        let removed = self.transports.remove(&transport.id());
        self.forget_connecting(transport);
        if let Some((_, transport)) = removed {
            debug!("Unregistered transport {}", transport.name());
            transport.destroy(None);
        }
    }

    fn receive_packet(&self, rdata: &RxData<'_>) -> std::result::Result<usize, WireError> {
        let scan = self.decoder.scan(rdata.packet)?;

        for range in scan.messages {
            let message = InboundMessage {
                transport_id: rdata.transport.id(),
                remote: *rdata.transport.remote_addr(),
                payload: Bytes::copy_from_slice(&rdata.packet[range]),
                received_at: rdata.received_at,
            };
            if self.message_tx.send(message).is_err() {
                warn!(
                    "{}: inbound message dropped, no receiver",
                    rdata.transport.name()
                );
            }
        }

        Ok(scan.consumed)
    }

    fn on_state(&self, transport: &Transport, event: &TransportEvent) {
        let event = match event {
            TransportEvent::Connected => RegistryEvent::Connected {
                transport_id: transport.id(),
                name: transport.name().to_string(),
                remote: *transport.remote_addr(),
            },
            TransportEvent::Disconnected { reason } => RegistryEvent::Disconnected {
                transport_id: transport.id(),
                name: transport.name().to_string(),
                remote: *transport.remote_addr(),
                reason: reason.clone(),
            },
        };
        // Nobody listening is fine
        let _ = self.event_tx.send(event);
    }
}

fn is_usable(transport: &Transport) -> bool {
    !transport.is_failed()
        && matches!(
            transport.state(),
            TransportState::Connecting | TransportState::Connected
        )
}
