//! SIP transports over RINA flows.
//!
//! This crate plugs flow-oriented RINA networking into a SIP transport
//! manager. It provides:
//!
//! - **Listener**: registers a local application with the fabric, accepts
//!   flows on a dedicated thread and creates outbound transports on demand
//! - **Transport**: one connection over one flow, with a reader task, a
//!   writer task and an explicit `Connecting -> Connected -> Closing ->
//!   Destroyed` lifecycle
//! - **Delayed sends**: sends issued while connecting are queued with a
//!   deadline and flushed in order once connected
//! - **Keep-alive**: CRLF heartbeats on idle flows, postponed by activity
//! - **Manager contract**: the [`TransportManager`] trait plus a ready-made
//!   [`TransportRegistry`] that frames SIP messages onto channels
//!
//! ## Example
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use rina_fabric::MemFabric;
//! use rina_transport::{Listener, ListenerConfig, TransportRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> rina_transport::Result<()> {
//! let fabric = Arc::new(MemFabric::new());
//! let (registry, mut handle) = TransportRegistry::new();
//!
//! let a = Listener::start(ListenerConfig::new("sip.A"), fabric.clone(), registry.clone())?;
//! let _b = Listener::start(ListenerConfig::new("sip.B"), fabric.clone(), registry.clone())?;
//!
//! let transport = a.create_outbound("sip.B", None).await?;
//! transport.send(
//!     Bytes::from_static(b"OPTIONS sip:sip.B SIP/2.0\r\nContent-Length: 0\r\n\r\n"),
//!     None,
//! )?;
//!
//! while let Some(message) = handle.messages.recv().await {
//!     println!("{} byte(s) from {}", message.payload.len(), message.remote);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod delayed;
pub mod error;
pub mod keepalive;
pub mod listener;
pub mod manager;
pub mod stream;

// Re-export main types
pub use config::{
    ListenerConfig, TransportConfig, DEFAULT_DELAYED_SEND_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL,
};
pub use connection::{
    Direction, SendOutcome, Transport, TransportRef, TransportState, WeakTransport,
};
pub use delayed::{DelayedQueue, DelayedSend, SendCallback};
pub use error::{ManagerError, Result, TransportError};
pub use keepalive::{next_action, KeepAliveAction};
pub use listener::{Listener, TRANSPORT_TYPE};
pub use manager::{
    InboundMessage, RegistryEvent, RegistryHandle, RxData, TransportEvent, TransportFactory,
    TransportManager, TransportRegistry,
};
pub use stream::FlowStream;
