//! One transport over one flow.
//!
//! A transport is created in `Connecting`, becomes `Connected` once its flow
//! is usable, moves to `Closing` on the first error or an explicit shutdown,
//! and is `Destroyed` once the manager has let go of it and no callback
//! still holds a reference.
//!
//! ```text
//! Connecting --on_connected--> Connected --error/shutdown--> Closing
//!     |                                                          |
//!     +--on_connect_failed--> Destroyed <--unregistered, refs 0--+
//! ```
//!
//! Each connected transport runs a reader task (owning the receive buffer)
//! and a writer task fed through an unbounded channel, so sends never block
//! the caller and hit the wire in submission order.

use crate::config::TransportConfig;
use crate::delayed::{fail_all, DelayedQueue, DelayedSend, SendCallback};
use crate::keepalive;
use crate::manager::{RxData, TransportEvent, TransportManager};
use crate::stream::FlowStream;
use crate::{Result, TransportError};
use bytes::Bytes;
use rina_fabric::{AppAddr, Flow, HostPort};
use rina_wire::RxBuffer;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

static NEXT_TRANSPORT_ID: AtomicU64 = AtomicU64::new(1);

/// Which side created the flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Accepted by a listener (server mode)
    Inbound,
    /// Allocated towards a remote application (client mode)
    Outbound,
}

/// Transport lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// Waiting for the flow
    Connecting,
    /// Reading and writing
    Connected,
    /// Shut down; in-flight operations finish, nothing new starts
    Closing,
    /// Resources released (terminal)
    Destroyed,
}

/// How a successful [`Transport::send`] was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Held in the delayed-send queue until the transport connects
    Queued,
    /// Handed to the writer; the callback reports completion
    Submitted,
}

struct WriteOp {
    data: Bytes,
    on_sent: Option<SendCallback>,
}

impl WriteOp {
    fn complete(self, result: Result<usize>) {
        if let Some(on_sent) = self.on_sent {
            on_sent(result);
        }
    }
}

impl From<DelayedSend> for WriteOp {
    fn from(entry: DelayedSend) -> Self {
        Self {
            data: entry.data,
            on_sent: entry.on_sent,
        }
    }
}

struct Shared {
    state: TransportState,
    delayed: DelayedQueue,
    close_reason: Option<TransportError>,
    writer: Option<mpsc::UnboundedSender<WriteOp>>,
    reader_task: Option<JoinHandle<()>>,
    keepalive_task: Option<JoinHandle<()>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: TransportState::Connecting,
            delayed: DelayedQueue::new(),
            close_reason: None,
            writer: None,
            reader_task: None,
            keepalive_task: None,
        }
    }
}

struct Inner {
    id: u64,
    name: String,
    direction: Direction,
    local: AppAddr,
    remote: AppAddr,
    config: TransportConfig,
    manager: Arc<dyn TransportManager>,
    runtime: Handle,
    shared: Mutex<Shared>,
    last_activity: Mutex<Instant>,
    state_tx: watch::Sender<TransportState>,
    /// Set while the manager holds the transport
    registered: AtomicBool,
    /// First error wins
    shutdown_started: AtomicBool,
    destroy_requested: AtomicBool,
    released: AtomicBool,
    failed: AtomicBool,
    refs: AtomicUsize,
}

/// Handle to a transport; clones share the same connection
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

/// Non-owning transport handle
#[derive(Clone)]
pub struct WeakTransport {
    inner: Weak<Inner>,
}

impl WeakTransport {
    /// Upgrade to a full handle if the transport still exists
    pub fn upgrade(&self) -> Option<Transport> {
        self.inner.upgrade().map(|inner| Transport { inner })
    }
}

/// Counted reference keeping the transport from being released.
///
/// Held by any code path that must finish before teardown runs.
pub struct TransportRef {
    transport: Transport,
}

impl Drop for TransportRef {
    fn drop(&mut self) {
        let inner = &self.transport.inner;
        if inner.refs.fetch_sub(1, Ordering::SeqCst) == 1
            && inner.destroy_requested.load(Ordering::SeqCst)
        {
            self.transport.release();
        }
    }
}

impl Transport {
    /// Create a transport in `Connecting` state
    pub fn new(
        direction: Direction,
        local: AppAddr,
        remote: AppAddr,
        config: TransportConfig,
        manager: Arc<dyn TransportManager>,
        runtime: Handle,
    ) -> Self {
        let id = NEXT_TRANSPORT_ID.fetch_add(1, Ordering::Relaxed);
        let name = match direction {
            Direction::Inbound => format!("rinas{}", id),
            Direction::Outbound => format!("rinac{}", id),
        };
        let (state_tx, _) = watch::channel(TransportState::Connecting);

        Self {
            inner: Arc::new(Inner {
                id,
                name,
                direction,
                local,
                remote,
                config,
                manager,
                runtime,
                shared: Mutex::new(Shared::new()),
                last_activity: Mutex::new(Instant::now()),
                state_tx,
                registered: AtomicBool::new(false),
                shutdown_started: AtomicBool::new(false),
                destroy_requested: AtomicBool::new(false),
                released: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                refs: AtomicUsize::new(0),
            }),
        }
    }

    /// Unique transport id
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Object name (`rinas<id>` inbound, `rinac<id>` outbound)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Human-readable description
    pub fn info(&self) -> String {
        format!("RINA to {}", self.inner.remote)
    }

    /// Which side created the flow
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// Local application address
    pub fn local_addr(&self) -> &AppAddr {
        &self.inner.local
    }

    /// Remote application address
    pub fn remote_addr(&self) -> &AppAddr {
        &self.inner.remote
    }

    /// Local host-port name
    pub fn local_name(&self) -> HostPort {
        self.inner.local.host_port()
    }

    /// Remote host-port name
    pub fn remote_name(&self) -> HostPort {
        self.inner.remote.host_port()
    }

    /// Settings in effect
    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Current state
    pub fn state(&self) -> TransportState {
        self.lock().state
    }

    /// Whether connecting failed; failed transports are never reused
    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Whether the manager currently holds this transport
    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
    }

    /// First error recorded on the transport
    pub fn close_reason(&self) -> Option<TransportError> {
        self.lock().close_reason.clone()
    }

    /// Sends waiting for the transport to connect
    pub fn pending_sends(&self) -> usize {
        self.lock().delayed.len()
    }

    /// Time of the last read or completed write
    pub fn last_activity(&self) -> Instant {
        *self
            .inner
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<TransportState> {
        self.inner.state_tx.subscribe()
    }

    /// Wait until the transport leaves `Connecting`
    pub async fn wait_connected(&self) -> Result<()> {
        let mut state_rx = self.subscribe();
        let state = *state_rx
            .wait_for(|state| *state != TransportState::Connecting)
            .await
            .map_err(|_| TransportError::NotConnected)?;

        match state {
            TransportState::Connected => Ok(()),
            _ => Err(self.close_reason().unwrap_or(TransportError::NotConnected)),
        }
    }

    /// Non-owning handle
    pub fn downgrade(&self) -> WeakTransport {
        WeakTransport {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Take a counted reference; release waits until it is dropped
    pub fn hold(&self) -> TransportRef {
        self.inner.refs.fetch_add(1, Ordering::SeqCst);
        TransportRef {
            transport: self.clone(),
        }
    }

    /// Send bytes on the transport.
    ///
    /// While connecting the send is queued for at most the delayed-send
    /// timeout. Once connected it is handed to the writer. On `Err` the
    /// callback is dropped without being called.
    pub fn send(&self, data: Bytes, on_sent: Option<SendCallback>) -> Result<SendOutcome> {
        let mut shared = self.lock();
        match shared.state {
            TransportState::Connecting => {
                let deadline = Instant::now() + self.inner.config.delayed_send_timeout;
                trace!(
                    "{}: send of {} byte(s) delayed until connected",
                    self.name(),
                    data.len()
                );
                shared
                    .delayed
                    .push(DelayedSend::new(data, on_sent, deadline));
                Ok(SendOutcome::Queued)
            }
            TransportState::Connected => {
                let writer = shared.writer.as_ref().ok_or(TransportError::NotConnected)?;
                writer
                    .send(WriteOp { data, on_sent })
                    .map_err(|_| TransportError::NotConnected)?;
                Ok(SendOutcome::Submitted)
            }
            TransportState::Closing | TransportState::Destroyed => {
                Err(TransportError::NotConnected)
            }
        }
    }

    /// Start using `flow`: register with the manager, start reading,
    /// flush delayed sends, start the keep-alive and report `Connected`.
    pub(crate) fn on_connected(&self, flow: Flow) -> Result<()> {
        let _guard = self.hold();

        let stream = match FlowStream::from_flow(flow) {
            Ok(stream) => stream,
            Err(e) => {
                let err = TransportError::from(e);
                self.on_connect_failed(err.clone());
                return Err(err);
            }
        };
        let port_id = stream.port_id();

        if let Err(e) = self.inner.manager.register_transport(self) {
            let err = TransportError::from(e);
            self.on_connect_failed(err.clone());
            return Err(err);
        }
        self.inner.registered.store(true, Ordering::SeqCst);

        let (read_half, write_half) = stream.split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        // Queued sends go to the writer before the state flips, so they
        // precede anything sent directly afterwards
        let expired = {
            let mut shared = self.lock();
            if shared.state != TransportState::Connecting {
                drop(shared);
                self.destroy(None);
                return Err(TransportError::NotConnected);
            }

            let (live, expired) = shared.delayed.split_expired(Instant::now());
            for entry in live {
                // The receiver is alive, it was created above
                let _ = writer_tx.send(WriteOp::from(entry));
            }
            shared.writer = Some(writer_tx);
            shared.state = TransportState::Connected;
            expired
        };
        self.inner.state_tx.send_replace(TransportState::Connected);
        self.touch();

        // Exits once the last sender is dropped at teardown
        self.inner
            .runtime
            .spawn(write_loop(self.clone(), write_half, writer_rx));

        if !expired.is_empty() {
            debug!(
                "{}: {} delayed send(s) expired before connecting",
                self.name(),
                expired.len()
            );
        }
        fail_all(expired, &TransportError::Timeout);

        info!(
            "{}: connected {} -> {} (flow {})",
            self.name(),
            self.inner.local,
            self.inner.remote,
            port_id
        );
        self.inner
            .manager
            .on_state(self, &TransportEvent::Connected);

        let reader = self.inner.runtime.spawn(read_loop(self.clone(), read_half));
        let keepalive = if self.inner.config.keepalive_enabled() {
            keepalive::spawn(self.downgrade(), self.inner.config.keepalive_interval)
        } else {
            None
        };

        let mut shared = self.lock();
        if shared.state != TransportState::Connected {
            reader.abort();
            if let Some(task) = keepalive {
                task.abort();
            }
        } else {
            shared.reader_task = Some(reader);
            shared.keepalive_task = keepalive;
        }
        drop(shared);

        Ok(())
    }

    /// The flow could not be set up; fail queued sends and tear down
    pub(crate) fn on_connect_failed(&self, err: TransportError) {
        self.inner.failed.store(true, Ordering::SeqCst);
        self.inner.shutdown_started.store(true, Ordering::SeqCst);

        let drained = {
            let mut shared = self.lock();
            shared.close_reason.get_or_insert_with(|| err.clone());
            shared.delayed.drain()
        };
        warn!(
            "{}: connection to {} failed: {} ({} pending send(s) dropped)",
            self.name(),
            self.inner.remote,
            err,
            drained.len()
        );
        fail_all(drained, &err);

        self.destroy(Some(err));
    }

    /// Handle a stream error. Only the first error has any effect.
    pub fn on_io_error(&self, err: TransportError) {
        if self.inner.shutdown_started.swap(true, Ordering::SeqCst) {
            trace!("{}: ignoring further error: {}", self.name(), err);
            return;
        }

        match err {
            TransportError::Closed => debug!("{}: flow closed by {}", self.name(), self.inner.remote),
            _ => warn!("{}: connection error: {}", self.name(), err),
        }

        let drained = {
            let mut shared = self.lock();
            shared.close_reason.get_or_insert_with(|| err.clone());
            shared.delayed.drain()
        };
        fail_all(drained, &err);

        self.inner.manager.on_state(
            self,
            &TransportEvent::Disconnected {
                reason: err.clone(),
            },
        );
        self.shutdown();
        self.destroy(Some(err));
    }

    /// Stop the keep-alive and the reader and refuse new sends. Idempotent.
    ///
    /// Writes already submitted still go out; once the writer has drained
    /// them it destroys the transport, which unregisters it.
    pub fn shutdown(&self) {
        let (changed, keepalive, reader) = {
            let mut shared = self.lock();
            let changed = matches!(
                shared.state,
                TransportState::Connecting | TransportState::Connected
            );
            let mut reader = None;
            if changed {
                shared.state = TransportState::Closing;
                shared.writer = None;
                reader = shared.reader_task.take();
            }
            (changed, shared.keepalive_task.take(), reader)
        };

        if let Some(task) = keepalive {
            task.abort();
        }
        // Only ever parked in `read`; no receive cycle is cut short
        if let Some(task) = reader {
            task.abort();
        }
        if changed {
            self.inner.state_tx.send_replace(TransportState::Closing);
            debug!("{}: shutting down", self.name());
        }
    }

    /// Destroy the transport. Idempotent.
    ///
    /// A registered transport first asks the manager to unregister it (the
    /// manager may call back in here). Resources are released once, when no
    /// [`TransportRef`] is outstanding.
    pub fn destroy(&self, reason: Option<TransportError>) {
        if let Some(reason) = reason {
            self.lock().close_reason.get_or_insert(reason);
        }

        if self.inner.registered.swap(false, Ordering::SeqCst) {
            trace!("{}: unregistering from manager", self.name());
            self.inner.manager.unregister_transport(self);
        }

        self.inner.destroy_requested.store(true, Ordering::SeqCst);
        if self.inner.refs.load(Ordering::SeqCst) == 0 {
            self.release();
        }
    }

    fn release(&self) {
        if self.inner.released.swap(true, Ordering::SeqCst) {
            return;
        }

        let (reader, keepalive, drained, reason) = {
            let mut shared = self.lock();
            shared.state = TransportState::Destroyed;
            shared.writer = None;
            (
                shared.reader_task.take(),
                shared.keepalive_task.take(),
                shared.delayed.drain(),
                shared.close_reason.clone(),
            )
        };

        if let Some(task) = reader {
            task.abort();
        }
        if let Some(task) = keepalive {
            task.abort();
        }
        fail_all(drained, reason.as_ref().unwrap_or(&TransportError::NotConnected));
        self.inner.state_tx.send_replace(TransportState::Destroyed);

        match reason {
            None => info!("{}: destroyed normally", self.name()),
            Some(reason) => info!("{}: destroyed with reason: {}", self.name(), reason),
        }
    }

    fn touch(&self) {
        *self
            .inner
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// One receive cycle: account for `n` new bytes, let the manager parse
    /// what is buffered and drop what it consumed.
    fn on_data_read(&self, buffer: &mut RxBuffer, n: usize) -> Result<()> {
        buffer.commit(n)?;
        let rdata = RxData {
            transport: self,
            packet: buffer.data(),
            received_at: Instant::now(),
        };
        let eaten = self.inner.manager.receive_packet(&rdata)?;
        buffer.consume(eaten)?;
        Ok(())
    }
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("name", &self.inner.name)
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .field("state", &self.state())
            .finish()
    }
}

async fn read_loop(transport: Transport, mut half: ReadHalf<FlowStream>) {
    let config = transport.config();
    let mut buffer = RxBuffer::new(config.fast_buffer_size, config.max_message_size);

    loop {
        let result = half.read(buffer.read_buf()).await;
        let _guard = transport.hold();

        let n = match result {
            Ok(0) => {
                transport.on_io_error(TransportError::Closed);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                transport.on_io_error(e.into());
                break;
            }
        };

        transport.touch();
        if let Err(e) = transport.on_data_read(&mut buffer, n) {
            transport.on_io_error(e);
            break;
        }

        if transport.state() != TransportState::Connected {
            trace!("{}: reader stopping", transport.name());
            break;
        }
    }
}

async fn write_loop(
    transport: Transport,
    mut half: WriteHalf<FlowStream>,
    mut rx: mpsc::UnboundedReceiver<WriteOp>,
) {
    while let Some(op) = rx.recv().await {
        let _guard = transport.hold();

        match half.write_all(&op.data).await {
            Ok(()) => {
                transport.touch();
                let len = op.data.len();
                op.complete(Ok(len));
            }
            Err(e) => {
                let err = TransportError::from(e);
                op.complete(Err(err.clone()));

                rx.close();
                while let Ok(op) = rx.try_recv() {
                    op.complete(Err(err.clone()));
                }
                transport.on_io_error(err);
                return;
            }
        }
    }

    let _ = half.shutdown().await;

    // The sender is dropped by shutdown or release only
    if transport.state() != TransportState::Destroyed {
        debug!("{}: write queue drained", transport.name());
        transport.destroy(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::TransportFactory;
    use crate::ManagerError;
    use rina_wire::{FrameDecoder, WireError};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    /// Manager that records what the transport reports
    #[derive(Default)]
    struct RecordingManager {
        registered: Mutex<Vec<u64>>,
        unregistered: Mutex<Vec<u64>>,
        events: Mutex<Vec<String>>,
        packets: Mutex<Vec<Vec<u8>>>,
    }

    impl TransportManager for RecordingManager {
        fn register_factory(
            &self,
            _factory: Arc<dyn TransportFactory>,
        ) -> std::result::Result<(), ManagerError> {
            Ok(())
        }

        fn unregister_factory(&self, _factory: &dyn TransportFactory) {}

        fn register_transport(&self, transport: &Transport) -> std::result::Result<(), ManagerError> {
            self.registered.lock().unwrap().push(transport.id());
            Ok(())
        }

        fn unregister_transport(&self, transport: &Transport) {
            self.unregistered.lock().unwrap().push(transport.id());
            // Re-enter the way a real manager does
            transport.destroy(None);
        }

        fn receive_packet(&self, rdata: &RxData<'_>) -> std::result::Result<usize, WireError> {
            let scan = FrameDecoder::new().scan(rdata.packet)?;
            let mut packets = self.packets.lock().unwrap();
            for range in scan.messages {
                packets.push(rdata.packet[range].to_vec());
            }
            Ok(scan.consumed)
        }

        fn on_state(&self, transport: &Transport, event: &TransportEvent) {
            let tag = match event {
                TransportEvent::Connected => format!("{}:connected", transport.id()),
                TransportEvent::Disconnected { .. } => format!("{}:disconnected", transport.id()),
            };
            self.events.lock().unwrap().push(tag);
        }
    }

    fn transport(manager: &Arc<RecordingManager>, config: TransportConfig) -> Transport {
        let manager: Arc<dyn TransportManager> = manager.clone();
        Transport::new(
            Direction::Outbound,
            AppAddr::from_name("sip.A"),
            AppAddr::from_name("sip.B"),
            config,
            manager,
            Handle::current(),
        )
    }

    fn no_keepalive() -> TransportConfig {
        TransportConfig {
            keepalive_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_names_and_initial_state() {
        let manager = Arc::new(RecordingManager::default());
        let t = transport(&manager, no_keepalive());

        assert!(t.name().starts_with("rinac"));
        assert_eq!(t.info(), "RINA to sip.B");
        assert_eq!(t.remote_name().to_string(), "sip.B:5060");
        assert_eq!(t.state(), TransportState::Connecting);
        assert!(!t.is_registered());
    }

    #[tokio::test]
    async fn test_send_before_connect_is_flushed_first() {
        let manager = Arc::new(RecordingManager::default());
        let t = transport(&manager, no_keepalive());

        assert_eq!(
            t.send(Bytes::from_static(b"first "), None).unwrap(),
            SendOutcome::Queued
        );
        assert_eq!(t.pending_sends(), 1);

        let (local, remote) = UnixStream::pair().unwrap();
        t.on_connected(Flow::new(1, local)).unwrap();
        assert_eq!(t.state(), TransportState::Connected);
        assert!(t.is_registered());
        assert_eq!(t.pending_sends(), 0);

        assert_eq!(
            t.send(Bytes::from_static(b"second"), None).unwrap(),
            SendOutcome::Submitted
        );

        let mut peer = FlowStream::from_flow(Flow::new(2, remote)).unwrap();
        let mut buf = [0u8; 12];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"first second");

        let events = manager.events.lock().unwrap().clone();
        assert_eq!(events, vec![format!("{}:connected", t.id())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_delayed_send_fails_once_and_is_not_sent() {
        let manager = Arc::new(RecordingManager::default());
        let t = transport(&manager, no_keepalive());

        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let record = outcomes.clone();
        t.send(
            Bytes::from_static(b"stale"),
            Some(Box::new(move |r: Result<usize>| {
                record.lock().unwrap().push(r.map_err(|e| e.to_string()))
            })),
        )
        .unwrap();

        tokio::time::advance(t.config().delayed_send_timeout + Duration::from_millis(1)).await;

        let (local, remote) = UnixStream::pair().unwrap();
        t.on_connected(Flow::new(1, local)).unwrap();
        t.send(Bytes::from_static(b"fresh"), None).unwrap();

        let mut peer = FlowStream::from_flow(Flow::new(2, remote)).unwrap();
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"fresh");

        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].as_ref().unwrap_err().contains("timed out"));
    }

    #[tokio::test]
    async fn test_connect_failure_drains_and_destroys() {
        let manager = Arc::new(RecordingManager::default());
        let t = transport(&manager, no_keepalive());

        let failures = Arc::new(AtomicUsize::new(0));
        let counter = failures.clone();
        t.send(
            Bytes::from_static(b"INVITE"),
            Some(Box::new(move |r: Result<usize>| {
                assert!(r.is_err());
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();

        t.on_connect_failed(TransportError::from(std::io::Error::from(
            std::io::ErrorKind::ConnectionRefused,
        )));

        assert!(t.is_failed());
        assert_eq!(t.state(), TransportState::Destroyed);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert!(t.wait_connected().await.is_err());
        assert!(t.send(Bytes::from_static(b"x"), None).unwrap_err().is_not_connected());
    }

    #[tokio::test]
    async fn test_destroy_and_shutdown_are_idempotent() {
        let manager = Arc::new(RecordingManager::default());
        let t = transport(&manager, no_keepalive());
        let (local, _remote) = UnixStream::pair().unwrap();
        t.on_connected(Flow::new(1, local)).unwrap();

        t.shutdown();
        t.shutdown();
        assert_eq!(t.state(), TransportState::Closing);
        assert!(t.send(Bytes::from_static(b"x"), None).is_err());

        t.destroy(None);
        t.destroy(None);
        assert_eq!(t.state(), TransportState::Destroyed);
        assert_eq!(manager.unregistered.lock().unwrap().len(), 1);
        assert!(t.close_reason().is_none());
    }

    #[tokio::test]
    async fn test_release_waits_for_outstanding_refs() {
        let manager = Arc::new(RecordingManager::default());
        let t = transport(&manager, no_keepalive());
        let (local, _remote) = UnixStream::pair().unwrap();
        t.on_connected(Flow::new(1, local)).unwrap();

        let held = t.hold();
        t.destroy(None);
        assert!(!t.is_registered());
        assert_ne!(t.state(), TransportState::Destroyed);

        drop(held);
        assert_eq!(t.state(), TransportState::Destroyed);
    }

    #[tokio::test]
    async fn test_peer_close_reports_disconnect_once() {
        let manager = Arc::new(RecordingManager::default());
        let t = transport(&manager, no_keepalive());
        let (local, remote) = UnixStream::pair().unwrap();
        t.on_connected(Flow::new(1, local)).unwrap();

        let mut state_rx = t.subscribe();
        drop(remote);
        state_rx
            .wait_for(|s| *s == TransportState::Destroyed)
            .await
            .unwrap();

        // A late error after teardown changes nothing
        t.on_io_error(TransportError::NotConnected);

        let events = manager.events.lock().unwrap().clone();
        assert_eq!(
            events,
            vec![
                format!("{}:connected", t.id()),
                format!("{}:disconnected", t.id())
            ]
        );
        assert!(matches!(t.close_reason(), Some(TransportError::Closed)));
    }

    #[tokio::test]
    async fn test_inbound_messages_reach_manager() {
        let manager = Arc::new(RecordingManager::default());
        let t = transport(&manager, no_keepalive());
        let (local, remote) = UnixStream::pair().unwrap();
        t.on_connected(Flow::new(1, local)).unwrap();

        let msg = b"OPTIONS sip:b SIP/2.0\r\nContent-Length: 0\r\n\r\n";
        let mut peer = FlowStream::from_flow(Flow::new(2, remote)).unwrap();
        peer.write_all(b"\r\n\r\n").await.unwrap();
        peer.write_all(msg).await.unwrap();

        for _ in 0..100 {
            if !manager.packets.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(manager.packets.lock().unwrap().clone(), vec![msg.to_vec()]);
    }

    #[tokio::test]
    async fn test_corrupt_stream_tears_down() {
        let manager = Arc::new(RecordingManager::default());
        let t = transport(&manager, no_keepalive());
        let (local, remote) = UnixStream::pair().unwrap();
        t.on_connected(Flow::new(1, local)).unwrap();

        let mut state_rx = t.subscribe();
        let mut peer = FlowStream::from_flow(Flow::new(2, remote)).unwrap();
        peer.write_all(b"GARBAGE\r\n\r\n").await.unwrap();

        state_rx
            .wait_for(|s| *s == TransportState::Destroyed)
            .await
            .unwrap();
        assert!(matches!(
            t.close_reason(),
            Some(TransportError::InvalidMessage(WireError::MissingContentLength))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_drains_writes_then_destroys() {
        let manager = Arc::new(RecordingManager::default());
        let t = transport(&manager, no_keepalive());
        let (local, remote) = UnixStream::pair().unwrap();
        t.on_connected(Flow::new(1, local)).unwrap();

        let sent = Arc::new(AtomicUsize::new(0));
        let counter = sent.clone();
        t.send(
            Bytes::from_static(b"BYE"),
            Some(Box::new(move |r: Result<usize>| {
                counter.fetch_add(r.unwrap(), Ordering::SeqCst);
            })),
        )
        .unwrap();
        t.shutdown();
        assert_eq!(t.state(), TransportState::Closing);

        // The submitted write still goes out, then the flow is closed
        let mut peer = FlowStream::from_flow(Flow::new(2, remote)).unwrap();
        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"BYE");

        let mut state_rx = t.subscribe();
        state_rx
            .wait_for(|s| *s == TransportState::Destroyed)
            .await
            .unwrap();
        assert_eq!(sent.load(Ordering::SeqCst), 3);
        assert!(!t.is_registered());
        assert_eq!(manager.unregistered.lock().unwrap().clone(), vec![t.id()]);
        assert!(t.close_reason().is_none());
    }

    #[tokio::test]
    async fn test_completion_callback_may_send_again() {
        let manager = Arc::new(RecordingManager::default());
        let t = transport(&manager, no_keepalive());

        let resend = Arc::new(Mutex::new(None));
        let record = resend.clone();
        let again = t.clone();
        t.send(
            Bytes::from_static(b"one;"),
            Some(Box::new(move |r: Result<usize>| {
                assert_eq!(r.unwrap(), 4);
                let outcome = again.send(Bytes::from_static(b"three;"), None);
                *record.lock().unwrap() = Some(outcome.map_err(|e| e.to_string()));
            })),
        )
        .unwrap();
        t.send(Bytes::from_static(b"two;"), None).unwrap();
        assert_eq!(t.pending_sends(), 2);

        let (local, remote) = UnixStream::pair().unwrap();
        t.on_connected(Flow::new(1, local)).unwrap();

        let mut peer = FlowStream::from_flow(Flow::new(2, remote)).unwrap();
        let mut buf = [0u8; 14];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one;two;three;");
        assert_eq!(
            resend.lock().unwrap().clone(),
            Some(Ok(SendOutcome::Submitted))
        );

        // Nothing else was written
        t.shutdown();
        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
