//! RINA SIP transport service binary.
//!
//! Runs a listener for the local application on the in-memory fabric, starts
//! responder listeners for each configured peer and pings the peers with SIP
//! OPTIONS over outbound RINA transports until interrupted.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use rina_fabric::{AppAddr, MemFabric};
use rina_transport::{
    InboundMessage, Listener, RegistryEvent, RegistryHandle, TransportRegistry, TRANSPORT_TYPE,
};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[macro_use]
mod logging;
mod config;

use config::RinaServiceConfig;
use logging::RinaLogFormatter;

/// SIP over RINA flows
#[derive(Parser, Debug)]
#[command(name = "sip-rina", version, about = "SIP signalling transport over RINA flows")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Local application name, e.g. sip.A
    #[arg(long)]
    local_app: Option<String>,

    /// DIF to register the local application in
    #[arg(long)]
    dif: Option<String>,

    /// Peer application to ping (repeatable), e.g. --peer sip.B
    #[arg(long)]
    peer: Vec<String>,

    /// Keep-alive interval, e.g. 90s (0s disables)
    #[arg(long)]
    keepalive_interval: Option<humantime::Duration>,

    /// OPTIONS ping interval, e.g. 30s (0s disables)
    #[arg(long)]
    ping_interval: Option<humantime::Duration>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply_to(&self, config: &mut RinaServiceConfig) {
        if let Some(local_app) = &self.local_app {
            config.local_app = local_app.clone();
        }
        if let Some(dif) = &self.dif {
            config.dif = Some(dif.clone());
        }
        if !self.peer.is_empty() {
            config.peers = self.peer.clone();
        }
        if let Some(interval) = self.keepalive_interval {
            config.transport.keepalive_interval = interval.into();
        }
        if let Some(interval) = self.ping_interval {
            config.ping_interval = interval.into();
        }
    }
}

/// A peer application answering OPTIONS on its own registry
struct Responder {
    listener: Listener,
    registry: Arc<TransportRegistry>,
    task: JoinHandle<()>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("sip_rina={}", args.log_level).parse()?)
        .add_directive(format!("rina_transport={}", args.log_level).parse()?)
        .add_directive(format!("rina_fabric={}", args.log_level).parse()?)
        .add_directive(format!("rina_wire={}", args.log_level).parse()?);

    let formatter = RinaLogFormatter::new("rina".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting SIP over RINA service v{}", env!("CARGO_PKG_VERSION"));

    let mut config = RinaServiceConfig::load_from_file(&args.config)?;
    args.apply_to(&mut config);
    config
        .transport
        .validate()
        .context("Invalid transport configuration")?;

    info!(
        "Final configuration: local_app={}, dif={}, peers={:?}, keepalive={}, ping={}",
        config.local_app,
        config.dif.as_deref().unwrap_or("<any>"),
        config.peers,
        humantime::format_duration(config.transport.keepalive_interval),
        humantime::format_duration(config.ping_interval)
    );

    let fabric = Arc::new(MemFabric::new());
    let (registry, mut handle) = TransportRegistry::new();

    let listener = Listener::start(config.listener_config(), fabric.clone(), registry.clone())
        .with_context(|| format!("Failed to start listener for {}", config.local_app))?;
    component_info!(
        "listener",
        "{} serving {} as {}",
        listener.name(),
        TRANSPORT_TYPE,
        listener.local_name()
    );

    let mut responders = Vec::with_capacity(config.peers.len());
    for peer in &config.peers {
        let (peer_registry, peer_handle) = TransportRegistry::new();
        let peer_listener = Listener::start(
            config.listener_config_for(peer),
            fabric.clone(),
            peer_registry.clone(),
        )
        .with_context(|| format!("Failed to start responder for {}", peer))?;
        let task = tokio::spawn(respond(peer.clone(), peer_registry.clone(), peer_handle));
        responders.push(Responder {
            listener: peer_listener,
            registry: peer_registry,
            task,
        });
    }

    let pinger = tokio::spawn(ping_peers(
        registry.clone(),
        config.local_app.clone(),
        config.peers.clone(),
        config.ping_interval,
    ));

    info!("Service started, press Ctrl-C to stop");

    loop {
        tokio::select! {
            Some(message) = handle.messages.recv() => {
                component_info!(
                    "sip",
                    "{} byte(s) from {}: {}",
                    message.payload.len(),
                    message.remote,
                    start_line(&message.payload)
                );
            }
            Some(event) = handle.events.recv() => log_event(&event),
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Received shutdown signal");
                break;
            }
        }
    }

    pinger.abort();
    registry.shutdown_all();
    for responder in &responders {
        responder.task.abort();
        responder.registry.shutdown_all();
    }

    // Stopping joins the accept threads
    tokio::task::block_in_place(|| {
        listener.stop();
        for responder in &responders {
            responder.listener.stop();
        }
    });

    info!("Shutdown complete");
    Ok(())
}

/// Answer every request arriving at `app` with a bare 200 OK
async fn respond(app: String, registry: Arc<TransportRegistry>, mut handle: RegistryHandle) {
    loop {
        tokio::select! {
            Some(message) = handle.messages.recv() => answer(&app, &registry, &message),
            Some(event) = handle.events.recv() => log_event(&event),
            else => break,
        }
    }
}

fn answer(app: &str, registry: &TransportRegistry, message: &InboundMessage) {
    if message.payload.starts_with(b"SIP/2.0") {
        component_debug!("responder", "{} ignoring response from {}", app, message.remote);
        return;
    }

    let Some(transport) = registry
        .transports()
        .into_iter()
        .find(|t| t.id() == message.transport_id)
    else {
        component_warn!(
            "responder",
            "{} has no transport {} to answer {}",
            app,
            message.transport_id,
            message.remote
        );
        return;
    };

    let reply = Bytes::from_static(b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n");
    if let Err(e) = transport.send(reply, None) {
        component_warn!("responder", "{} failed to answer on {}: {}", app, transport.name(), e);
    }
}

/// Send OPTIONS to each peer every `interval`; a zero interval disables pinging
async fn ping_peers(
    registry: Arc<TransportRegistry>,
    local_app: String,
    peers: Vec<String>,
    interval: Duration,
) {
    if peers.is_empty() {
        return;
    }
    if interval.is_zero() {
        component_info!("ping", "Ping interval is zero, not pinging {:?}", peers);
        return;
    }

    let mut ticker = tokio::time::interval(interval);
    let mut cseq: u64 = 0;
    loop {
        ticker.tick().await;
        cseq += 1;
        for peer in &peers {
            let request = options(&local_app, peer, cseq);
            match registry.send_to(TRANSPORT_TYPE, &AppAddr::from_name(peer), request) {
                Ok(outcome) => component_debug!("ping", "OPTIONS {} to {}: {:?}", cseq, peer, outcome),
                Err(e) => component_warn!("ping", "OPTIONS {} to {} failed: {}", cseq, peer, e),
            }
        }
    }
}

fn options(local_app: &str, peer: &str, cseq: u64) -> Bytes {
    Bytes::from(format!(
        "OPTIONS sip:{peer} SIP/2.0\r\n\
         From: <sip:{local_app}>\r\n\
         To: <sip:{peer}>\r\n\
         Call-ID: ping-{cseq}@{local_app}\r\n\
         CSeq: {cseq} OPTIONS\r\n\
         Content-Length: 0\r\n\r\n"
    ))
}

fn log_event(event: &RegistryEvent) {
    match event {
        RegistryEvent::Connected { name, remote, .. } => {
            component_info!("transport", "{} connected to {}", name, remote)
        }
        RegistryEvent::Disconnected {
            name, remote, reason, ..
        } => component_warn!("transport", "{} to {} disconnected: {}", name, remote, reason),
    }
}

/// First line of a SIP message for logging
fn start_line(payload: &[u8]) -> String {
    let end = payload
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(payload.len());
    String::from_utf8_lossy(&payload[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_line() {
        assert_eq!(start_line(b"SIP/2.0 200 OK\r\nContent-Length: 0\r\n\r\n"), "SIP/2.0 200 OK");
        assert_eq!(start_line(b"no terminator"), "no terminator");
    }

    #[test]
    fn test_options_is_framed() {
        let request = options("sip.A", "sip.B", 7);
        let text = std::str::from_utf8(&request).unwrap();
        assert!(text.starts_with("OPTIONS sip:sip.B SIP/2.0\r\n"));
        assert!(text.contains("CSeq: 7 OPTIONS\r\n"));
        assert!(text.ends_with("Content-Length: 0\r\n\r\n"));
    }

    #[test]
    fn test_cli_overrides_config() {
        let args = Args::parse_from([
            "sip-rina",
            "--local-app",
            "sip.cli",
            "--peer",
            "sip.B",
            "--peer",
            "sip.C",
            "--keepalive-interval",
            "0s",
            "--ping-interval",
            "2s",
        ]);
        let mut config = RinaServiceConfig::default();
        args.apply_to(&mut config);

        assert_eq!(config.local_app, "sip.cli");
        assert_eq!(config.peers, vec!["sip.B", "sip.C"]);
        assert!(!config.transport.keepalive_enabled());
        assert_eq!(config.ping_interval, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_zero_ping_interval_disables_pinging() {
        let args = Args::parse_from(["sip-rina", "--peer", "sip.B", "--ping-interval", "0s"]);
        let mut config = RinaServiceConfig::default();
        args.apply_to(&mut config);
        assert!(config.ping_interval.is_zero());

        let (registry, _handle) = TransportRegistry::new();
        let pinger = tokio::spawn(ping_peers(
            registry.clone(),
            config.local_app.clone(),
            config.peers.clone(),
            config.ping_interval,
        ));

        tokio::time::timeout(Duration::from_secs(5), pinger)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(registry.transport_count(), 0);
    }

    #[tokio::test]
    async fn test_responder_answers_options() {
        let fabric = Arc::new(MemFabric::new());
        let config = RinaServiceConfig {
            local_app: "sip.A".to_string(),
            ..Default::default()
        };

        let (registry, mut handle) = TransportRegistry::new();
        let listener =
            Listener::start(config.listener_config(), fabric.clone(), registry.clone()).unwrap();

        let (peer_registry, peer_handle) = TransportRegistry::new();
        let peer = Listener::start(
            config.listener_config_for("sip.B"),
            fabric.clone(),
            peer_registry.clone(),
        )
        .unwrap();
        let task = tokio::spawn(respond("sip.B".to_string(), peer_registry.clone(), peer_handle));

        registry
            .send_to(TRANSPORT_TYPE, &AppAddr::from_name("sip.B"), options("sip.A", "sip.B", 1))
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), handle.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(start_line(&reply.payload), "SIP/2.0 200 OK");
        assert_eq!(reply.remote, AppAddr::from_name("sip.B"));

        task.abort();
        registry.shutdown_all();
        peer_registry.shutdown_all();
        listener.stop();
        peer.stop();
    }
}
