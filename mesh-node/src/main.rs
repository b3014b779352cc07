//! Mesh Node
//!
//! A session participant that:
//! - Listens for peer connections on TCP
//! - Connects to the peers of its roster through the peer_mesh manager
//! - Relays through the host until direct links are up
//! - Optionally broadcasts a demo message at a fixed interval

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use peer_mesh::{
    encode_packet, enumerate_local_addresses, ControlPacket, Delivery, PeerAddress,
    PeerConnectionManager, PeerDescriptor, PeerId,
};
use signal_hook::consts::{SIGINT, SIGTERM};

mod config;
mod link;
mod metrics;
mod provider;

use config::{parse_arg, NodeConfig};
use metrics::Metrics;
use provider::MioProvider;

// ============================================================================
// Constants
// ============================================================================

/// Listening endpoint when none is configured
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:0";

/// Longest single wait in the event loop
const MAX_POLL_WAIT: Duration = Duration::from_millis(100);

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .init();

    let args: Vec<String> = std::env::args().collect();

    // --config <file>          JSON roster and manager settings
    // --id <n>                 Local participant id (0 is the host)
    // --name <name>            Local display name
    // --listen <addr:port>     TCP listening endpoint
    // --peer <id>=<name>[@addr:port]  Roster entry (repeatable)
    // --rendezvous <addr:port> Our endpoint as observed from outside
    // --send-interval <secs>   Broadcast a demo message periodically
    // --run-for <secs>         Exit after the given time

    let mut config = match parse_arg(&args, "--config") {
        Some(path) => NodeConfig::load(Path::new(&path))?,
        None => NodeConfig::default(),
    };
    config.apply_args(&args)?;
    let local_id = config.validate()?;

    log::info!("Mesh node starting...");
    log::info!("  Id:      {}", local_id);
    log::info!("  Name:    {}", config.local_name());
    log::info!("  Peers:   {}", config.peers.len());
    log::info!(
        "  Retry:   {} ms x {}",
        config.mesh.retry_interval_ms,
        config.mesh.connect_attempts
    );

    let mut node = Node::new(config, local_id)?;
    node.run()
}

// ============================================================================
// Node
// ============================================================================

struct Node {
    manager: PeerConnectionManager,
    provider: MioProvider,
    metrics: Arc<Metrics>,
    /// Set by SIGINT/SIGTERM
    shutdown: Arc<AtomicBool>,
    name: String,
    send_interval: Option<Duration>,
    run_for: Option<Duration>,
    messages_sent: u64,
}

impl Node {
    fn new(config: NodeConfig, local_id: PeerId) -> Result<Self, Box<dyn std::error::Error>> {
        let metrics = Arc::new(Metrics::new());
        let mut provider = MioProvider::new(local_id, Arc::clone(&metrics))?;

        let listen_addr = match config.listen {
            Some(addr) => addr,
            None => DEFAULT_LISTEN_ADDR.parse()?,
        };
        let bound = provider.listen(listen_addr)?;
        log::info!("Listening on {}", bound);

        let name = config.local_name();
        let mut mesh_config = config.mesh.clone();
        mesh_config.tcp_port = bound.port();
        let mut manager =
            PeerConnectionManager::new(mesh_config, PeerDescriptor::local(local_id, name.clone()));

        let interfaces = if bound.ip().is_unspecified() {
            enumerate_local_addresses(bound.port())
        } else {
            vec![bound]
        };
        manager.set_local_addresses(bound.port(), 0, &interfaces);
        log::debug!("Local addresses: {:?}", manager.local_addresses());

        let now = Instant::now();
        for peer in &config.peers {
            manager.on_peer_added(peer.descriptor());
            for addr in &peer.addresses {
                manager.add_address(&mut provider, now, peer.id, PeerAddress::tcp(*addr), false, false);
            }
        }
        if let Some(rendezvous) = config.rendezvous {
            manager.add_rendezvous_address(&mut provider, now, local_id, rendezvous);
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;

        Ok(Node {
            manager,
            provider,
            metrics,
            shutdown,
            name,
            send_interval: config.send_interval_secs.map(Duration::from_secs),
            run_for: config.run_for_secs.map(Duration::from_secs),
            messages_sent: 0,
        })
    }

    fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        let started = Instant::now();
        let mut next_send = self.send_interval.map(|interval| started + interval);

        while !self.shutdown.load(Ordering::Relaxed) {
            let now = Instant::now();
            if self.run_for.is_some_and(|limit| now.duration_since(started) >= limit) {
                log::info!("Run time elapsed");
                break;
            }

            // Sleep until the manager's next deadline, bounded so the
            // shutdown flag and link pings are sent regularly
            let timeout = self
                .manager
                .next_wakeup()
                .map(|t| t.saturating_duration_since(now).min(MAX_POLL_WAIT))
                .or(Some(MAX_POLL_WAIT));

            self.provider.poll(timeout)?;

            let now = Instant::now();
            self.process_events(now);
            self.manager.tick(&mut self.provider, now);
            self.provider.service(now);
            self.process_events(now);

            if let (Some(at), Some(interval)) = (next_send, self.send_interval) {
                if now >= at {
                    self.send_demo_message();
                    next_send = Some(now + interval);
                }
            }
        }

        log::info!("Shutting down");
        self.close_all();
        log::info!("Final metrics:\n{}", self.metrics.render());
        Ok(())
    }

    fn process_events(&mut self, now: Instant) {
        while let Some(event) = self.provider.poll_event() {
            log::trace!("Provider event: {:?}", event);
            if let Some(delivery) = self.manager.handle_event(&mut self.provider, now, event) {
                Metrics::incr(&self.metrics.deliveries_total);
                self.on_delivery(delivery);
            }
        }
    }

    fn on_delivery(&self, delivery: Delivery) {
        log::info!(
            "Message from peer {}: {}",
            delivery.from,
            String::from_utf8_lossy(&delivery.payload)
        );
    }

    fn send_demo_message(&mut self) {
        self.messages_sent += 1;
        let text = format!("{} #{}", self.name, self.messages_sent);
        let bytes = match encode_packet(&ControlPacket::Message(text.into_bytes())) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode message: {}", e);
                return;
            }
        };
        if !self.manager.broadcast_to_all(&mut self.provider, &bytes, true) {
            log::debug!("Message #{} did not reach every peer", self.messages_sent);
        }
    }

    /// Drop every peer so their connections close before exit
    fn close_all(&mut self) {
        let remote: Vec<PeerId> = self
            .manager
            .peers()
            .filter(|rec| !rec.is_local())
            .map(|rec| rec.id())
            .collect();
        for id in remote {
            self.manager.on_peer_removed(&mut self.provider, id);
        }
        log::debug!("{} links left open", self.provider.link_count());
    }
}
