//! Peer connection manager
//!
//! Owns one [`PeerRecord`] per session participant and the table of live
//! connections. Everything happens on the caller's thread:
//!
//! ```text
//!            ┌──────────── tick(now) ─────────────┐
//!            │ pending simultaneous-open connects │
//!            │ per-peer connection scheduler      │──► provider.connect()
//!            └────────────────────────────────────┘
//!
//!  provider.poll_event() ──► handle_event() ──► roles, gossip, relay
//!                                         └──► Delivery (message layer)
//! ```
//!
//! While a peer has no direct connection, traffic for it goes through the
//! host inside a [`ForwardEnvelope`]. The host passes the inner frame on
//! over its own direct connection and never forwards an envelope again.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use super::address::{is_global_ipv6, is_link_local, scope_id, with_scope, PeerAddress, Transport};
use super::control::{decode_packet, encode_packet, ControlPacket, ForwardEnvelope, Recipients};
use super::peer::{AttachOutcome, PeerDescriptor, PeerId, PeerRecord, PeerStatus, HOST_ID};
use super::provider::{BoundSocket, ConnectionId, ConnectionProvider, ProviderEvent};
use super::sim_open::SimultaneousOpen;
use crate::config::MeshConfig;

// ============================================================================
// Types
// ============================================================================

/// Payload handed to the message layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Peer whose connection (or forward request) carried the payload
    pub from: PeerId,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct ConnectionEntry {
    peer: PeerId,
    transport: Transport,
    remote: SocketAddr,
    /// Dialled by us rather than accepted
    outbound: bool,
}

/// Connection manager for one session participant
#[derive(Debug)]
pub struct PeerConnectionManager {
    config: MeshConfig,
    local_id: PeerId,
    /// All participants, the local one included, ordered by id
    peers: BTreeMap<PeerId, PeerRecord>,
    /// Connections currently serving a role of some peer
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Addresses this process announces for itself
    local_addresses: Vec<PeerAddress>,
    /// Interface scope ids for IPv6 link-local connects
    local_interfaces: Vec<u32>,
}

impl PeerConnectionManager {
    /// Create a manager for the participant described by `local`
    pub fn new(config: MeshConfig, local: PeerDescriptor) -> Self {
        let local_id = local.id;
        let mut peers = BTreeMap::new();
        peers.insert(
            local_id,
            PeerRecord::new(PeerDescriptor {
                is_local: true,
                ..local
            }),
        );

        Self {
            config,
            local_id,
            peers,
            connections: HashMap::new(),
            local_addresses: Vec::new(),
            local_interfaces: vec![0],
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Whether the local participant is the session host
    pub fn is_host(&self) -> bool {
        self.local_id == HOST_ID
    }

    pub fn peer(&self, id: PeerId) -> Option<&PeerRecord> {
        self.peers.get(&id)
    }

    /// All records in id order, the local one included
    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn local_addresses(&self) -> &[PeerAddress] {
        &self.local_addresses
    }

    pub fn local_interfaces(&self) -> &[u32] {
        &self.local_interfaces
    }

    /// Peer a live connection belongs to
    pub fn connection_peer(&self, conn: ConnectionId) -> Option<PeerId> {
        self.connections.get(&conn).map(|entry| entry.peer)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Earliest moment `tick` has work to do
    pub fn next_wakeup(&self) -> Option<Instant> {
        self.peers
            .values()
            .filter(|rec| !rec.is_local() && !rec.is_removed())
            .flat_map(|rec| [rec.next_attempt_at, rec.sim_open.deadline()])
            .flatten()
            .min()
    }

    // ========================================================================
    // Roster
    // ========================================================================

    /// Create the record for a participant that joined
    ///
    /// Returns false for a known id or a second local participant.
    pub fn on_peer_added(&mut self, descriptor: PeerDescriptor) -> bool {
        if self.peers.contains_key(&descriptor.id) {
            log::debug!("Peer {} already known", descriptor.id);
            return false;
        }
        if descriptor.is_local {
            log::debug!("Ignoring second local peer {}", descriptor.id);
            return false;
        }

        log::info!("Peer {} ({}) added", descriptor.name, descriptor.id);
        self.peers.insert(descriptor.id, PeerRecord::new(descriptor));
        true
    }

    /// Drop a participant, closing its connections
    ///
    /// Each connection is closed once even if it serves both roles. A held
    /// simultaneous-open socket is released. Returns false if the peer was
    /// unknown or is the local participant.
    pub fn on_peer_removed(&mut self, provider: &mut dyn ConnectionProvider, id: PeerId) -> bool {
        if id == self.local_id {
            log::debug!("Refusing to remove the local peer");
            return false;
        }
        let Some(mut rec) = self.peers.remove(&id) else {
            return false;
        };

        for conn in rec.take_connections() {
            self.connections.remove(&conn);
            provider.close(conn);
        }
        if let Some(socket) = rec.sim_open.take_socket() {
            provider.release_bound(socket.id);
        }

        log::info!("Peer {} removed", rec);
        true
    }

    pub fn set_status(&mut self, id: PeerId, status: PeerStatus) -> bool {
        match self.peers.get_mut(&id) {
            Some(rec) => {
                rec.set_status(status);
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Readiness and Activity
    // ========================================================================

    /// Every waited-for remote peer is ready
    pub fn is_all_ready(&self) -> bool {
        self.peers
            .values()
            .filter(|rec| !rec.is_local() && rec.status().is_waited_for())
            .all(|rec| rec.status() == PeerStatus::Ready)
    }

    /// Mark every waited-for peer as not ready
    pub fn reset_readiness(&mut self) {
        for rec in self.peers.values_mut() {
            if rec.status().is_waited_for() {
                rec.set_status(PeerStatus::NotReady);
            }
        }
    }

    /// Stamp `frame` on every activated peer that `is_active` accepts
    pub fn update_activity<F>(&mut self, frame: u64, is_active: F)
    where
        F: Fn(PeerId) -> bool,
    {
        for rec in self.peers.values_mut() {
            if rec.descriptor().activated && is_active(rec.id()) {
                rec.last_activity_frame = frame;
            }
        }
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    /// Record the local listening addresses
    ///
    /// The any-address stands in for whatever address a receiver sees our
    /// packets come from. IPv6 link-local interfaces contribute their scope
    /// ids as local interface ids.
    pub fn set_local_addresses(&mut self, tcp_port: u16, udp_port: u16, interfaces: &[SocketAddr]) {
        self.local_addresses.clear();
        self.local_interfaces.clear();

        let ports = [(Transport::Tcp, tcp_port), (Transport::Udp, udp_port)];
        let any = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);

        for host in std::iter::once(any).chain(interfaces.iter().copied()) {
            for (transport, port) in ports {
                if port == 0 {
                    continue;
                }
                let mut endpoint = host;
                endpoint.set_port(port);
                let address = PeerAddress::new(transport, endpoint);
                if !self.local_addresses.contains(&address) {
                    self.local_addresses.push(address);
                }
            }

            let scope = scope_id(&host);
            if scope != 0 && !self.local_interfaces.contains(&scope) {
                self.local_interfaces.push(scope);
            }
        }

        if self.local_interfaces.is_empty() {
            self.local_interfaces.push(0);
        }
    }

    /// Add a candidate address for `peer`
    ///
    /// New candidates of a remote peer schedule an attempt right away if
    /// none is pending. With `announce` a new candidate is broadcast to all
    /// directly connected peers. Returns false if the peer is unknown or the
    /// announcement could not be sent; the candidate is kept either way.
    pub fn add_address(
        &mut self,
        provider: &mut dyn ConnectionProvider,
        now: Instant,
        peer: PeerId,
        address: PeerAddress,
        announce: bool,
        in_front: bool,
    ) -> bool {
        let inserted = if peer == self.local_id {
            if self.local_addresses.contains(&address) {
                false
            } else if in_front {
                self.local_addresses.insert(0, address);
                true
            } else {
                self.local_addresses.push(address);
                true
            }
        } else {
            let Some(rec) = self.peers.get_mut(&peer) else {
                log::debug!("Address {} for unknown peer {}", address, peer);
                return false;
            };
            let inserted = rec.insert_address(address, in_front);
            if inserted {
                log::debug!("Added address {} for peer {}", address, rec);
                if rec.next_attempt_at.is_none() {
                    rec.next_attempt_at = Some(now);
                }
            }
            inserted
        };

        if inserted && announce {
            return self.announce_address(provider, peer, address);
        }
        true
    }

    /// Add the endpoint a rendezvous service observed for `peer`
    ///
    /// The endpoint is added as UDP. If the observed port differs from the
    /// configured UDP port it is also added with the configured port, and
    /// with a TCP port configured it is added as TCP too. All of them go in
    /// front and are announced.
    pub fn add_rendezvous_address(
        &mut self,
        provider: &mut dyn ConnectionProvider,
        now: Instant,
        peer: PeerId,
        endpoint: SocketAddr,
    ) -> bool {
        let observed = PeerAddress::udp(endpoint);
        let udp_port = self.config.udp_port;
        let tcp_port = self.config.tcp_port;

        let mut ok = self.add_address(provider, now, peer, observed, true, true);
        if udp_port != 0 && observed.endpoint.port() != udp_port {
            ok &= self.add_address(provider, now, peer, observed.with_port(udp_port), true, true);
        }
        if tcp_port != 0 {
            let tcp = PeerAddress::tcp(observed.with_port(tcp_port).endpoint);
            ok &= self.add_address(provider, now, peer, tcp, true, true);
        }

        if observed.endpoint.is_ipv6() {
            if let Some(rec) = self.peers.get_mut(&peer) {
                rec.rendezvous_ipv6 = Some(observed.endpoint);
            }
        }
        ok
    }

    /// Send every known address, ours included
    ///
    /// With a connection the packets go only there; scoped addresses are
    /// included if that connection's remote endpoint has the same scope.
    /// Without one they are broadcast to all connected peers and scoped
    /// addresses are left out.
    pub fn send_addresses(&mut self, provider: &mut dyn ConnectionProvider, conn: Option<ConnectionId>) {
        let mut all: Vec<(PeerId, PeerAddress)> = self
            .local_addresses
            .iter()
            .map(|address| (self.local_id, *address))
            .collect();
        for rec in self.peers.values().filter(|rec| !rec.is_local()) {
            all.extend(rec.addresses().iter().map(|c| (rec.id(), c.address)));
        }

        match conn {
            Some(conn) => self.send_address_list(provider, conn, &all),
            None => {
                for (subject, address) in all {
                    self.announce_address(provider, subject, address);
                }
            }
        }
    }

    fn send_address_list(
        &self,
        provider: &mut dyn ConnectionProvider,
        conn: ConnectionId,
        list: &[(PeerId, PeerAddress)],
    ) {
        let remote_scope = self.remote_endpoint(provider, conn).map(|r| scope_id(&r));

        for (subject, address) in list {
            let scope = address.scope_id();
            if scope != 0 && remote_scope != Some(scope) {
                continue;
            }
            let packet = ControlPacket::Address {
                subject: *subject,
                address: address.without_scope(),
            };
            if !self.send_packet(provider, conn, &packet) {
                log::debug!("Could not send address {} on {}", address, conn);
            }
        }
    }

    fn announce_address(
        &self,
        provider: &mut dyn ConnectionProvider,
        subject: PeerId,
        address: PeerAddress,
    ) -> bool {
        if address.scope_id() != 0 {
            return true;
        }
        match encode_packet(&ControlPacket::Address { subject, address }) {
            Ok(bytes) => self.broadcast_to_connected(provider, &bytes),
            Err(e) => {
                log::warn!("Failed to encode address packet: {}", e);
                false
            }
        }
    }

    fn remote_endpoint(&self, provider: &dyn ConnectionProvider, conn: ConnectionId) -> Option<SocketAddr> {
        self.connections
            .get(&conn)
            .map(|entry| entry.remote)
            .or_else(|| provider.remote_endpoint(conn))
    }

    // ========================================================================
    // Scheduler
    // ========================================================================

    /// Periodic work: due simultaneous-open connects and connection attempts
    pub fn tick(&mut self, provider: &mut dyn ConnectionProvider, now: Instant) {
        for rec in self.peers.values_mut() {
            if let Some((socket, remote)) = rec.sim_open.take_due(now) {
                log::info!(
                    "Connecting peer {} on {} with TCP simultaneous open...",
                    rec,
                    remote
                );
                if let Err(e) = provider.connect_bound(socket.id, remote, rec.id()) {
                    log::debug!("Simultaneous open connect to {} failed: {}", remote, e);
                }
            }
        }

        let ids: Vec<PeerId> = self.peers.keys().copied().collect();
        for id in ids {
            self.connect_attempt(provider, now, id);
        }
    }

    fn connect_attempt(&mut self, provider: &mut dyn ConnectionProvider, now: Instant, id: PeerId) {
        let local_id = self.local_id;
        let retry = self.config.retry_interval();
        let attempt_cap = self.config.connect_attempts;

        let Some(rec) = self.peers.get_mut(&id) else {
            return;
        };
        if rec.is_local() || rec.is_removed() {
            return;
        }

        if rec.roles_coincide() {
            rec.next_attempt_at = Some(now + self.config.heartbeat_interval());
            return;
        }
        match rec.next_attempt_at {
            Some(due) if due <= now => {}
            _ => return,
        }

        let busy = rec.connection_transports();
        let selected = rec.select_candidate(|t| !busy.contains(&t) && provider.supports(t));
        let index = match selected {
            Some(i) if rec.addresses()[i].attempts <= attempt_cap => i,
            _ => {
                rec.next_attempt_at = if rec.has_reachable_address() || rec.has_connection() {
                    Some(now + retry)
                } else {
                    None
                };
                return;
            }
        };

        rec.record_attempt(index);
        rec.next_attempt_at = Some(now + retry);

        let address = rec.addresses()[index].address;
        let sim_open = local_id < id
            && address.transport == Transport::Tcp
            && is_global_ipv6(&address.endpoint)
            && !rec.sim_open.holds_socket();

        if sim_open {
            self.start_simultaneous_open(provider, id);
        }
        self.issue_connect(provider, id, address);
    }

    /// Ask the provider to connect, once per local interface for IPv6
    /// link-local endpoints
    fn issue_connect(&self, provider: &mut dyn ConnectionProvider, id: PeerId, address: PeerAddress) -> bool {
        let scopes = if address.endpoint.is_ipv6() && is_link_local(&address.endpoint.ip()) {
            self.local_interfaces.clone()
        } else {
            vec![0]
        };
        let name = self.peers.get(&id).map(|rec| rec.to_string()).unwrap_or_default();

        for scope in scopes {
            let endpoint = with_scope(address.endpoint, scope);
            log::info!(
                "Connecting peer {} on {}:{}...",
                name,
                address.transport,
                endpoint
            );
            match provider.connect(endpoint, address.transport, id) {
                Ok(()) => return true,
                Err(e) => log::debug!("Connect to {} failed to start: {}", endpoint, e),
            }
        }
        false
    }

    // ========================================================================
    // Simultaneous Open
    // ========================================================================

    fn start_simultaneous_open(&mut self, provider: &mut dyn ConnectionProvider, id: PeerId) {
        if let Some(socket) = self.bind_and_offer(provider, id) {
            log::info!(
                "Initiating TCP simultaneous open request for peer {} from {}...",
                id,
                socket.local
            );
            if let Some(rec) = self.peers.get_mut(&id) {
                rec.sim_open.bound(socket);
            }
        }
    }

    /// Bind on our own rendezvous IPv6 address and tell `id` the endpoint
    fn bind_and_offer(&mut self, provider: &mut dyn ConnectionProvider, id: PeerId) -> Option<BoundSocket> {
        if !provider.supports(Transport::Tcp) {
            return None;
        }
        let Some(own) = self.peers.get(&self.local_id).and_then(|rec| rec.rendezvous_ipv6) else {
            log::debug!("No rendezvous IPv6 address known, skipping simultaneous open");
            return None;
        };

        let socket = match provider.bind_local(Transport::Tcp, SocketAddr::new(own.ip(), 0)) {
            Ok(socket) => socket,
            Err(e) => {
                log::debug!("Could not bind simultaneous open socket: {}", e);
                return None;
            }
        };

        let offer = ControlPacket::SimultaneousOpenOffer {
            originator: self.local_id,
            endpoint: socket.local,
        };
        let sent = match encode_packet(&offer) {
            Ok(bytes) => self.send_to_peer(provider, id, &bytes),
            Err(_) => false,
        };
        if !sent {
            log::debug!("Could not send simultaneous open offer to peer {}", id);
            provider.release_bound(socket.id);
            return None;
        }
        Some(socket)
    }

    fn handle_offer(
        &mut self,
        provider: &mut dyn ConnectionProvider,
        now: Instant,
        arrival: ConnectionId,
        originator: PeerId,
        endpoint: SocketAddr,
    ) {
        let local_id = self.local_id;
        let max_delay = self.config.sim_open_max_delay();

        let Some(rec) = self.peers.get_mut(&originator) else {
            log::debug!("Simultaneous open offer from unknown peer {}", originator);
            return;
        };
        if rec.is_local() || rec.is_removed() {
            return;
        }
        if rec.connection_transports().contains(&Transport::Tcp) {
            log::debug!("Ignoring simultaneous open offer, {} already has TCP", rec);
            return;
        }

        let state = rec.sim_open;
        match state {
            SimultaneousOpen::Bound { socket } => {
                rec.sim_open = SimultaneousOpen::Idle;
                log::info!(
                    "Connecting peer {} on {} with TCP simultaneous open...",
                    rec,
                    endpoint
                );
                if let Err(e) = provider.connect_bound(socket.id, endpoint, originator) {
                    log::debug!("Simultaneous open connect to {} failed: {}", endpoint, e);
                }
            }
            SimultaneousOpen::ConnectPending { .. } => {
                rec.sim_open.schedule_connect(endpoint, now);
            }
            SimultaneousOpen::Idle => {
                if originator >= local_id {
                    log::debug!("Dropping simultaneous open offer from peer {}", originator);
                    return;
                }
                let rtt_conn = rec.message_conn().unwrap_or(arrival);
                let delay = responder_delay(provider.round_trip(rtt_conn), max_delay);

                let Some(socket) = self.bind_and_offer(provider, originator) else {
                    return;
                };
                log::info!(
                    "Responding to TCP simultaneous open request for peer {} from {}...",
                    originator,
                    socket.local
                );
                if let Some(rec) = self.peers.get_mut(&originator) {
                    rec.sim_open.bound(socket);
                    rec.sim_open.schedule_connect(endpoint, now + delay);
                }
            }
        }
    }

    // ========================================================================
    // Provider Events
    // ========================================================================

    /// Apply one provider event
    ///
    /// Returns a payload for the message layer if the event carried one.
    pub fn handle_event(
        &mut self,
        provider: &mut dyn ConnectionProvider,
        now: Instant,
        event: ProviderEvent,
    ) -> Option<Delivery> {
        match event {
            ProviderEvent::Connected {
                conn,
                peer,
                transport,
                remote,
                connect_addr,
            } => {
                self.on_connected(provider, now, conn, peer, transport, remote, connect_addr);
                None
            }
            ProviderEvent::ConnectFailed {
                peer,
                endpoint,
                transport,
            } => {
                log::debug!("Connecting peer {} on {}:{} failed", peer, transport, endpoint);
                None
            }
            ProviderEvent::Closed { conn } => {
                self.on_closed(now, conn);
                None
            }
            ProviderEvent::Packet { conn, bytes } => self.on_control_packet(provider, now, conn, &bytes),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_connected(
        &mut self,
        provider: &mut dyn ConnectionProvider,
        now: Instant,
        conn: ConnectionId,
        peer: PeerId,
        transport: Transport,
        remote: SocketAddr,
        connect_addr: Option<SocketAddr>,
    ) {
        let local_is_host = self.is_host();
        if self.connections.contains_key(&conn) {
            log::debug!("{} already attached", conn);
            return;
        }

        let rec = match self.peers.get_mut(&peer) {
            Some(rec) if !rec.is_local() && !rec.is_removed() => rec,
            _ => {
                log::debug!("Closing {} for stale peer {}", conn, peer);
                provider.close(conn);
                return;
            }
        };

        let first = !rec.has_connection();
        let outbound = connect_addr.is_some();
        if let AttachOutcome::Redundant { current } = rec.attach(conn, transport) {
            // Both ends must keep the same link when they dial each other:
            // the one dialled by the lower id wins
            let prefer_outbound = self.local_id < peer;
            let current_outbound = self.connections.get(&current).map(|entry| entry.outbound);
            if outbound != prefer_outbound || current_outbound == Some(prefer_outbound) {
                log::info!("Closing redundant {} connection to {} ({})", transport, rec, conn);
                provider.close(conn);
                return;
            }
            log::info!("Replacing {} connection to {} ({} -> {})", transport, rec, current, conn);
            rec.detach(current);
            rec.attach(conn, transport);
            self.connections.remove(&current);
            provider.close(current);
        }
        if let Some(socket) = rec.sim_open.take_socket() {
            provider.release_bound(socket.id);
        }
        log::info!("Connected to peer {} via {}:{} ({})", rec, transport, remote, conn);

        self.connections.insert(conn, ConnectionEntry { peer, transport, remote, outbound });

        if let Some(addr) = connect_addr {
            self.add_address(provider, now, peer, PeerAddress::new(transport, addr), true, false);
        }

        if first {
            if local_is_host {
                self.send_addresses(provider, Some(conn));
            } else {
                let own: Vec<(PeerId, PeerAddress)> = self
                    .local_addresses
                    .iter()
                    .map(|address| (self.local_id, *address))
                    .collect();
                self.send_address_list(provider, conn, &own);
            }
        }
    }

    fn on_closed(&mut self, now: Instant, conn: ConnectionId) {
        let Some(entry) = self.connections.remove(&conn) else {
            log::debug!("Close of unknown {}", conn);
            return;
        };
        let Some(rec) = self.peers.get_mut(&entry.peer) else {
            return;
        };

        rec.detach(conn);
        log::info!("{} connection to peer {} closed", entry.transport, rec);

        // A pending heartbeat deadline belonged to the shared connection
        if !rec.has_connection() {
            rec.next_attempt_at = rec.has_reachable_address().then_some(now);
        }
    }

    // ========================================================================
    // Control Packets
    // ========================================================================

    /// Interpret one frame received on `conn`
    ///
    /// Frames from unknown connections and malformed frames are dropped.
    pub fn on_control_packet(
        &mut self,
        provider: &mut dyn ConnectionProvider,
        now: Instant,
        conn: ConnectionId,
        bytes: &[u8],
    ) -> Option<Delivery> {
        let Some(entry) = self.connections.get(&conn).copied() else {
            log::debug!("Frame on unknown {}", conn);
            return None;
        };
        let packet = match decode_packet(bytes) {
            Ok(packet) => packet,
            Err(e) => {
                log::debug!("Dropping malformed frame from peer {}: {}", entry.peer, e);
                return None;
            }
        };

        log::trace!("{} packet from peer {} on {}", packet.kind(), entry.peer, conn);
        self.process_packet(provider, now, conn, entry, packet, false)
    }

    fn process_packet(
        &mut self,
        provider: &mut dyn ConnectionProvider,
        now: Instant,
        conn: ConnectionId,
        entry: ConnectionEntry,
        packet: ControlPacket,
        unwrapped: bool,
    ) -> Option<Delivery> {
        match packet {
            ControlPacket::Address { subject, address } => {
                self.handle_address(provider, now, entry, subject, address);
                None
            }
            ControlPacket::SimultaneousOpenOffer {
                originator,
                endpoint,
            } => {
                self.handle_offer(provider, now, conn, originator, endpoint);
                None
            }
            ControlPacket::Forward(_) if unwrapped => {
                log::debug!("Dropping nested forward from peer {}", entry.peer);
                None
            }
            ControlPacket::Forward(envelope) => self.handle_forward(provider, now, conn, entry, envelope),
            ControlPacket::Message(payload) => Some(Delivery {
                from: entry.peer,
                payload,
            }),
        }
    }

    /// Store an address learned from `source` and pass it on once to the
    /// other connected peers
    fn handle_address(
        &mut self,
        provider: &mut dyn ConnectionProvider,
        now: Instant,
        source: ConnectionEntry,
        subject: PeerId,
        address: PeerAddress,
    ) {
        if subject == self.local_id {
            return;
        }
        let Some(rec) = self.peers.get_mut(&subject) else {
            log::debug!("Address for unknown peer {}", subject);
            return;
        };
        if rec.is_removed() {
            return;
        }

        let address = if address.is_null_host() {
            address.with_ip(source.remote.ip())
        } else {
            address
        };
        if !rec.insert_address(address, false) {
            return;
        }
        log::info!("Learned address {} for peer {}", address, rec);
        rec.next_attempt_at = Some(now);

        if address.scope_id() != 0 {
            return;
        }
        let bytes = match encode_packet(&ControlPacket::Address { subject, address }) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode address packet: {}", e);
                return;
            }
        };
        for rec in self.peers.values() {
            if rec.is_local() || rec.is_removed() || rec.id() == source.peer || rec.id() == subject {
                continue;
            }
            if let Some(conn) = rec.message_conn() {
                provider.send(conn, &bytes);
            }
        }
    }

    fn handle_forward(
        &mut self,
        provider: &mut dyn ConnectionProvider,
        now: Instant,
        conn: ConnectionId,
        entry: ConnectionEntry,
        envelope: ForwardEnvelope,
    ) -> Option<Delivery> {
        let inner = match decode_packet(&envelope.payload) {
            Ok(ControlPacket::Forward(_)) => {
                log::debug!("Dropping nested forward from peer {}", entry.peer);
                return None;
            }
            Ok(inner) => inner,
            Err(e) => {
                log::debug!("Dropping forward with malformed payload: {}", e);
                return None;
            }
        };

        if !self.is_host() {
            if envelope.recipients.includes(self.local_id) {
                return self.process_packet(provider, now, conn, entry, inner, true);
            }
            log::debug!("Dropping forward not addressed to us from peer {}", entry.peer);
            return None;
        }

        let targets: Vec<PeerId> = match &envelope.recipients {
            Recipients::All => self.peers.keys().copied().collect(),
            Recipients::Only(ids) => {
                let mut ids = ids.clone();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
        };

        let mut delivery = None;
        for id in targets {
            if id == entry.peer {
                continue;
            }
            if id == self.local_id {
                delivery = self.process_packet(provider, now, conn, entry, inner.clone(), true);
                continue;
            }
            match self.peers.get(&id).and_then(|rec| rec.message_conn()) {
                Some(target) => {
                    if provider.send(target, &envelope.payload) {
                        log::trace!("Relayed {} from peer {} to peer {}", inner.kind(), entry.peer, id);
                    } else {
                        log::debug!("Relay to peer {} failed", id);
                    }
                }
                None => log::debug!("Dropping forward to unreachable peer {}", id),
            }
        }
        delivery
    }

    // ========================================================================
    // Sending
    // ========================================================================

    fn send_packet(&self, provider: &mut dyn ConnectionProvider, conn: ConnectionId, packet: &ControlPacket) -> bool {
        match encode_packet(packet) {
            Ok(bytes) => provider.send(conn, &bytes),
            Err(e) => {
                log::warn!("Failed to encode {} packet: {}", packet.kind(), e);
                false
            }
        }
    }

    /// Send to every peer that has a message connection
    pub fn broadcast_to_connected(&self, provider: &mut dyn ConnectionProvider, bytes: &[u8]) -> bool {
        let mut ok = true;
        for rec in self.peers.values().filter(|rec| !rec.is_local() && !rec.is_removed()) {
            if let Some(conn) = rec.message_conn() {
                if !provider.send(conn, bytes) {
                    ok = false;
                }
            }
        }
        ok
    }

    /// Send to every roster peer, through the host where no direct
    /// connection exists
    ///
    /// The host itself is only a recipient with `include_host`. When the
    /// local participant is the host, peers it cannot reach directly make
    /// the call fail.
    pub fn broadcast_to_all(
        &self,
        provider: &mut dyn ConnectionProvider,
        bytes: &[u8],
        include_host: bool,
    ) -> bool {
        let mut ok = true;
        let mut unreached = Vec::new();

        for rec in self.peers.values().filter(|rec| !rec.is_local() && !rec.is_removed()) {
            if rec.is_host() && !include_host {
                continue;
            }
            match rec.message_conn() {
                Some(conn) => {
                    if !provider.send(conn, bytes) {
                        ok = false;
                    }
                }
                None => unreached.push(rec.id()),
            }
        }

        if unreached.is_empty() {
            return ok;
        }
        if self.is_host() {
            log::debug!("Broadcast could not reach peers {:?}", unreached);
            return false;
        }
        self.forward_via_host(provider, Recipients::Only(unreached), bytes) && ok
    }

    /// Send to the host's message connection
    pub fn send_to_host(&self, provider: &mut dyn ConnectionProvider, bytes: &[u8]) -> bool {
        if self.is_host() {
            return false;
        }
        match self.peers.get(&HOST_ID).and_then(|rec| rec.message_conn()) {
            Some(conn) => provider.send(conn, bytes),
            None => false,
        }
    }

    /// Send to one peer, through the host if not directly connected
    pub fn send_to_peer(&self, provider: &mut dyn ConnectionProvider, id: PeerId, bytes: &[u8]) -> bool {
        if id == self.local_id {
            return false;
        }
        let Some(rec) = self.peers.get(&id) else {
            return false;
        };
        if let Some(conn) = rec.message_conn() {
            return provider.send(conn, bytes);
        }
        if id == HOST_ID || self.is_host() {
            return false;
        }
        self.forward_via_host(provider, Recipients::Only(vec![id]), bytes)
    }

    fn forward_via_host(&self, provider: &mut dyn ConnectionProvider, recipients: Recipients, bytes: &[u8]) -> bool {
        let packet = ControlPacket::Forward(ForwardEnvelope {
            recipients,
            payload: bytes.to_vec(),
        });
        match encode_packet(&packet) {
            Ok(frame) => self.send_to_host(provider, &frame),
            Err(e) => {
                log::warn!("Failed to encode forward: {}", e);
                false
            }
        }
    }
}

/// Half the round-trip time, at most `cap`; `cap` if unmeasured
fn responder_delay(rtt: Option<Duration>, cap: Duration) -> Duration {
    rtt.map(|rtt| rtt / 2).unwrap_or(cap).min(cap)
}

// ============================================================================
// Tests
// ============================================================================
