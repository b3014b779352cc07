//! Per-participant record
//!
//! A record holds what the local process knows about one session peer: its
//! candidate addresses, the connections currently serving it and when the
//! next connection attempt is due.
//!
//! # Connection Roles
//!
//! ```text
//! message role ──► prefers UDP   (control traffic, low latency)
//! data role    ──► prefers TCP   (bulk traffic)
//! ```
//!
//! Both roles always point at a connection as soon as one exists: if only
//! one connection is up it serves both roles.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use super::address::{AddressCandidate, PeerAddress, Transport};
use super::provider::ConnectionId;
use super::sim_open::SimultaneousOpen;

/// Session-wide participant id
pub type PeerId = u32;

/// Id of the session host
pub const HOST_ID: PeerId = 0;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle state of a participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerStatus {
    /// Handshake with the host in progress
    Joining,
    /// Catching up on session state
    Chasing,
    /// Connected but not ready for the next synchronization point
    NotReady,
    /// Connected and ready
    Ready,
    /// Leaving; skipped by the scheduler
    Removed,
}

impl PeerStatus {
    /// Whether readiness checks wait for a peer in this state
    pub fn is_waited_for(self) -> bool {
        matches!(self, PeerStatus::NotReady | PeerStatus::Ready)
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PeerStatus::Joining => "joining",
            PeerStatus::Chasing => "chasing",
            PeerStatus::NotReady => "not ready",
            PeerStatus::Ready => "ready",
            PeerStatus::Removed => "removed",
        };
        write!(f, "{}", s)
    }
}

// ============================================================================
// Descriptor
// ============================================================================

/// Static identity of a participant, as published by the session roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    pub id: PeerId,
    pub name: String,
    #[serde(default)]
    pub is_local: bool,
    /// Takes part in the game (as opposed to spectating)
    #[serde(default = "default_true")]
    pub activated: bool,
    #[serde(default)]
    pub observer: bool,
}

fn default_true() -> bool {
    true
}

impl PeerDescriptor {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            is_local: false,
            activated: true,
            observer: false,
        }
    }

    pub fn local(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            is_local: true,
            ..Self::new(id, name)
        }
    }
}

// ============================================================================
// Record
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RoleSlot {
    conn: ConnectionId,
    transport: Transport,
}

/// Result of offering a new connection to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The connection now serves at least one role
    Attached,
    /// `current` already serves that role over the same transport
    Redundant { current: ConnectionId },
}

/// Everything known about one session peer
#[derive(Debug)]
pub struct PeerRecord {
    descriptor: PeerDescriptor,
    status: PeerStatus,
    addresses: Vec<AddressCandidate>,
    message: Option<RoleSlot>,
    data: Option<RoleSlot>,
    /// When the scheduler should next consider this peer
    pub next_attempt_at: Option<Instant>,
    /// Bound-but-unconnected socket for TCP simultaneous open
    pub sim_open: SimultaneousOpen,
    /// Game frame of the last recorded activity
    pub last_activity_frame: u64,
    /// Last IPv6 endpoint a rendezvous service reported for this peer
    pub rendezvous_ipv6: Option<SocketAddr>,
}

impl PeerRecord {
    pub fn new(descriptor: PeerDescriptor) -> Self {
        Self {
            descriptor,
            status: PeerStatus::Ready,
            addresses: Vec::new(),
            message: None,
            data: None,
            next_attempt_at: None,
            sim_open: SimultaneousOpen::default(),
            last_activity_frame: 0,
            rendezvous_ipv6: None,
        }
    }

    pub fn id(&self) -> PeerId {
        self.descriptor.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &PeerDescriptor {
        &self.descriptor
    }

    pub fn is_local(&self) -> bool {
        self.descriptor.is_local
    }

    pub fn is_host(&self) -> bool {
        self.descriptor.id == HOST_ID
    }

    pub fn status(&self) -> PeerStatus {
        self.status
    }

    pub fn set_status(&mut self, status: PeerStatus) {
        self.status = status;
    }

    pub fn is_removed(&self) -> bool {
        self.status == PeerStatus::Removed
    }

    // ========================================================================
    // Connections
    // ========================================================================

    pub fn message_conn(&self) -> Option<ConnectionId> {
        self.message.map(|slot| slot.conn)
    }

    pub fn data_conn(&self) -> Option<ConnectionId> {
        self.data.map(|slot| slot.conn)
    }

    pub fn has_connection(&self) -> bool {
        self.message.is_some() || self.data.is_some()
    }

    pub fn has_conn(&self, conn: ConnectionId) -> bool {
        self.message_conn() == Some(conn) || self.data_conn() == Some(conn)
    }

    /// Both roles are served by one and the same connection
    pub fn roles_coincide(&self) -> bool {
        match (self.message, self.data) {
            (Some(m), Some(d)) => m.conn == d.conn,
            _ => false,
        }
    }

    /// Distinct connections serving this peer
    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut conns = Vec::with_capacity(2);
        for slot in [self.message, self.data].into_iter().flatten() {
            if !conns.contains(&slot.conn) {
                conns.push(slot.conn);
            }
        }
        conns
    }

    /// Transports already in use by this peer's connections
    pub fn connection_transports(&self) -> Vec<Transport> {
        let mut transports = Vec::with_capacity(2);
        for slot in [self.message, self.data].into_iter().flatten() {
            if !transports.contains(&slot.transport) {
                transports.push(slot.transport);
            }
        }
        transports
    }

    /// Offer a freshly established connection
    ///
    /// UDP connections go to the message role and TCP connections to the
    /// data role. An empty role is filled from the other one.
    pub fn attach(&mut self, conn: ConnectionId, transport: Transport) -> AttachOutcome {
        let new = RoleSlot { conn, transport };
        let (slot, other) = match transport {
            Transport::Udp => (&mut self.message, &mut self.data),
            Transport::Tcp => (&mut self.data, &mut self.message),
        };

        if let Some(current) = *slot {
            if current.conn == conn {
                return AttachOutcome::Attached;
            }
            if current.transport == transport {
                return AttachOutcome::Redundant { current: current.conn };
            }
        }

        // A different transport in this slot was only aliased from `other`
        *slot = Some(new);
        if other.is_none() {
            *other = Some(new);
        }
        AttachOutcome::Attached
    }

    /// Drop a connection from every role it serves
    ///
    /// Returns false if the connection served no role.
    pub fn detach(&mut self, conn: ConnectionId) -> bool {
        let mut found = false;
        if self.message_conn() == Some(conn) {
            self.message = None;
            found = true;
        }
        if self.data_conn() == Some(conn) {
            self.data = None;
            found = true;
        }

        if self.message.is_none() {
            self.message = self.data;
        }
        if self.data.is_none() {
            self.data = self.message;
        }
        found
    }

    /// Forget all connections, returning each distinct one once
    pub fn take_connections(&mut self) -> Vec<ConnectionId> {
        let conns = self.connections();
        self.message = None;
        self.data = None;
        conns
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    pub fn addresses(&self) -> &[AddressCandidate] {
        &self.addresses
    }

    pub fn has_address(&self, address: &PeerAddress) -> bool {
        self.addresses.iter().any(|c| &c.address == address)
    }

    /// Insert a candidate unless already known; returns whether it was new
    pub fn insert_address(&mut self, address: PeerAddress, in_front: bool) -> bool {
        if self.has_address(&address) {
            return false;
        }
        let candidate = AddressCandidate::new(address);
        if in_front {
            self.addresses.insert(0, candidate);
        } else {
            self.addresses.push(candidate);
        }
        true
    }

    /// At least one candidate has a usable host part
    pub fn has_reachable_address(&self) -> bool {
        self.addresses.iter().any(|c| !c.address.is_null_host())
    }

    /// Index of the least-tried usable candidate
    ///
    /// Ties go to the earlier candidate. `usable` decides per transport.
    pub fn select_candidate<F>(&self, usable: F) -> Option<usize>
    where
        F: Fn(Transport) -> bool,
    {
        let mut best: Option<usize> = None;
        for (i, candidate) in self.addresses.iter().enumerate() {
            if candidate.address.is_null_host() || !usable(candidate.address.transport) {
                continue;
            }
            match best {
                Some(b) if self.addresses[b].attempts <= candidate.attempts => {}
                _ => best = Some(i),
            }
        }
        best
    }

    pub fn candidate(&self, index: usize) -> Option<&AddressCandidate> {
        self.addresses.get(index)
    }

    /// Count one attempt against a candidate
    pub fn record_attempt(&mut self, index: usize) {
        if let Some(candidate) = self.addresses.get_mut(index) {
            candidate.attempts = candidate.attempts.saturating_add(1);
        }
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.descriptor.name, self.descriptor.id)
    }
}

// ============================================================================
// Tests
// ============================================================================
