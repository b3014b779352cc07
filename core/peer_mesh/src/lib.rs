//! Peer Mesh
//!
//! This crate provides the connection manager for a session mesh, handling:
//! - Address candidates learned locally, from a rendezvous service or by gossip
//! - Per-peer reconnection scheduling with bounded retries
//! - TCP simultaneous open for peers behind NATs
//! - Broadcast, unicast and relay through the session host
//!
//! The crate does no I/O of its own. Sockets live behind the
//! [`ConnectionProvider`] trait and time is passed in by the caller, so the
//! manager can be driven from any single-threaded event loop.

// ============================================================================
// Modules
// ============================================================================

/// Tunables for the connection manager
pub mod config;

/// Peer records, control packets and the connection manager
pub mod mesh;

// Re-export commonly used types
pub use config::{ConfigError, MeshConfig};
pub use mesh::{
    decode_frame, decode_frames, decode_packet, encode_frame, encode_packet,
    enumerate_local_addresses, AddressCandidate, BoundSocket, ConnectionId, ConnectionProvider,
    ControlPacket, DecodeError, Delivery, EncodeError, ForwardEnvelope, LocalSocketId,
    PeerAddress, PeerConnectionManager, PeerDescriptor, PeerId, PeerRecord, PeerStatus,
    ProviderError, ProviderEvent, Recipients, Transport, HOST_ID,
};
