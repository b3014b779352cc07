//! Mesh module for session peer connectivity
//!
//! This module keeps one record per session participant and tries to keep
//! a direct connection to each of them, falling back to the host as relay
//! while direct links are negotiated.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                      Mesh Module Structure                     │
//! ├───────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  address.rs   - Transport, candidates, interface enumeration   │
//! │  control.rs   - Control packets and length-prefixed framing    │
//! │  provider.rs  - Connection provider trait and its events       │
//! │  peer.rs      - Per-participant record and connection roles    │
//! │  sim_open.rs  - TCP simultaneous-open socket state             │
//! │  manager.rs   - Scheduling, gossip, broadcast and relay        │
//! │                                                                │
//! └───────────────────────────────────────────────────────────────┘
//! ```

pub mod address;
pub mod control;
pub mod manager;
pub mod peer;
pub mod provider;
pub mod sim_open;

#[cfg(test)]
pub(crate) mod mock;

// Re-export commonly used types
pub use address::{
    enumerate_local_addresses,
    is_global_ipv6,
    AddressCandidate,
    PeerAddress,
    Transport,
};

pub use control::{
    ControlPacket,
    DecodeError,
    EncodeError,
    ForwardEnvelope,
    Recipients,
    decode_frame,
    decode_frames,
    decode_packet,
    encode_frame,
    encode_packet,
    MAX_MESSAGE_SIZE,
};

pub use manager::{Delivery, PeerConnectionManager};

pub use peer::{PeerDescriptor, PeerId, PeerRecord, PeerStatus, HOST_ID};

pub use provider::{
    BoundSocket,
    ConnectionId,
    ConnectionProvider,
    LocalSocketId,
    ProviderError,
    ProviderEvent,
};

pub use sim_open::SimultaneousOpen;
