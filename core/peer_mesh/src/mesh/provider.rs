//! Connection provider interface
//!
//! The manager never touches sockets. It asks a [`ConnectionProvider`] to
//! open, bind, send and close, and the provider reports what happened as
//! [`ProviderEvent`]s which the event loop drains and feeds back through
//! `PeerConnectionManager::handle_event`.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use super::address::Transport;
use super::peer::PeerId;

/// Opaque handle of a live connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Opaque handle of a bound but unconnected socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalSocketId(pub u64);

/// A socket bound for simultaneous open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundSocket {
    pub id: LocalSocketId,
    /// Local endpoint after binding (port assigned by the OS)
    pub local: SocketAddr,
}

/// Socket operations the manager needs
pub trait ConnectionProvider {
    /// Whether this provider can open connections over `transport`
    fn supports(&self, transport: Transport) -> bool;

    /// Start a connection attempt; completion is reported as an event
    fn connect(
        &mut self,
        endpoint: SocketAddr,
        transport: Transport,
        peer: PeerId,
    ) -> Result<(), ProviderError>;

    /// Bind a socket without connecting it
    fn bind_local(
        &mut self,
        transport: Transport,
        addr: SocketAddr,
    ) -> Result<BoundSocket, ProviderError>;

    /// Connect a previously bound socket; consumes the socket
    fn connect_bound(
        &mut self,
        socket: LocalSocketId,
        endpoint: SocketAddr,
        peer: PeerId,
    ) -> Result<(), ProviderError>;

    /// Close a bound socket that will not be connected
    fn release_bound(&mut self, socket: LocalSocketId);

    /// Queue one frame; false if the connection cannot take it
    fn send(&mut self, conn: ConnectionId, bytes: &[u8]) -> bool;

    fn close(&mut self, conn: ConnectionId);

    /// Current round-trip estimate, if measured
    fn round_trip(&self, conn: ConnectionId) -> Option<Duration>;

    fn remote_endpoint(&self, conn: ConnectionId) -> Option<SocketAddr>;
}

/// Something the provider observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// A connection to or from `peer` is up
    Connected {
        conn: ConnectionId,
        peer: PeerId,
        transport: Transport,
        remote: SocketAddr,
        /// Endpoint we dialled, for outbound connections
        connect_addr: Option<SocketAddr>,
    },
    ConnectFailed {
        peer: PeerId,
        endpoint: SocketAddr,
        transport: Transport,
    },
    Closed {
        conn: ConnectionId,
    },
    /// One complete control frame
    Packet {
        conn: ConnectionId,
        bytes: Vec<u8>,
    },
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors a provider reports when it cannot even start an operation
#[derive(Debug)]
pub enum ProviderError {
    /// Transport not offered by this provider
    Unsupported(Transport),
    /// Bound socket handle is unknown or already consumed
    UnknownSocket(LocalSocketId),
    /// OS-level failure
    Io(std::io::Error),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Unsupported(transport) => {
                write!(f, "transport {} not supported", transport)
            }
            ProviderError::UnknownSocket(id) => write!(f, "unknown bound socket {}", id.0),
            ProviderError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ProviderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProviderError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProviderError {
    fn from(e: std::io::Error) -> Self {
        ProviderError::Io(e)
    }
}
