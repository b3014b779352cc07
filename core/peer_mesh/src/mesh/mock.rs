//! Recording provider for unit tests

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Duration;

use super::address::Transport;
use super::control::{decode_packet, ControlPacket};
use super::peer::PeerId;
use super::provider::{BoundSocket, ConnectionId, ConnectionProvider, LocalSocketId, ProviderError};

#[derive(Debug)]
pub(crate) struct MockProvider {
    pub transports: Vec<Transport>,
    pub connects: Vec<(SocketAddr, Transport, PeerId)>,
    pub binds: Vec<(Transport, SocketAddr)>,
    pub bound_connects: Vec<(LocalSocketId, SocketAddr, PeerId)>,
    pub released: Vec<LocalSocketId>,
    pub sent: Vec<(ConnectionId, Vec<u8>)>,
    pub closed: Vec<ConnectionId>,
    pub rtt: Option<Duration>,
    pub remotes: HashMap<ConnectionId, SocketAddr>,
    /// Endpoints whose connect fails to start (scope id included)
    pub unreachable: HashSet<SocketAddr>,
    /// Connections whose sends fail
    pub dead: HashSet<ConnectionId>,
    pub fail_bind: bool,
    next_socket: u64,
}

impl MockProvider {
    pub fn new(transports: &[Transport]) -> Self {
        Self {
            transports: transports.to_vec(),
            connects: Vec::new(),
            binds: Vec::new(),
            bound_connects: Vec::new(),
            released: Vec::new(),
            sent: Vec::new(),
            closed: Vec::new(),
            rtt: None,
            remotes: HashMap::new(),
            unreachable: HashSet::new(),
            dead: HashSet::new(),
            fail_bind: false,
            next_socket: 1,
        }
    }

    pub fn tcp() -> Self {
        Self::new(&[Transport::Tcp])
    }

    /// Control packets sent over one connection, in order
    pub fn packets_on(&self, conn: ConnectionId) -> Vec<ControlPacket> {
        self.sent
            .iter()
            .filter(|(c, _)| *c == conn)
            .filter_map(|(_, bytes)| decode_packet(bytes).ok())
            .collect()
    }

    pub fn clear(&mut self) {
        self.connects.clear();
        self.binds.clear();
        self.bound_connects.clear();
        self.released.clear();
        self.sent.clear();
        self.closed.clear();
    }
}

impl ConnectionProvider for MockProvider {
    fn supports(&self, transport: Transport) -> bool {
        self.transports.contains(&transport)
    }

    fn connect(
        &mut self,
        endpoint: SocketAddr,
        transport: Transport,
        peer: PeerId,
    ) -> Result<(), ProviderError> {
        if self.unreachable.contains(&endpoint) {
            return Err(ProviderError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "unreachable",
            )));
        }
        self.connects.push((endpoint, transport, peer));
        Ok(())
    }

    fn bind_local(
        &mut self,
        transport: Transport,
        addr: SocketAddr,
    ) -> Result<BoundSocket, ProviderError> {
        if self.fail_bind {
            return Err(ProviderError::Unsupported(transport));
        }
        self.binds.push((transport, addr));
        let id = LocalSocketId(self.next_socket);
        self.next_socket += 1;
        let mut local = addr;
        local.set_port(40000 + id.0 as u16);
        Ok(BoundSocket { id, local })
    }

    fn connect_bound(
        &mut self,
        socket: LocalSocketId,
        endpoint: SocketAddr,
        peer: PeerId,
    ) -> Result<(), ProviderError> {
        self.bound_connects.push((socket, endpoint, peer));
        Ok(())
    }

    fn release_bound(&mut self, socket: LocalSocketId) {
        self.released.push(socket);
    }

    fn send(&mut self, conn: ConnectionId, bytes: &[u8]) -> bool {
        if self.dead.contains(&conn) {
            return false;
        }
        self.sent.push((conn, bytes.to_vec()));
        true
    }

    fn close(&mut self, conn: ConnectionId) {
        self.closed.push(conn);
    }

    fn round_trip(&self, _conn: ConnectionId) -> Option<Duration> {
        self.rtt
    }

    fn remote_endpoint(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.remotes.get(&conn).copied()
    }
}
