//! TCP connection provider on a mio event loop
//!
//! Each TCP stream is one mio token, and a link's `ConnectionId` is its
//! token value. A stream only becomes a connection for the manager after
//! both ends exchanged `Hello`, so every `Connected` event names the peer.
//!
//! ```text
//! outbound: Connecting ──writable──► Handshake ──Hello──► Open
//! inbound:                accept ──► Handshake ──Hello──► Open
//! ```
//!
//! Simultaneous-open sockets are created with socket2 so they can be bound
//! before the connect and handed to mio afterwards.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use peer_mesh::{
    BoundSocket, ConnectionId, ConnectionProvider, LocalSocketId, PeerId, ProviderError, ProviderEvent,
    Transport,
};
use socket2::{Domain, Protocol, Socket, Type};

use crate::link::{drain_frames, LinkFrame};
use crate::metrics::Metrics;

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

/// Interval between round-trip pings on an open link
const PING_INTERVAL: Duration = Duration::from_secs(2);

/// Unsent bytes a link may buffer before sends are refused
const MAX_OUTBOX: usize = 1 << 20;

// ============================================================================
// Links
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    /// TCP handshake of an outbound connect in progress
    Connecting { peer: PeerId, endpoint: SocketAddr },
    /// Waiting for the other side's `Hello`
    Handshake {
        expected: Option<PeerId>,
        connect_addr: Option<SocketAddr>,
    },
    Open { peer: PeerId },
}

struct Link {
    stream: TcpStream,
    remote: SocketAddr,
    state: LinkState,
    inbox: Vec<u8>,
    outbox: Vec<u8>,
    ping_seq: u32,
    ping_outstanding: Option<(u32, Instant)>,
    last_ping: Option<Instant>,
    rtt: Option<Duration>,
}

impl Link {
    fn new(stream: TcpStream, remote: SocketAddr, state: LinkState) -> Self {
        Link {
            stream,
            remote,
            state,
            inbox: Vec::new(),
            outbox: Vec::new(),
            ping_seq: 0,
            ping_outstanding: None,
            last_ping: None,
            rtt: None,
        }
    }

    fn queue(&mut self, frame: &LinkFrame) -> bool {
        match frame.encode() {
            Ok(bytes) if self.outbox.len() + bytes.len() <= MAX_OUTBOX => {
                self.outbox.extend_from_slice(&bytes);
                true
            }
            Ok(_) => {
                log::debug!("Outbox to {} full", self.remote);
                false
            }
            Err(e) => {
                log::warn!("Failed to encode link frame: {}", e);
                false
            }
        }
    }

    /// Write as much of the outbox as the socket takes
    fn flush(&mut self) -> io::Result<()> {
        if matches!(self.state, LinkState::Connecting { .. }) {
            return Ok(());
        }
        while !self.outbox.is_empty() {
            match self.stream.write(&self.outbox) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.outbox.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

enum ConnectProgress {
    Pending,
    Done,
    Failed(io::Error),
}

/// Check a non-blocking connect after a writable event
fn connect_progress(stream: &TcpStream) -> ConnectProgress {
    if let Ok(Some(e)) | Err(e) = stream.take_error() {
        return ConnectProgress::Failed(e);
    }
    match stream.peer_addr() {
        Ok(_) => ConnectProgress::Done,
        Err(e) if e.kind() == io::ErrorKind::NotConnected => ConnectProgress::Pending,
        Err(e) => ConnectProgress::Failed(e),
    }
}

fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == Some(libc::EINPROGRESS)
}

fn conn_id(token: Token) -> ConnectionId {
    ConnectionId(token.0 as u64)
}

fn token_of(conn: ConnectionId) -> Token {
    Token(conn.0 as usize)
}

// ============================================================================
// Provider
// ============================================================================

pub struct MioProvider {
    poll: Poll,
    events: Events,
    local_id: PeerId,
    listener: Option<TcpListener>,
    links: HashMap<Token, Link>,
    /// Bound simultaneous-open sockets not yet connected
    bound: HashMap<LocalSocketId, Socket>,
    next_token: usize,
    next_socket: u64,
    queue: VecDeque<ProviderEvent>,
    recv_buf: Vec<u8>,
    metrics: Arc<Metrics>,
}

impl MioProvider {
    pub fn new(local_id: PeerId, metrics: Arc<Metrics>) -> io::Result<Self> {
        Ok(MioProvider {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            local_id,
            listener: None,
            links: HashMap::new(),
            bound: HashMap::new(),
            next_token: 1,
            next_socket: 1,
            queue: VecDeque::new(),
            recv_buf: vec![0u8; 65535],
            metrics,
        })
    }

    /// Accept peer connections on `addr`; returns the bound address
    pub fn listen(&mut self, addr: SocketAddr) -> io::Result<SocketAddr> {
        let mut listener = TcpListener::bind(addr)?;
        self.poll
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local = listener.local_addr()?;
        self.listener = Some(listener);
        Ok(local)
    }

    /// Next event for the connection manager
    pub fn poll_event(&mut self) -> Option<ProviderEvent> {
        self.queue.pop_front()
    }

    /// Number of streams, pending ones included
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Wait for socket readiness and process it
    pub fn poll(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(()),
            Err(e) => return Err(e),
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| {
                (
                    e.token(),
                    e.is_readable() || e.is_read_closed() || e.is_error(),
                    e.is_writable() || e.is_error(),
                )
            })
            .collect();

        for (token, readable, writable) in ready {
            if token == LISTENER_TOKEN {
                self.accept_all();
                continue;
            }
            if writable {
                self.on_writable(token);
            }
            if readable {
                self.on_readable(token);
            }
        }
        Ok(())
    }

    /// Send round-trip pings on open links
    pub fn service(&mut self, now: Instant) {
        let mut failed = Vec::new();

        for (token, link) in self.links.iter_mut() {
            if !matches!(link.state, LinkState::Open { .. }) {
                continue;
            }
            let due = link.last_ping.map_or(true, |t| now.duration_since(t) >= PING_INTERVAL);
            if !due {
                continue;
            }
            let seq = link.ping_seq.wrapping_add(1);
            link.ping_seq = seq;
            if link.queue(&LinkFrame::Ping { seq }) {
                link.ping_outstanding = Some((seq, now));
            }
            link.last_ping = Some(now);
            if let Err(e) = link.flush() {
                failed.push((*token, e));
            }
        }

        for (token, e) in failed {
            self.fail_link(token, &e.to_string());
        }
    }

    fn add_link(&mut self, mut stream: TcpStream, remote: SocketAddr, state: LinkState) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        self.links.insert(token, Link::new(stream, remote, state));
        Ok(token)
    }

    fn drop_link(&mut self, token: Token) -> Option<Link> {
        let mut link = self.links.remove(&token)?;
        if let Err(e) = self.poll.registry().deregister(&mut link.stream) {
            log::debug!("Deregistering {} failed: {}", link.remote, e);
        }
        Some(link)
    }

    /// Tear down a link that broke and tell the manager
    fn fail_link(&mut self, token: Token, reason: &str) {
        let Some(link) = self.drop_link(token) else {
            return;
        };
        match link.state {
            LinkState::Open { peer } => {
                log::info!("Link to peer {} ({}) closed: {}", peer, link.remote, reason);
                Metrics::incr(&self.metrics.connections_closed_total);
                self.queue.push_back(ProviderEvent::Closed { conn: conn_id(token) });
            }
            LinkState::Connecting { peer, endpoint }
            | LinkState::Handshake {
                expected: Some(peer),
                connect_addr: Some(endpoint),
            } => {
                log::debug!("Connecting peer {} at {} failed: {}", peer, endpoint, reason);
                Metrics::incr(&self.metrics.connect_failures_total);
                self.queue.push_back(ProviderEvent::ConnectFailed {
                    peer,
                    endpoint,
                    transport: Transport::Tcp,
                });
            }
            LinkState::Handshake { .. } => {
                log::debug!("Dropping unidentified link from {}: {}", link.remote, reason);
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((stream, remote)) => {
                    let state = LinkState::Handshake {
                        expected: None,
                        connect_addr: None,
                    };
                    match self.add_link(stream, remote, state) {
                        Ok(token) => {
                            log::debug!("Accepted link from {}", remote);
                            let hello = LinkFrame::Hello { peer: self.local_id };
                            if let Some(link) = self.links.get_mut(&token) {
                                link.queue(&hello);
                            }
                        }
                        Err(e) => log::warn!("Failed to register link from {}: {}", remote, e),
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    log::warn!("Accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn on_writable(&mut self, token: Token) {
        let local_id = self.local_id;
        let Some(link) = self.links.get_mut(&token) else {
            return;
        };

        if let LinkState::Connecting { peer, endpoint } = link.state {
            match connect_progress(&link.stream) {
                ConnectProgress::Pending => return,
                ConnectProgress::Done => {
                    log::debug!("TCP connected to {} for peer {}", endpoint, peer);
                    link.state = LinkState::Handshake {
                        expected: Some(peer),
                        connect_addr: Some(endpoint),
                    };
                    link.queue(&LinkFrame::Hello { peer: local_id });
                }
                ConnectProgress::Failed(e) => {
                    self.fail_link(token, &e.to_string());
                    return;
                }
            }
        }

        if let Err(e) = link.flush() {
            self.fail_link(token, &e.to_string());
        }
    }

    fn on_readable(&mut self, token: Token) {
        let mut closed: Option<String> = None;
        {
            let Some(link) = self.links.get_mut(&token) else {
                return;
            };
            if matches!(link.state, LinkState::Connecting { .. }) {
                return;
            }
            loop {
                match link.stream.read(&mut self.recv_buf) {
                    Ok(0) => {
                        closed = Some("closed by peer".to_string());
                        break;
                    }
                    Ok(n) => link.inbox.extend_from_slice(&self.recv_buf[..n]),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        closed = Some(e.to_string());
                        break;
                    }
                }
            }
        }

        self.process_inbox(token);

        if let Some(reason) = closed {
            self.fail_link(token, &reason);
        }
    }

    fn process_inbox(&mut self, token: Token) {
        let Some(link) = self.links.get_mut(&token) else {
            return;
        };
        let drained = drain_frames(&mut link.inbox);

        for frame in drained.frames {
            self.on_frame(token, frame);
            if !self.links.contains_key(&token) {
                return;
            }
        }

        if let Some(e) = drained.error {
            log::warn!("Malformed frame on {}: {}", conn_id(token), e);
            self.fail_link(token, "malformed frame");
            return;
        }

        if let Some(link) = self.links.get_mut(&token) {
            if let Err(e) = link.flush() {
                self.fail_link(token, &e.to_string());
            }
        }
    }

    fn on_frame(&mut self, token: Token, frame: LinkFrame) {
        let Some(link) = self.links.get_mut(&token) else {
            return;
        };

        match (link.state, frame) {
            (
                LinkState::Handshake {
                    expected,
                    connect_addr,
                },
                LinkFrame::Hello { peer },
            ) => {
                if expected.is_some_and(|e| e != peer) || peer == self.local_id {
                    log::warn!("Unexpected hello from peer {} at {}", peer, link.remote);
                    self.fail_link(token, "peer id mismatch");
                    return;
                }
                link.state = LinkState::Open { peer };
                log::trace!("Link {} open to peer {}", conn_id(token), peer);
                Metrics::incr(&self.metrics.connections_established_total);
                self.queue.push_back(ProviderEvent::Connected {
                    conn: conn_id(token),
                    peer,
                    transport: Transport::Tcp,
                    remote: link.remote,
                    connect_addr,
                });
            }
            (LinkState::Handshake { .. }, _) => {
                self.fail_link(token, "frame before hello");
            }
            (LinkState::Open { .. }, LinkFrame::Ping { seq }) => {
                link.queue(&LinkFrame::Pong { seq });
            }
            (LinkState::Open { .. }, LinkFrame::Pong { seq }) => {
                if let Some((sent, at)) = link.ping_outstanding {
                    if sent == seq {
                        link.rtt = Some(at.elapsed());
                        link.ping_outstanding = None;
                    }
                }
            }
            (LinkState::Open { .. }, LinkFrame::Data(bytes)) => {
                Metrics::incr(&self.metrics.frames_received_total);
                self.queue.push_back(ProviderEvent::Packet {
                    conn: conn_id(token),
                    bytes,
                });
            }
            (LinkState::Open { peer }, LinkFrame::Hello { .. }) => {
                log::debug!("Ignoring repeated hello from peer {}", peer);
            }
            (LinkState::Connecting { .. }, _) => {}
        }
    }
}

impl ConnectionProvider for MioProvider {
    fn supports(&self, transport: Transport) -> bool {
        transport == Transport::Tcp
    }

    fn connect(
        &mut self,
        endpoint: SocketAddr,
        transport: Transport,
        peer: PeerId,
    ) -> Result<(), ProviderError> {
        if transport != Transport::Tcp {
            return Err(ProviderError::Unsupported(transport));
        }
        let stream = TcpStream::connect(endpoint)?;
        self.add_link(stream, endpoint, LinkState::Connecting { peer, endpoint })?;
        Metrics::incr(&self.metrics.connect_attempts_total);
        Ok(())
    }

    fn bind_local(
        &mut self,
        transport: Transport,
        addr: SocketAddr,
    ) -> Result<BoundSocket, ProviderError> {
        if transport != Transport::Tcp {
            return Err(ProviderError::Unsupported(transport));
        }
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        if addr.is_ipv6() {
            socket.set_only_v6(true)?;
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;

        let local = socket.local_addr()?.as_socket().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "bound socket has no IP address")
        })?;

        let id = LocalSocketId(self.next_socket);
        self.next_socket += 1;
        self.bound.insert(id, socket);
        log::debug!("Bound simultaneous-open socket {}", local);
        Ok(BoundSocket { id, local })
    }

    fn connect_bound(
        &mut self,
        socket: LocalSocketId,
        endpoint: SocketAddr,
        peer: PeerId,
    ) -> Result<(), ProviderError> {
        let bound = self
            .bound
            .remove(&socket)
            .ok_or(ProviderError::UnknownSocket(socket))?;
        match bound.connect(&endpoint.into()) {
            Ok(()) => {}
            Err(e) if connect_in_progress(&e) => {}
            Err(e) => return Err(e.into()),
        }
        let stream = TcpStream::from_std(std::net::TcpStream::from(bound));
        self.add_link(stream, endpoint, LinkState::Connecting { peer, endpoint })?;
        Metrics::incr(&self.metrics.connect_attempts_total);
        Ok(())
    }

    fn release_bound(&mut self, socket: LocalSocketId) {
        self.bound.remove(&socket);
    }

    fn send(&mut self, conn: ConnectionId, bytes: &[u8]) -> bool {
        let token = token_of(conn);
        let Some(link) = self.links.get_mut(&token) else {
            return false;
        };
        if !matches!(link.state, LinkState::Open { .. }) {
            return false;
        }
        if !link.queue(&LinkFrame::Data(bytes.to_vec())) {
            return false;
        }
        if let Err(e) = link.flush() {
            self.fail_link(token, &e.to_string());
            return false;
        }
        Metrics::incr(&self.metrics.frames_sent_total);
        true
    }

    fn close(&mut self, conn: ConnectionId) {
        if let Some(link) = self.drop_link(token_of(conn)) {
            log::debug!("Closed {} to {}", conn, link.remote);
        }
    }

    fn round_trip(&self, conn: ConnectionId) -> Option<Duration> {
        self.links.get(&token_of(conn)).and_then(|l| l.rtt)
    }

    fn remote_endpoint(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.links.get(&token_of(conn)).map(|l| l.remote)
    }
}
