//! TCP simultaneous-open socket state
//!
//! Both sides of a simultaneous open bind a TCP socket, tell each other the
//! bound endpoint and then connect from that socket to the other side's
//! endpoint at roughly the same time, so the SYNs cross inside the NATs.
//!
//! # State Machine
//!
//! ```text
//! Idle ──bind──► Bound ──offer received──► (connect now) ──► Idle
//!                  │
//!                  └──responder──► ConnectPending ──deadline──► Idle
//! ```
//!
//! The responder waits a short moment before connecting. That wait is a
//! deadline polled by the manager's tick, never a sleep.

use std::net::SocketAddr;
use std::time::Instant;

use super::provider::BoundSocket;

/// Simultaneous-open progress for one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SimultaneousOpen {
    /// No socket held
    #[default]
    Idle,
    /// Socket bound and offered, waiting for the peer's endpoint
    Bound { socket: BoundSocket },
    /// Socket bound, connect to `remote` once `at` has passed
    ConnectPending {
        socket: BoundSocket,
        remote: SocketAddr,
        at: Instant,
    },
}

impl SimultaneousOpen {
    pub fn is_idle(&self) -> bool {
        matches!(self, SimultaneousOpen::Idle)
    }

    /// Whether a bound socket is held in any state
    pub fn holds_socket(&self) -> bool {
        !self.is_idle()
    }

    pub fn socket(&self) -> Option<BoundSocket> {
        match self {
            SimultaneousOpen::Idle => None,
            SimultaneousOpen::Bound { socket } => Some(*socket),
            SimultaneousOpen::ConnectPending { socket, .. } => Some(*socket),
        }
    }

    /// Remember a freshly bound socket
    pub fn bound(&mut self, socket: BoundSocket) {
        *self = SimultaneousOpen::Bound { socket };
    }

    /// Delay the connect from the held socket until `at`
    ///
    /// A connect that is already pending keeps its deadline and only
    /// switches to the new remote endpoint. Returns false without a socket.
    pub fn schedule_connect(&mut self, remote: SocketAddr, at: Instant) -> bool {
        match *self {
            SimultaneousOpen::Idle => false,
            SimultaneousOpen::Bound { socket } => {
                *self = SimultaneousOpen::ConnectPending { socket, remote, at };
                true
            }
            SimultaneousOpen::ConnectPending { socket, at: due, .. } => {
                *self = SimultaneousOpen::ConnectPending {
                    socket,
                    remote,
                    at: due,
                };
                true
            }
        }
    }

    /// Deadline of a pending connect
    pub fn deadline(&self) -> Option<Instant> {
        match self {
            SimultaneousOpen::ConnectPending { at, .. } => Some(*at),
            _ => None,
        }
    }

    /// Take socket and target of a pending connect whose deadline passed
    pub fn take_due(&mut self, now: Instant) -> Option<(BoundSocket, SocketAddr)> {
        match *self {
            SimultaneousOpen::ConnectPending { socket, remote, at } if at <= now => {
                *self = SimultaneousOpen::Idle;
                Some((socket, remote))
            }
            _ => None,
        }
    }

    /// Give up the held socket, whatever the state
    pub fn take_socket(&mut self) -> Option<BoundSocket> {
        let socket = self.socket();
        *self = SimultaneousOpen::Idle;
        socket
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::provider::LocalSocketId;
    use std::time::Duration;

    fn socket() -> BoundSocket {
        BoundSocket {
            id: LocalSocketId(1),
            local: "[2001:db8::1]:40000".parse().unwrap(),
        }
    }

    #[test]
    fn test_idle_cannot_schedule() {
        let mut state = SimultaneousOpen::default();
        assert!(!state.schedule_connect("[2001:db8::2]:1".parse().unwrap(), Instant::now()));
        assert!(state.is_idle());
        assert!(state.take_socket().is_none());
    }

    #[test]
    fn test_pending_connect_fires_at_deadline() {
        let now = Instant::now();
        let remote: SocketAddr = "[2001:db8::2]:40001".parse().unwrap();
        let mut state = SimultaneousOpen::default();
        state.bound(socket());
        assert!(state.schedule_connect(remote, now + Duration::from_millis(5)));

        assert_eq!(state.deadline(), Some(now + Duration::from_millis(5)));
        assert!(state.take_due(now).is_none());
        assert_eq!(
            state.take_due(now + Duration::from_millis(5)),
            Some((socket(), remote))
        );
        assert!(state.is_idle());
    }

    #[test]
    fn test_repeated_offer_replaces_target_keeps_deadline() {
        let now = Instant::now();
        let mut state = SimultaneousOpen::default();
        state.bound(socket());
        state.schedule_connect("[2001:db8::2]:1".parse().unwrap(), now + Duration::from_millis(8));
        state.schedule_connect("[2001:db8::2]:2".parse().unwrap(), now + Duration::from_millis(20));

        let (_, remote) = state.take_due(now + Duration::from_millis(8)).unwrap();
        assert_eq!(remote.port(), 2);
    }

    #[test]
    fn test_take_socket_releases_any_state() {
        let mut state = SimultaneousOpen::default();
        state.bound(socket());
        assert!(state.holds_socket());
        assert_eq!(state.take_socket(), Some(socket()));
        assert!(!state.holds_socket());
    }
}
