//! Node configuration: identity, roster and manager tunables
//!
//! Loaded from an optional JSON file and then overridden by command line
//! flags. A minimal file looks like:
//!
//! ```json
//! {
//!   "id": 2,
//!   "name": "bob",
//!   "listen": "0.0.0.0:7402",
//!   "peers": [
//!     { "id": 0, "name": "host", "addresses": ["192.0.2.10:7400"] },
//!     { "id": 3, "name": "carol" }
//!   ],
//!   "mesh": { "retry_interval_ms": 3000 }
//! }
//! ```

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use peer_mesh::{ConfigError, MeshConfig, PeerDescriptor, PeerId};
use serde::Deserialize;

/// One remote participant from the roster
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PeerEntry {
    pub id: PeerId,
    pub name: String,
    /// Known TCP endpoints of the peer
    #[serde(default)]
    pub addresses: Vec<SocketAddr>,
    #[serde(default)]
    pub observer: bool,
}

impl PeerEntry {
    pub fn descriptor(&self) -> PeerDescriptor {
        let mut descriptor = PeerDescriptor::new(self.id, self.name.clone());
        descriptor.observer = self.observer;
        descriptor
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub id: Option<PeerId>,
    pub name: Option<String>,
    /// TCP listening endpoint
    pub listen: Option<SocketAddr>,
    /// Our endpoint as seen by a rendezvous service
    pub rendezvous: Option<SocketAddr>,
    pub peers: Vec<PeerEntry>,
    /// Seconds between demo broadcasts; none when unset
    pub send_interval_secs: Option<u64>,
    /// Stop after this many seconds; run until signalled when unset
    pub run_for_secs: Option<u64>,
    pub mesh: MeshConfig,
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, NodeConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| NodeConfigError::Io(path.display().to_string(), e))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, NodeConfigError> {
        serde_json::from_str(text).map_err(|e| NodeConfigError::Json(e.to_string()))
    }

    /// Apply command line flags on top of the loaded values
    pub fn apply_args(&mut self, args: &[String]) -> Result<(), NodeConfigError> {
        if let Some(id) = parse_arg(args, "--id") {
            self.id = Some(parse_value("--id", &id)?);
        }
        if let Some(name) = parse_arg(args, "--name") {
            self.name = Some(name);
        }
        if let Some(listen) = parse_arg(args, "--listen") {
            self.listen = Some(parse_value("--listen", &listen)?);
        }
        if let Some(rendezvous) = parse_arg(args, "--rendezvous") {
            self.rendezvous = Some(parse_value("--rendezvous", &rendezvous)?);
        }
        if let Some(secs) = parse_arg(args, "--send-interval") {
            self.send_interval_secs = Some(parse_value("--send-interval", &secs)?);
        }
        if let Some(secs) = parse_arg(args, "--run-for") {
            self.run_for_secs = Some(parse_value("--run-for", &secs)?);
        }
        for spec in parse_all_args(args, "--peer") {
            let entry = parse_peer(&spec)?;
            match self.peers.iter_mut().find(|p| p.id == entry.id) {
                Some(existing) => {
                    existing.name = entry.name;
                    for addr in entry.addresses {
                        if !existing.addresses.contains(&addr) {
                            existing.addresses.push(addr);
                        }
                    }
                }
                None => self.peers.push(entry),
            }
        }
        if let Some(listen) = self.listen {
            self.mesh.tcp_port = listen.port();
        }
        Ok(())
    }

    /// Check identity and roster; returns the local id
    pub fn validate(&self) -> Result<PeerId, NodeConfigError> {
        let id = self.id.ok_or(NodeConfigError::MissingId)?;
        self.mesh.validate().map_err(NodeConfigError::Mesh)?;

        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.id == id {
                return Err(NodeConfigError::PeerIsLocal(id));
            }
            if !seen.insert(peer.id) {
                return Err(NodeConfigError::DuplicatePeer(peer.id));
            }
        }
        Ok(id)
    }

    pub fn local_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("node-{}", self.id.unwrap_or_default()),
        }
    }
}

pub fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Values of a repeatable flag, in order
fn parse_all_args(args: &[String], flag: &str) -> Vec<String> {
    args.windows(2)
        .filter(|w| w[0] == flag)
        .map(|w| w[1].clone())
        .collect()
}

fn parse_value<T: std::str::FromStr>(flag: &'static str, value: &str) -> Result<T, NodeConfigError> {
    value
        .parse()
        .map_err(|_| NodeConfigError::InvalidArg(flag, value.to_string()))
}

/// Parse `<id>=<name>[@<addr:port>]`
pub fn parse_peer(spec: &str) -> Result<PeerEntry, NodeConfigError> {
    let invalid = || NodeConfigError::InvalidArg("--peer", spec.to_string());

    let (id, rest) = spec.split_once('=').ok_or_else(invalid)?;
    let id: PeerId = id.trim().parse().map_err(|_| invalid())?;

    let (name, addresses) = match rest.split_once('@') {
        Some((name, addr)) => (name, vec![addr.parse().map_err(|_| invalid())?]),
        None => (rest, Vec::new()),
    };
    if name.is_empty() {
        return Err(invalid());
    }

    Ok(PeerEntry {
        id,
        name: name.to_string(),
        addresses,
        observer: false,
    })
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug)]
pub enum NodeConfigError {
    Io(String, std::io::Error),
    Json(String),
    /// Flag name and the rejected value
    InvalidArg(&'static str, String),
    MissingId,
    PeerIsLocal(PeerId),
    DuplicatePeer(PeerId),
    Mesh(ConfigError),
}

impl fmt::Display for NodeConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeConfigError::Io(path, e) => write!(f, "cannot read {}: {}", path, e),
            NodeConfigError::Json(e) => write!(f, "invalid config file: {}", e),
            NodeConfigError::InvalidArg(flag, value) => write!(f, "invalid value for {}: {}", flag, value),
            NodeConfigError::MissingId => write!(f, "no participant id given (--id)"),
            NodeConfigError::PeerIsLocal(id) => write!(f, "roster lists the local id {}", id),
            NodeConfigError::DuplicatePeer(id) => write!(f, "peer {} listed twice", id),
            NodeConfigError::Mesh(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for NodeConfigError {}
