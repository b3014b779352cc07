//! Lightweight Prometheus-compatible counters for a mesh node.
//!
//! Atomic counters shared between the provider and the event loop. Rendered
//! in Prometheus text exposition format when the node shuts down and on
//! request in debug logs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

pub struct Metrics {
    /// Outbound connects started, plain and simultaneous-open (counter)
    pub connect_attempts_total: AtomicU64,
    /// Outbound connects that failed before the hello exchange (counter)
    pub connect_failures_total: AtomicU64,
    /// Links that completed the hello exchange (counter)
    pub connections_established_total: AtomicU64,
    /// Links closed by the remote side or by an I/O error (counter)
    pub connections_closed_total: AtomicU64,
    /// Control frames written to links (counter)
    pub frames_sent_total: AtomicU64,
    /// Control frames read from links (counter)
    pub frames_received_total: AtomicU64,
    /// Payloads handed to the message layer (counter)
    pub deliveries_total: AtomicU64,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connect_attempts_total: AtomicU64::new(0),
            connect_failures_total: AtomicU64::new(0),
            connections_established_total: AtomicU64::new(0),
            connections_closed_total: AtomicU64::new(0),
            frames_sent_total: AtomicU64::new(0),
            frames_received_total: AtomicU64::new(0),
            deliveries_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let uptime = self.start_time.elapsed().as_secs();
        format!(
            "# HELP mesh_node_connect_attempts_total Outbound connects started\n\
             # TYPE mesh_node_connect_attempts_total counter\n\
             mesh_node_connect_attempts_total {}\n\
             # HELP mesh_node_connect_failures_total Outbound connects that failed\n\
             # TYPE mesh_node_connect_failures_total counter\n\
             mesh_node_connect_failures_total {}\n\
             # HELP mesh_node_connections_established_total Peer links established\n\
             # TYPE mesh_node_connections_established_total counter\n\
             mesh_node_connections_established_total {}\n\
             # HELP mesh_node_connections_closed_total Peer links closed\n\
             # TYPE mesh_node_connections_closed_total counter\n\
             mesh_node_connections_closed_total {}\n\
             # HELP mesh_node_frames_sent_total Control frames sent\n\
             # TYPE mesh_node_frames_sent_total counter\n\
             mesh_node_frames_sent_total {}\n\
             # HELP mesh_node_frames_received_total Control frames received\n\
             # TYPE mesh_node_frames_received_total counter\n\
             mesh_node_frames_received_total {}\n\
             # HELP mesh_node_deliveries_total Payloads delivered to the message layer\n\
             # TYPE mesh_node_deliveries_total counter\n\
             mesh_node_deliveries_total {}\n\
             # HELP mesh_node_uptime_seconds Node uptime in seconds\n\
             # TYPE mesh_node_uptime_seconds gauge\n\
             mesh_node_uptime_seconds {}\n",
            self.connect_attempts_total.load(Ordering::Relaxed),
            self.connect_failures_total.load(Ordering::Relaxed),
            self.connections_established_total.load(Ordering::Relaxed),
            self.connections_closed_total.load(Ordering::Relaxed),
            self.frames_sent_total.load(Ordering::Relaxed),
            self.frames_received_total.load(Ordering::Relaxed),
            self.deliveries_total.load(Ordering::Relaxed),
            uptime,
        )
    }
}
