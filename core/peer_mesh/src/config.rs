//! Connection manager tunables
//!
//! All values have defaults matching the behaviour of a regular session, so
//! an empty JSON object (or `MeshConfig::default()`) is a valid configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Defaults
// ============================================================================

/// Attempts per candidate before the scheduler stops preferring it
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;

/// Interval between connection attempts for one peer
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 6_000;

/// Re-check interval for peers that are already connected
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 10_000;

/// Upper bound for the responder's simultaneous-open delay
pub const DEFAULT_SIM_OPEN_MAX_DELAY_MS: u64 = 10;

// ============================================================================
// Config
// ============================================================================

/// Connection manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Configured TCP listening port (0 = TCP not offered)
    pub tcp_port: u16,
    /// Configured UDP listening port (0 = UDP not offered)
    pub udp_port: u16,
    /// Retry cap per candidate
    pub connect_attempts: u32,
    /// Milliseconds between attempts for one peer
    pub retry_interval_ms: u64,
    /// Milliseconds between liveness re-checks of connected peers
    pub heartbeat_interval_ms: u64,
    /// Maximum responder delay in a simultaneous open
    pub sim_open_max_delay_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            tcp_port: 0,
            udp_port: 0,
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            sim_open_max_delay_ms: DEFAULT_SIM_OPEN_MAX_DELAY_MS,
        }
    }
}

impl MeshConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn sim_open_max_delay(&self) -> Duration {
        Duration::from_millis(self.sim_open_max_delay_ms)
    }

    /// Reject values that would make the scheduler spin
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("retry_interval_ms"));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::ZeroInterval("heartbeat_interval_ms"));
        }
        if self.sim_open_max_delay_ms > 1_000 {
            return Err(ConfigError::DelayTooLarge(self.sim_open_max_delay_ms));
        }
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Invalid configuration values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An interval that must be positive is zero
    ZeroInterval(&'static str),
    /// Simultaneous-open delay above one second
    DelayTooLarge(u64),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ZeroInterval(field) => write!(f, "{} must be greater than zero", field),
            ConfigError::DelayTooLarge(ms) => {
                write!(f, "sim_open_max_delay_ms too large: {} (max 1000)", ms)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
