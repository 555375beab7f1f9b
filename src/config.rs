//! Gateway configuration.
//!
//! All settings have defaults matching the behaviour of a radio gateway in the
//! field (150-byte chunks, ten minute idle window, five submission attempts
//! twenty seconds apart). A JSON file only needs to name what differs:
//!
//! ```json
//! {
//!   "node_id": 555555555,
//!   "backhaul": { "connect": "10.0.0.2:7400" },
//!   "routes": [
//!     { "listen": "127.0.0.1:8333", "peer": 444444444, "host": "127.0.0.1", "port": 8333 }
//!   ],
//!   "stats_port": 8080
//! }
//! ```
//!
//! Durations are stored in milliseconds and exposed as [`Duration`]s.

use crate::codec::{max_segment_len, DEFAULT_CHUNK_SIZE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

/// Default size of a single local socket read.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 6000;

/// Default maximum radio payload in bytes.
pub const DEFAULT_MAX_PAYLOAD: usize = 236;

/// Tunnel tuning parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Payload bytes per segment.
    pub chunk_size: usize,
    /// Size of one local socket read.
    pub read_buffer_size: usize,
    /// Read timeout of the local socket; also the idle polling period.
    pub poll_interval_ms: u64,
    /// Tunnel is closed after this long without traffic in either direction.
    pub idle_timeout_ms: u64,
    /// Connection resets tolerated on the local socket before giving up.
    pub max_reset_retries: u32,
    /// Timeout for opening the local connection.
    pub connect_timeout_ms: u64,
    /// Timeout for a single local socket write.
    pub write_timeout_ms: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            poll_interval_ms: 1_000,
            idle_timeout_ms: 600_000,
            max_reset_retries: 10,
            connect_timeout_ms: 10_000,
            write_timeout_ms: 30_000,
        }
    }
}

impl TunnelConfig {
    /// Local socket read timeout.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Idle window.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Local connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Local write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("tunnel.chunk_size must be > 0"));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("tunnel.read_buffer_size must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("tunnel.poll_interval_ms must be > 0"));
        }
        if self.idle_timeout_ms < self.poll_interval_ms {
            return Err(ConfigError::Invalid(
                "tunnel.idle_timeout_ms must be >= tunnel.poll_interval_ms",
            ));
        }
        if self.connect_timeout_ms == 0 || self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid("tunnel socket timeouts must be > 0"));
        }
        Ok(())
    }
}

/// Submission retry policy.
///
/// Applies to sends the radio refused to accept. A send that was accepted
/// but never confirmed is not retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total submission attempts per segment.
    pub max_attempts: u32,
    /// Fixed delay between attempts.
    pub backoff_ms: u64,
    /// How often a waiting sender re-checks for cancellation.
    pub slot_poll_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_ms: 20_000,
            slot_poll_ms: 1_000,
        }
    }
}

impl RetryPolicy {
    /// Delay between attempts.
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }

    /// Send slot polling period.
    pub fn slot_poll(&self) -> Duration {
        Duration::from_millis(self.slot_poll_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("retry.max_attempts must be > 0"));
        }
        if self.max_attempts > 20 {
            return Err(ConfigError::Invalid("retry.max_attempts must be <= 20"));
        }
        if self.slot_poll_ms == 0 {
            return Err(ConfigError::Invalid("retry.slot_poll_ms must be > 0"));
        }
        Ok(())
    }
}

/// Delivery tracker settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// A pending send without completion is evicted after this long.
    pub completion_timeout_ms: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            completion_timeout_ms: 120_000,
        }
    }
}

impl TrackerConfig {
    /// Completion timeout.
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.completion_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "tracker.completion_timeout_ms must be > 0",
            ));
        }
        Ok(())
    }
}

/// TCP backhaul standing in for the radio between two gateways.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackhaulConfig {
    /// Wait for the peer gateway on this address.
    pub listen: Option<String>,
    /// Connect to the peer gateway at this address.
    pub connect: Option<String>,
    /// Largest message the link accepts.
    pub max_payload: usize,
    /// A message without acknowledgement after this long is unconfirmed.
    pub ack_timeout_ms: u64,
    /// Timeout for connecting to the peer gateway.
    pub connect_timeout_ms: u64,
}

impl Default for BackhaulConfig {
    fn default() -> Self {
        Self {
            listen: None,
            connect: None,
            max_payload: DEFAULT_MAX_PAYLOAD,
            ack_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl BackhaulConfig {
    /// Acknowledgement timeout.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// Connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match (&self.listen, &self.connect) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(
                    "backhaul needs either listen or connect, not both",
                ))
            }
            (None, None) => {
                return Err(ConfigError::Invalid("backhaul needs listen or connect"))
            }
            _ => {}
        }
        if self.max_payload == 0 || self.max_payload > u16::MAX as usize - 64 {
            return Err(ConfigError::Invalid("backhaul.max_payload out of range"));
        }
        if self.ack_timeout_ms == 0 || self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid("backhaul timeouts must be > 0"));
        }
        Ok(())
    }
}

/// A local listener whose clients are tunnelled to a fixed destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRoute {
    /// Local address to accept clients on.
    pub listen: String,
    /// Radio identity of the gateway that opens the destination.
    pub peer: u64,
    /// Destination host, as seen from the peer gateway.
    pub host: String,
    /// Destination port.
    pub port: u16,
}

impl IngressRoute {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.is_empty() {
            return Err(ConfigError::Invalid("route.host must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::Invalid("route.port must be > 0"));
        }
        Ok(())
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Radio identity of this gateway.
    pub node_id: u64,
    /// Tunnel tuning.
    pub tunnel: TunnelConfig,
    /// Submission retries.
    pub retry: RetryPolicy,
    /// Delivery tracker.
    pub tracker: TrackerConfig,
    /// Link to the peer gateway.
    pub backhaul: BackhaulConfig,
    /// Local listeners (initiator side).
    pub routes: Vec<IngressRoute>,
    /// Port of the HTTP stats endpoint, disabled when absent.
    pub stats_port: Option<u16>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            tunnel: TunnelConfig::default(),
            retry: RetryPolicy::default(),
            tracker: TrackerConfig::default(),
            backhaul: BackhaulConfig::default(),
            routes: Vec::new(),
            stats_port: None,
        }
    }
}

impl GatewayConfig {
    /// Parse a configuration from JSON text and validate it.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node_id == 0 {
            return Err(ConfigError::Invalid("node_id must be > 0"));
        }
        self.tunnel.validate()?;
        self.retry.validate()?;
        self.tracker.validate()?;
        self.backhaul.validate()?;
        let segment_len = max_segment_len(self.tunnel.chunk_size)
            .map_err(|_| ConfigError::Invalid("tunnel.chunk_size cannot be encoded"))?;
        if segment_len > self.backhaul.max_payload {
            return Err(ConfigError::Invalid(
                "an encoded tunnel.chunk_size segment must fit in backhaul.max_payload",
            ));
        }
        for route in &self.routes {
            route.validate()?;
        }
        Ok(())
    }
}

/// Configuration errors.
#[derive(Debug)]
pub enum ConfigError {
    /// Reading the configuration file failed.
    Io(io::Error),
    /// The file is not valid JSON for this schema.
    Parse(serde_json::Error),
    /// A value is out of range.
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "cannot read configuration: {}", e),
            Self::Parse(e) => write!(f, "cannot parse configuration: {}", e),
            Self::Invalid(msg) => write!(f, "invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
