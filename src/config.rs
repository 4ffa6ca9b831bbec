//! Server configuration
//!
//! All fields have defaults, so an empty JSON object (or no file at all)
//! yields a working server on port 5000.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ChatError;

/// Default listening port
pub const DEFAULT_PORT: u16 = 5000;

/// Default maximum bytes per delivered line
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024;

/// Default per-connection outbound queue depth
pub const DEFAULT_OUTBOUND_QUEUE: usize = 64;

/// Default time a closing connection gets to flush its queued lines
pub const DEFAULT_CLOSE_TIMEOUT_SECS: u64 = 5;

/// Runtime settings for a `ChatServer`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Interface to listen on
    pub host: IpAddr,
    /// Port used by the binary when none is given on the command line
    pub port: u16,
    /// Longer input is split into several lines of at most this many bytes
    pub max_line_bytes: usize,
    /// Lines queued for a slow client before deliveries to it are dropped
    pub outbound_queue: usize,
    /// Close connections that send nothing for this long
    pub idle_timeout_secs: Option<u64>,
    /// Give up flushing to a peer that stops reading after this long
    pub close_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            idle_timeout_secs: None,
            close_timeout_secs: DEFAULT_CLOSE_TIMEOUT_SECS,
        }
    }
}

impl ServerConfig {
    /// Parse a config from a JSON document
    pub fn from_json(json: &str) -> Result<Self, ChatError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.sanitized())
    }

    /// Load a config from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ChatError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs)
    }

    // Zero sizes would make every read or send fail.
    fn sanitized(mut self) -> Self {
        self.max_line_bytes = self.max_line_bytes.max(1);
        self.outbound_queue = self.outbound_queue.max(1);
        self
    }
}
