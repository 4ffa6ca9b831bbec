//! Error types for the chat server
//!
//! Defines application-level errors and per-member delivery errors.
//! Uses thiserror for ergonomic error definitions.

use std::net::SocketAddr;
use std::path::PathBuf;

use thiserror::Error;

/// Application-level errors
///
/// Transport errors end only the connection that hit them; startup errors
/// end only the `start` call that hit them. Nothing here stops the process.
#[derive(Debug, Error)]
pub enum ChatError {
    /// IO error on a client transport (fatal for that connection)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Private reply could not be queued (writer task ended)
    #[error("send error: {0}")]
    Send(#[from] SendError),

    /// Listening socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// `start` called while the server is running
    #[error("server is already running")]
    AlreadyRunning,

    /// `stop` called while the server is stopped
    #[error("server is not running")]
    NotRunning,

    /// Channel name is blank or contains whitespace
    #[error("invalid channel name: {0:?}")]
    InvalidChannelName(String),

    /// A session tried to change channels after the run it belongs to was
    /// stopped
    #[error("server is shutting down")]
    RunEnded,

    /// Handshake line was blank
    #[error("display name must not be empty")]
    InvalidDisplayName,

    /// Connection sent nothing within the configured idle timeout
    #[error("connection idle for more than {0} seconds")]
    IdleTimeout(u64),

    /// Config file is not valid JSON for `ServerConfig`
    #[error("invalid config: {0}")]
    Config(#[from] serde_json::Error),

    /// Config file could not be read
    #[error("cannot read config {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Message send errors
///
/// Occurs when a line cannot be queued for a member's writer task.
#[derive(Debug, Error)]
pub enum SendError {
    /// The member's writer task has ended (client disconnected)
    #[error("Channel closed")]
    ChannelClosed,

    /// The member is not draining its outbound queue fast enough
    #[error("Outbound queue full")]
    QueueFull,
}
