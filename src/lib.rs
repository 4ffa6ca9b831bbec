//! Multi-Channel TCP Chat Server Library
//!
//! A line-based chat server built on tokio. Clients connect over TCP, send
//! a display name as their first line, then use slash-commands to manage
//! and switch between named channels. Any other line is broadcast to the
//! other members of the sender's current channel.
//!
//! # Protocol
//! - `<name>` (first line only): sets the display name
//! - `/create <channel>`: create a channel
//! - `/delete <channel>`: delete a channel
//! - `/join <channel>`: leave the current channel, join (or create) another
//! - `/exit`: disconnect
//! - anything else: broadcast to the current channel as `[<name>] <text>`
//!
//! # Architecture
//! - `ChannelRegistry` is the shared name → channel map, behind its own lock
//! - Each `Channel` guards its membership with an independent lock, so
//!   broadcasts in different channels run in parallel
//! - Each connection has a handling task (reads, interprets commands) and a
//!   writer task (drains its outbound queue into the socket)
//! - `ChatServer` owns the accept loop and the start/stop lifecycle
//!
//! # Example
//! ```no_run
//! use channel_chat::{ChatServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), channel_chat::ChatError> {
//!     let server = ChatServer::new(ServerConfig::default());
//!     let addr = server.start(5000).await?;
//!     println!("listening on {}", addr);
//!
//!     server.create_channel("lobby")?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await
//! }
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod handler;
pub mod message;
pub mod registry;
pub mod server;
pub mod types;

// Re-export main types for convenience
pub use channel::Channel;
pub use config::ServerConfig;
pub use connection::{Connection, Member};
pub use error::{ChatError, SendError};
pub use event::{EventListener, EventLog, EventRecorder, ServerEvent};
pub use handler::{handle_connection, SessionContext, SessionState};
pub use message::{ClientLine, Command, CommandError, Reply};
pub use registry::{ChannelRegistry, RunEpoch};
pub use server::ChatServer;
pub use types::{ChannelName, ConnectionId};
