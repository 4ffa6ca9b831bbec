//! Server events
//!
//! The observability surface of the server. Every significant event is
//! written to `tracing` and handed to an optional [`EventListener`], which is
//! how a front-end receives its log lines (`event.to_string()`) and learns
//! when the channel list changed.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn, Level};

use crate::types::{ChannelName, ConnectionId};

/// Something worth telling an operator about
///
/// Serializes as a tagged object, e.g.
/// `{"type":"channel_created","channel":"lobby","implicit":false}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Listening socket bound and accept loop running
    Started { addr: SocketAddr },
    /// `start` failed; the server stays stopped
    StartFailed { error: String },
    /// Accept loop ended and the listening socket was released
    Stopped,
    /// `start` while running
    AlreadyRunning,
    /// `stop` while stopped
    NotRunning,
    /// `accept` returned an error; the loop keeps going
    AcceptFailed { error: String },
    /// A handling unit panicked or was cancelled
    UnitFailed { error: String },
    /// New connection accepted
    Connected { connection: ConnectionId, peer: String },
    /// Handshake completed
    Identified { connection: ConnectionId, name: String },
    /// Handshake line was blank
    HandshakeRejected { connection: ConnectionId },
    /// Connection closed and cleaned up
    Disconnected {
        connection: ConnectionId,
        name: Option<String>,
    },
    /// Read/write failure on one connection
    ConnectionFailed {
        connection: ConnectionId,
        error: String,
    },
    /// Channel added to the registry
    ChannelCreated { channel: ChannelName, implicit: bool },
    /// Create on a name that already exists
    ChannelExists { channel: ChannelName },
    /// Channel removed from the registry
    ChannelDeleted { channel: ChannelName, members: usize },
    /// Delete on a name that does not exist
    ChannelMissing { channel: ChannelName },
    /// The set of channel names changed
    ChannelsChanged { channels: Vec<ChannelName> },
    /// Member joined a channel
    Joined { channel: ChannelName, name: String },
    /// Member left a channel
    Left { channel: ChannelName, name: String },
    /// A broadcast could not be queued for one member
    DeliveryFailed {
        channel: ChannelName,
        to: String,
        error: String,
    },
}

impl ServerEvent {
    /// Level used when the event is written to `tracing`
    pub fn level(&self) -> Level {
        match self {
            ServerEvent::StartFailed { .. }
            | ServerEvent::AcceptFailed { .. }
            | ServerEvent::UnitFailed { .. } => Level::ERROR,
            ServerEvent::AlreadyRunning
            | ServerEvent::NotRunning
            | ServerEvent::HandshakeRejected { .. }
            | ServerEvent::ConnectionFailed { .. }
            | ServerEvent::DeliveryFailed { .. } => Level::WARN,
            ServerEvent::ChannelsChanged { .. } => Level::DEBUG,
            _ => Level::INFO,
        }
    }
}

impl fmt::Display for ServerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerEvent::Started { addr } => write!(f, "[Server] Started on {}.", addr),
            ServerEvent::StartFailed { error } => {
                write!(f, "[Error] Could not start the server: {}", error)
            }
            ServerEvent::Stopped => write!(f, "[Server] Stopped."),
            ServerEvent::AlreadyRunning => write!(f, "[Warning] Server is already running."),
            ServerEvent::NotRunning => write!(f, "[Warning] Server is not running."),
            ServerEvent::AcceptFailed { error } => {
                write!(f, "[Error] Failed to accept connection: {}", error)
            }
            ServerEvent::UnitFailed { error } => {
                write!(f, "[Error] Connection handler failed: {}", error)
            }
            ServerEvent::Connected { connection, peer } => {
                write!(f, "[Server] New client {} connected from {}.", connection, peer)
            }
            ServerEvent::Identified { connection, name } => {
                write!(f, "[Client] {} is {}.", connection, name)
            }
            ServerEvent::HandshakeRejected { connection } => {
                write!(f, "[Client] {} sent an empty name.", connection)
            }
            ServerEvent::Disconnected { connection, name } => match name {
                Some(name) => write!(f, "[Client] {} ({}) disconnected.", name, connection),
                None => write!(f, "[Client] {} disconnected.", connection),
            },
            ServerEvent::ConnectionFailed { connection, error } => {
                write!(f, "[Error] Client {}: {}", connection, error)
            }
            ServerEvent::ChannelCreated { channel, implicit } => {
                if *implicit {
                    write!(f, "[Server] Channel '{}' created automatically (join).", channel)
                } else {
                    write!(f, "[Server] Channel '{}' created.", channel)
                }
            }
            ServerEvent::ChannelExists { channel } => {
                write!(f, "[Server] Channel '{}' already exists.", channel)
            }
            ServerEvent::ChannelDeleted { channel, members } => write!(
                f,
                "[Server] Channel '{}' deleted ({} member(s) detached).",
                channel, members
            ),
            ServerEvent::ChannelMissing { channel } => {
                write!(f, "[Server] Channel '{}' does not exist.", channel)
            }
            ServerEvent::ChannelsChanged { channels } => {
                write!(f, "[Server] Channels: ")?;
                for (i, channel) in channels.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", channel)?;
                }
                Ok(())
            }
            ServerEvent::Joined { channel, name } => {
                write!(f, "[Channel] {} joined '{}'.", name, channel)
            }
            ServerEvent::Left { channel, name } => {
                write!(f, "[Channel] {} left '{}'.", name, channel)
            }
            ServerEvent::DeliveryFailed { channel, to, error } => {
                write!(f, "[Channel] '{}': could not deliver to {}: {}", channel, to, error)
            }
        }
    }
}

/// Receiver of server events
///
/// Implemented for any `Fn(&ServerEvent)`, so a closure is enough.
/// Called synchronously from whichever task produced the event; it must not
/// block.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &ServerEvent);
}

impl<F> EventListener for F
where
    F: Fn(&ServerEvent) + Send + Sync,
{
    fn on_event(&self, event: &ServerEvent) {
        self(event)
    }
}

/// Cloneable event sink shared by the server, registry and channels
#[derive(Clone, Default)]
pub struct EventLog {
    listener: Option<Arc<dyn EventListener>>,
}

impl EventLog {
    pub fn new(listener: Arc<dyn EventListener>) -> Self {
        Self {
            listener: Some(listener),
        }
    }

    /// Write the event to `tracing` and forward it to the listener
    pub fn emit(&self, event: ServerEvent) {
        let level = event.level();
        if level == Level::ERROR {
            error!("{}", event);
        } else if level == Level::WARN {
            warn!("{}", event);
        } else if level == Level::INFO {
            info!("{}", event);
        } else {
            debug!("{}", event);
        }

        if let Some(listener) = &self.listener {
            listener.on_event(&event);
        }
    }
}

impl fmt::Debug for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLog")
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

/// Listener that keeps every event, for tests and embedding
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: parking_lot::Mutex<Vec<ServerEvent>>,
}

impl EventRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of everything recorded so far
    pub fn events(&self) -> Vec<ServerEvent> {
        self.events.lock().clone()
    }
}

impl EventListener for EventRecorder {
    fn on_event(&self, event: &ServerEvent) {
        self.events.lock().push(event.clone());
    }
}
