//! Connection handler
//!
//! Drives one client from handshake to disconnect: reads the display name,
//! then classifies every line and applies it to the registry or the current
//! channel. Cleanup (leave the current channel, close the transport) runs
//! exactly once on every exit path, including task abort.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::ChatError;
use crate::event::{EventLog, ServerEvent};
use crate::message::{ClientLine, Command, Reply};
use crate::registry::{ChannelRegistry, RunEpoch};
use crate::types::{ChannelName, ConnectionId};

/// Shared state every handling unit needs
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub registry: Arc<ChannelRegistry>,
    pub events: EventLog,
    pub config: ServerConfig,
    /// Cancelled when the server stops; checked after every line read
    pub shutdown: CancellationToken,
    /// Registry epoch of the run this unit belongs to
    pub epoch: RunEpoch,
}

/// Per-connection protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the display name
    Unauthenticated,
    /// Named; accepting commands and chat
    Active,
    /// Finished; cleanup follows
    Closed,
}

/// Handle one accepted stream until it disconnects
///
/// Errors are already logged as events when this returns; they are passed
/// back for the caller's information only.
pub async fn handle_connection<S>(
    stream: S,
    peer: String,
    ctx: Arc<SessionContext>,
) -> Result<(), ChatError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let conn = Connection::new(stream, peer, &ctx.config);
    ctx.events.emit(ServerEvent::Connected {
        connection: conn.id(),
        peer: conn.peer().to_string(),
    });

    let guard = SessionGuard {
        id: conn.id(),
        name: None,
        current: None,
        registry: ctx.registry.clone(),
        events: ctx.events.clone(),
        closing: conn.closing_token(),
        released: false,
    };

    let mut session = Session {
        conn,
        guard,
        ctx,
        state: SessionState::Unauthenticated,
    };

    let result = session.run().await;
    if let Err(e) = &result {
        session.ctx.events.emit(ServerEvent::ConnectionFailed {
            connection: session.conn.id(),
            error: e.to_string(),
        });
    }

    let Session {
        conn, mut guard, ..
    } = session;
    guard.release();
    conn.close().await;

    result
}

/// Cleanup that must happen exactly once per connection
///
/// Released explicitly on normal paths and from `Drop` if the handling unit
/// panics or is aborted.
struct SessionGuard {
    id: ConnectionId,
    name: Option<String>,
    current: Option<ChannelName>,
    registry: Arc<ChannelRegistry>,
    events: EventLog,
    closing: CancellationToken,
    released: bool,
}

impl SessionGuard {
    fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }

        if let Some(channel) = self.current.take() {
            self.registry.leave(&channel, self.id);
        }
        self.closing.cancel();
        self.events.emit(ServerEvent::Disconnected {
            connection: self.id,
            name: self.name.clone(),
        });
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

struct Session<S> {
    conn: Connection<S>,
    guard: SessionGuard,
    ctx: Arc<SessionContext>,
    state: SessionState,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn run(&mut self) -> Result<(), ChatError> {
        while self.state != SessionState::Closed {
            let Some(line) = self.conn.read_line().await? else {
                debug!("Connection {} reached EOF", self.conn.id());
                break;
            };

            if self.ctx.shutdown.is_cancelled() {
                self.conn.reply(Reply::ShuttingDown).await?;
                self.state = SessionState::Closed;
                break;
            }

            self.state = match self.state {
                SessionState::Unauthenticated => self.handshake(&line).await?,
                SessionState::Active => self.interpret(&line).await?,
                SessionState::Closed => SessionState::Closed,
            };
        }

        Ok(())
    }

    async fn handshake(&mut self, line: &str) -> Result<SessionState, ChatError> {
        let name = line.trim();
        if name.is_empty() {
            self.ctx.events.emit(ServerEvent::HandshakeRejected {
                connection: self.conn.id(),
            });
            self.conn.reply(Reply::NameRejected).await?;
            return Ok(SessionState::Closed);
        }

        self.guard.name = Some(name.to_string());
        self.ctx.events.emit(ServerEvent::Identified {
            connection: self.conn.id(),
            name: name.to_string(),
        });
        self.conn
            .reply(Reply::Welcome {
                name: name.to_string(),
            })
            .await?;

        Ok(SessionState::Active)
    }

    async fn interpret(&mut self, line: &str) -> Result<SessionState, ChatError> {
        debug!("Connection {} sent {:?}", self.conn.id(), line);

        match ClientLine::parse(line) {
            Ok(ClientLine::Empty) => Ok(SessionState::Active),
            Ok(ClientLine::Chat(content)) => {
                self.chat(content).await?;
                Ok(SessionState::Active)
            }
            Ok(ClientLine::Command(command)) => self.execute(command).await,
            Err(e) => {
                self.conn.reply(e.into()).await?;
                Ok(SessionState::Active)
            }
        }
    }

    async fn execute(&mut self, command: Command) -> Result<SessionState, ChatError> {
        if command == Command::Exit {
            self.conn.reply(Reply::Goodbye).await?;
            return Ok(SessionState::Closed);
        }

        match self.apply(command) {
            Ok(reply) => {
                self.conn.reply(reply).await?;
                Ok(SessionState::Active)
            }
            // The server was stopped while this command was in flight
            Err(ChatError::RunEnded) => {
                self.conn.reply(Reply::ShuttingDown).await?;
                Ok(SessionState::Closed)
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a registry command, returning the private reply
    fn apply(&mut self, command: Command) -> Result<Reply, ChatError> {
        let registry = &self.ctx.registry;
        let epoch = self.ctx.epoch;

        let reply = match command {
            Command::Create(channel) => {
                if registry.create_in(epoch, &channel)? {
                    Reply::Created(channel)
                } else {
                    Reply::AlreadyExists(channel)
                }
            }
            Command::Delete(channel) => {
                if registry.delete_in(epoch, &channel)? {
                    Reply::Deleted(channel)
                } else {
                    Reply::DidNotExist(channel)
                }
            }
            Command::Join(channel) => {
                // Leave first so the connection is never in two channels
                if let Some(old) = self.guard.current.take() {
                    registry.leave(&old, self.conn.id());
                }
                let member = self.conn.member(self.display_name().to_string());
                let joined = registry.join(epoch, &channel, member)?;
                debug!("{} now has {} member(s)", channel, joined.member_count());
                self.guard.current = Some(channel.clone());
                Reply::Joined(channel)
            }
            Command::Exit => Reply::Goodbye,
        };

        Ok(reply)
    }

    async fn chat(&mut self, content: String) -> Result<(), ChatError> {
        let Some(current) = self.guard.current.clone() else {
            self.conn.reply(Reply::NotInChannel).await?;
            return Ok(());
        };

        let id = self.conn.id();
        match self.ctx.registry.get(current.as_str()) {
            // Membership is checked by identity: a channel deleted and
            // recreated under the same name is a different channel
            Some(channel) if channel.contains(id) => {
                let line = Reply::Chat {
                    from: self.display_name().to_string(),
                    content,
                }
                .to_string();
                let delivered = channel.broadcast(&line, Some(id));
                debug!("Broadcast in {} reached {} member(s)", current, delivered);
            }
            _ => {
                self.guard.current = None;
                self.conn.reply(Reply::ChannelGone(current)).await?;
            }
        }

        Ok(())
    }

    fn display_name(&self) -> &str {
        self.guard.name.as_deref().unwrap_or("Unknown")
    }
}
