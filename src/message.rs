//! Line protocol definitions
//!
//! Client → server lines are classified into commands or chat text;
//! server → client lines are rendered from [`Reply`].

use std::fmt;

use crate::types::ChannelName;

/// A slash-command from a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/create <channel>`
    Create(ChannelName),
    /// `/delete <channel>`
    Delete(ChannelName),
    /// `/join <channel>`: leave the current channel, then join (creating if needed)
    Join(ChannelName),
    /// `/exit`
    Exit,
}

/// One classified line from an authenticated client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientLine {
    /// Blank line, ignored
    Empty,
    /// Slash-command
    Command(Command),
    /// Anything else, broadcast to the current channel
    Chat(String),
}

/// Why a slash-line could not become a [`Command`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Command needs a channel name and none was given
    MissingArgument { command: &'static str },
    /// Unknown command word
    Unrecognized(String),
}

impl ClientLine {
    /// Classify a line.
    ///
    /// Surrounding whitespace is ignored. Command words are matched
    /// case-insensitively; the channel argument is kept as typed, and any
    /// arguments after it are ignored.
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(ClientLine::Empty);
        }

        let Some(body) = line.strip_prefix('/') else {
            return Ok(ClientLine::Chat(line.to_string()));
        };

        let mut parts = body.split_whitespace();
        let word = parts.next().unwrap_or_default().to_lowercase();
        // split_whitespace never yields blank or spaced tokens
        let channel = parts.next().and_then(|arg| ChannelName::parse(arg).ok());

        let command = match word.as_str() {
            "create" => Command::Create(channel.ok_or(CommandError::MissingArgument {
                command: "create",
            })?),
            "delete" => Command::Delete(channel.ok_or(CommandError::MissingArgument {
                command: "delete",
            })?),
            "join" => Command::Join(channel.ok_or(CommandError::MissingArgument {
                command: "join",
            })?),
            "exit" => Command::Exit,
            _ => return Err(CommandError::Unrecognized(format!("/{}", word))),
        };

        Ok(ClientLine::Command(command))
    }
}

/// Server → client line
///
/// Everything but `Chat` is a private reply to the requesting connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Handshake accepted
    Welcome { name: String },
    /// Handshake rejected (blank name)
    NameRejected,
    /// `/create` made a new channel
    Created(ChannelName),
    /// `/create` on an existing name
    AlreadyExists(ChannelName),
    /// `/delete` removed the channel
    Deleted(ChannelName),
    /// `/delete` on a missing name
    DidNotExist(ChannelName),
    /// `/join` succeeded
    Joined(ChannelName),
    /// `/exit` acknowledged
    Goodbye,
    /// Chat line while in no channel
    NotInChannel,
    /// Chat line while the current channel has been deleted
    ChannelGone(ChannelName),
    /// Server stopped; the connection is being closed
    ShuttingDown,
    /// Command without its required argument
    Usage { command: &'static str },
    /// Unknown command word
    NotRecognized(String),
    /// Broadcast from another member
    Chat { from: String, content: String },
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Welcome { name } => write!(
                f,
                "Welcome, {}. Use /join <channel> to start chatting.",
                name
            ),
            Reply::NameRejected => write!(f, "Display name must not be empty."),
            Reply::Created(channel) => write!(f, "Channel '{}' created.", channel),
            Reply::AlreadyExists(channel) => write!(f, "Channel '{}' already exists.", channel),
            Reply::Deleted(channel) => write!(f, "Channel '{}' deleted.", channel),
            Reply::DidNotExist(channel) => write!(f, "Channel '{}' did not exist.", channel),
            Reply::Joined(channel) => write!(f, "You joined channel '{}'.", channel),
            Reply::Goodbye => write!(f, "Goodbye."),
            Reply::NotInChannel => {
                write!(f, "You are not in any channel. Use /join <channel> first.")
            }
            Reply::ChannelGone(channel) => write!(
                f,
                "Channel '{}' no longer exists. Use /join <channel>.",
                channel
            ),
            Reply::ShuttingDown => write!(f, "Server is shutting down."),
            Reply::Usage { command } => write!(f, "Usage: /{} <channel>", command),
            Reply::NotRecognized(command) => write!(f, "Command not recognized: {}", command),
            Reply::Chat { from, content } => write!(f, "[{}] {}", from, content),
        }
    }
}

/// Convert a protocol error into the reply sent to the offending client
impl From<CommandError> for Reply {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::MissingArgument { command } => Reply::Usage { command },
            CommandError::Unrecognized(command) => Reply::NotRecognized(command),
        }
    }
}
