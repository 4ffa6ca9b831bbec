//! Basic type definitions for the chat server
//!
//! Provides newtype wrappers for type safety:
//! - `ConnectionId`: UUID-based identity of one accepted connection
//! - `ChannelName`: case-sensitive, whitespace-free channel name

use std::borrow::Borrow;

use serde::Serialize;
use uuid::Uuid;

use crate::error::ChatError;

/// Unique connection identifier (newtype pattern)
///
/// A fresh UUID v4 is drawn for every accepted socket, so a client that
/// reconnects from the same endpoint never reuses an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    /// Create a new random connection ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Channel name
///
/// Unlike room codes these are chosen by users and compared exactly:
/// `Lobby` and `lobby` are two different channels.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelName(String);

impl ChannelName {
    /// Parse a channel name, trimming surrounding whitespace.
    ///
    /// Blank names and names with inner whitespace are rejected, since the
    /// line protocol could never address them.
    pub fn parse(raw: &str) -> Result<Self, ChatError> {
        let name = raw.trim();
        if name.is_empty() || name.chars().any(char::is_whitespace) {
            return Err(ChatError::InvalidChannelName(raw.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for ChannelName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
