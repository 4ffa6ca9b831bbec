//! Client connection
//!
//! A [`Connection`] owns one accepted byte stream. Reads happen on the
//! handling unit's own task; writes go through a bounded queue drained by a
//! dedicated writer task, so nobody ever writes to a socket while holding a
//! lock. A [`Member`] is the cheap, cloneable handle to that queue that
//! channels keep in their membership.

use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::ServerConfig;
use crate::error::{ChatError, SendError};
use crate::message::Reply;
use crate::types::ConnectionId;

/// Channel member: identity, display name and outbound queue
///
/// Cloning is cheap; every clone feeds the same writer task.
#[derive(Debug, Clone)]
pub struct Member {
    /// Identity of the owning connection
    pub id: ConnectionId,
    /// Display name from the handshake
    pub name: String,
    /// Server → client line queue
    sender: mpsc::Sender<String>,
}

impl Member {
    pub fn new(id: ConnectionId, name: String, sender: mpsc::Sender<String>) -> Self {
        Self { id, name, sender }
    }

    /// Queue a line without waiting
    ///
    /// Fails if the writer task has ended or the queue is full.
    pub fn try_send(&self, line: String) -> Result<(), SendError> {
        self.sender.try_send(line).map_err(|e| match e {
            TrySendError::Full(_) => SendError::QueueFull,
            TrySendError::Closed(_) => SendError::ChannelClosed,
        })
    }
}

/// One accepted client stream
pub struct Connection<S> {
    id: ConnectionId,
    peer: String,
    reader: BufReader<ReadHalf<S>>,
    sender: mpsc::Sender<String>,
    closing: CancellationToken,
    writer: JoinHandle<()>,
    max_line_bytes: u64,
    idle_timeout: Option<Duration>,
    close_timeout: Duration,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Split the stream and start its writer task
    pub fn new(stream: S, peer: String, config: &ServerConfig) -> Self {
        let id = ConnectionId::new();
        let (read_half, write_half) = tokio::io::split(stream);
        let (sender, receiver) = mpsc::channel(config.outbound_queue);
        let closing = CancellationToken::new();
        let writer = tokio::spawn(write_loop(id, write_half, receiver, closing.clone()));

        Self {
            id,
            peer,
            reader: BufReader::new(read_half),
            sender,
            closing,
            writer,
            max_line_bytes: config.max_line_bytes as u64,
            idle_timeout: config.idle_timeout(),
            close_timeout: config.close_timeout(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Transport endpoint, for logs
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Member handle for channel membership
    pub fn member(&self, name: String) -> Member {
        Member::new(self.id, name, self.sender.clone())
    }

    /// Token that makes the writer flush and close the stream
    pub fn closing_token(&self) -> CancellationToken {
        self.closing.clone()
    }

    /// Read the next line, without its terminator.
    ///
    /// Returns `None` on EOF. A line longer than `max_line_bytes` comes back
    /// in several pieces; they are not reassembled.
    pub async fn read_line(&mut self) -> Result<Option<String>, ChatError> {
        let mut buf = Vec::new();
        let mut limited = (&mut self.reader).take(self.max_line_bytes);
        let read = limited.read_until(b'\n', &mut buf);

        let n = match self.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, read)
                .await
                .map_err(|_| ChatError::IdleTimeout(limit.as_secs()))??,
            None => read.await?,
        };

        if n == 0 {
            return Ok(None);
        }

        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }

        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    /// Send a private reply, waiting for queue space
    pub async fn reply(&self, reply: Reply) -> Result<(), SendError> {
        self.sender
            .send(reply.to_string())
            .await
            .map_err(|_| SendError::ChannelClosed)
    }

    /// Flush queued lines, shut the stream down and wait for the writer.
    ///
    /// A writer still blocked after `close_timeout` (the peer stopped
    /// reading) is aborted and the remaining lines are lost.
    pub async fn close(mut self) {
        self.closing.cancel();
        drop(self.sender);
        match tokio::time::timeout(self.close_timeout, &mut self.writer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Writer task for {} failed: {}", self.id, e),
            Err(_) => {
                warn!(
                    "Writer task for {} still blocked after {:?}, aborting",
                    self.id, self.close_timeout
                );
                self.writer.abort();
            }
        }
        debug!("Connection {} ({}) closed", self.id, self.peer);
    }
}

/// Drain the outbound queue into the stream until closed
async fn write_loop<W>(
    id: ConnectionId,
    mut writer: W,
    mut outbound: mpsc::Receiver<String>,
    closing: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;
            line = outbound.recv() => match line {
                Some(line) => {
                    let mut bytes = line.into_bytes();
                    bytes.push(b'\n');
                    if let Err(e) = writer.write_all(&bytes).await {
                        debug!("Write to {} failed, ending write task: {}", id, e);
                        break;
                    }
                }
                None => break,
            },
            // Stop accepting lines; recv drains what is queued, then yields None
            _ = closing.cancelled() => outbound.close(),
        }
    }

    let _ = writer.shutdown().await;
    debug!("Write task ended for {}", id);
}
