//! ChatServer implementation
//!
//! Owns the channel registry and the listening socket. `start` binds and
//! spawns the accept loop; `stop` signals it, waits until the listening
//! socket is released and clears the registry. Connected clients are not
//! cut off by `stop`: each handling unit notices the shutdown on its next
//! line, and the accept task keeps reaping units until the last one ends.
//! Those draining accept tasks stay owned by the server and are reaped on
//! the next `start` or `stop`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::ServerConfig;
use crate::error::ChatError;
use crate::event::{EventListener, EventLog, ServerEvent};
use crate::handler::{handle_connection, SessionContext};
use crate::registry::ChannelRegistry;
use crate::types::ChannelName;

/// Pause after a failed accept, so a persistent error does not spin
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

enum ServerState {
    Stopped,
    Running(RunningServer),
}

struct RunningServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    /// Fires once the accept loop has dropped the listener
    released: oneshot::Receiver<()>,
    accept: JoinHandle<()>,
}

/// Multi-channel chat server
pub struct ChatServer {
    config: ServerConfig,
    registry: Arc<ChannelRegistry>,
    events: EventLog,
    state: Mutex<ServerState>,
    /// Accept tasks of stopped runs, still reaping their units
    draining: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl ChatServer {
    /// Create a stopped server that reports events to `tracing` only
    pub fn new(config: ServerConfig) -> Self {
        Self::with_events(config, EventLog::default())
    }

    /// Create a stopped server that also reports events to `listener`
    pub fn with_listener(config: ServerConfig, listener: Arc<dyn EventListener>) -> Self {
        Self::with_events(config, EventLog::new(listener))
    }

    fn with_events(config: ServerConfig, events: EventLog) -> Self {
        Self {
            registry: Arc::new(ChannelRegistry::new(events.clone())),
            config,
            events,
            state: Mutex::new(ServerState::Stopped),
            draining: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Bind `config.host:port` and start accepting.
    ///
    /// Port 0 binds an ephemeral port; the bound address is returned.
    pub async fn start(&self, port: u16) -> Result<SocketAddr, ChatError> {
        let mut state = self.state.lock().await;
        if matches!(*state, ServerState::Running(_)) {
            self.events.emit(ServerEvent::AlreadyRunning);
            return Err(ChatError::AlreadyRunning);
        }
        self.reap_draining().await;

        let (listener, addr) = match self.bind(port).await {
            Ok(bound) => bound,
            Err(e) => {
                self.events.emit(ServerEvent::StartFailed {
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let shutdown = CancellationToken::new();
        let ctx = Arc::new(SessionContext {
            registry: self.registry.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
            shutdown: shutdown.clone(),
            epoch: self.registry.epoch(),
        });
        let (released_tx, released) = oneshot::channel();
        let accept = tokio::spawn(accept_loop(listener, ctx, released_tx));

        self.events.emit(ServerEvent::Started { addr });
        *state = ServerState::Running(RunningServer {
            addr,
            shutdown,
            released,
            accept,
        });

        Ok(addr)
    }

    async fn bind(&self, port: u16) -> Result<(TcpListener, SocketAddr), ChatError> {
        let addr = SocketAddr::new(self.config.host, port);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ChatError::Bind { addr, source })?;
        let local = listener.local_addr()?;
        Ok((listener, local))
    }

    /// Stop accepting and release the listening socket.
    ///
    /// Channels are cleared. Established connections are left to finish on
    /// their own.
    pub async fn stop(&self) -> Result<(), ChatError> {
        let mut state = self.state.lock().await;
        let ServerState::Running(running) = std::mem::replace(&mut *state, ServerState::Stopped)
        else {
            self.events.emit(ServerEvent::NotRunning);
            return Err(ChatError::NotRunning);
        };

        running.shutdown.cancel();
        match running.released.await {
            Ok(()) => self.draining.lock().push(running.accept),
            // The accept task ended without releasing: it panicked or was
            // aborted, and the listener went with it
            Err(_) => {
                if let Err(e) = running.accept.await {
                    self.events.emit(ServerEvent::UnitFailed {
                        error: e.to_string(),
                    });
                }
            }
        }
        self.reap_draining().await;

        let cleared = self.registry.clear();
        debug!("Cleared {} channel(s) on stop", cleared);
        self.events.emit(ServerEvent::Stopped);

        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, ServerState::Running(_))
    }

    /// Bound address while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock().await {
            ServerState::Running(running) => Some(running.addr),
            ServerState::Stopped => None,
        }
    }

    /// Operator control: create a channel. Works whether or not the server runs.
    ///
    /// Returns false if the channel already existed.
    pub fn create_channel(&self, name: &str) -> Result<bool, ChatError> {
        let name = ChannelName::parse(name)?;
        Ok(self.registry.create(&name))
    }

    /// Operator control: delete a channel.
    ///
    /// Returns false if the channel did not exist.
    pub fn delete_channel(&self, name: &str) -> Result<bool, ChatError> {
        let name = ChannelName::parse(name)?;
        Ok(self.registry.delete(&name))
    }

    /// Current channel names, in creation order
    pub fn channel_names(&self) -> Vec<ChannelName> {
        self.registry.names()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Collect accept tasks of earlier runs that have finished
    async fn reap_draining(&self) {
        let finished: Vec<JoinHandle<()>> = {
            let mut draining = self.draining.lock();
            let (finished, running) = draining.drain(..).partition(|h| h.is_finished());
            *draining = running;
            finished
        };

        for handle in finished {
            if let Err(e) = handle.await {
                self.events.emit(ServerEvent::UnitFailed {
                    error: e.to_string(),
                });
            }
        }
    }
}

impl Drop for ChatServer {
    fn drop(&mut self) {
        if let ServerState::Running(running) = self.state.get_mut() {
            running.shutdown.cancel();
            running.accept.abort();
        }
        // Units end with their owner; their guards still clean up
        for handle in self.draining.get_mut().drain(..) {
            handle.abort();
        }
    }
}

/// Accept connections until shutdown, then drain the handling units
async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    released: oneshot::Sender<()>,
) {
    let mut units: JoinSet<Result<(), ChatError>> = JoinSet::new();

    loop {
        tokio::select! {
            _ = ctx.shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    units.spawn(handle_connection(stream, peer.to_string(), ctx.clone()));
                }
                Err(e) => {
                    ctx.events.emit(ServerEvent::AcceptFailed {
                        error: e.to_string(),
                    });
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            Some(finished) = units.join_next(), if !units.is_empty() => {
                reap(&ctx.events, finished);
            }
        }
    }

    drop(listener);
    let _ = released.send(());

    debug!("Accept loop stopped, waiting for {} connection(s)", units.len());
    while let Some(finished) = units.join_next().await {
        reap(&ctx.events, finished);
    }
    debug!("All connection handlers finished");
}

fn reap(events: &EventLog, finished: Result<Result<(), ChatError>, JoinError>) {
    match finished {
        Ok(Ok(())) => {}
        // Already reported by the handler
        Ok(Err(e)) => debug!("Connection handler ended with error: {}", e),
        Err(e) => events.emit(ServerEvent::UnitFailed {
            error: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventRecorder;
    use std::net::{IpAddr, Ipv4Addr};

    fn local_config() -> ServerConfig {
        ServerConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let recorder = EventRecorder::new();
        let server = ChatServer::with_listener(local_config(), recorder.clone());

        assert!(!server.is_running().await);
        let addr = server.start(0).await.unwrap();
        assert!(server.is_running().await);
        assert_eq!(server.local_addr().await, Some(addr));

        server.stop().await.unwrap();
        assert!(!server.is_running().await);
        assert_eq!(server.local_addr().await, None);

        let events = recorder.events();
        assert!(events.contains(&ServerEvent::Started { addr }));
        assert!(events.contains(&ServerEvent::Stopped));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let server = ChatServer::new(local_config());
        server.start(0).await.unwrap();

        assert!(matches!(
            server.start(0).await,
            Err(ChatError::AlreadyRunning)
        ));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_when_stopped_fails() {
        let server = ChatServer::new(local_config());
        assert!(matches!(server.stop().await, Err(ChatError::NotRunning)));
    }

    #[tokio::test]
    async fn test_stop_releases_port() {
        let server = ChatServer::new(local_config());
        let addr = server.start(0).await.unwrap();
        server.stop().await.unwrap();

        // Same port can be bound again right away
        let restarted = server.start(addr.port()).await.unwrap();
        assert_eq!(restarted.port(), addr.port());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_leaves_server_stopped() {
        let recorder = EventRecorder::new();
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let server = ChatServer::with_listener(local_config(), recorder.clone());

        let result = server.start(port).await;

        assert!(matches!(result, Err(ChatError::Bind { .. })));
        assert!(!server.is_running().await);
        assert!(recorder
            .events()
            .iter()
            .any(|e| matches!(e, ServerEvent::StartFailed { .. })));
    }

    #[tokio::test]
    async fn test_operator_channel_controls() {
        let server = ChatServer::new(local_config());

        assert!(server.create_channel("lobby").unwrap());
        assert!(!server.create_channel("lobby").unwrap());
        assert!(server.create_channel("games").unwrap());
        assert_eq!(
            server.channel_names(),
            vec![
                ChannelName::parse("lobby").unwrap(),
                ChannelName::parse("games").unwrap()
            ]
        );

        assert!(server.delete_channel("lobby").unwrap());
        assert!(!server.delete_channel("lobby").unwrap());
        assert!(matches!(
            server.create_channel("  "),
            Err(ChatError::InvalidChannelName(_))
        ));
    }

    #[tokio::test]
    async fn test_lost_accept_task_is_reported_on_stop() {
        let recorder = EventRecorder::new();
        let server = ChatServer::with_listener(local_config(), recorder.clone());
        server.start(0).await.unwrap();

        if let ServerState::Running(running) = &*server.state.lock().await {
            running.accept.abort();
        }
        server.stop().await.unwrap();

        assert!(recorder
            .events()
            .iter()
            .any(|e| matches!(e, ServerEvent::UnitFailed { .. })));
        assert!(recorder.events().contains(&ServerEvent::Stopped));
    }

    #[tokio::test]
    async fn test_panicked_drain_is_reported_on_next_start() {
        let recorder = EventRecorder::new();
        let server = ChatServer::with_listener(local_config(), recorder.clone());

        let handle = tokio::spawn(async { panic!("accept loop exploded") });
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        server.draining.lock().push(handle);

        server.start(0).await.unwrap();

        assert!(server.draining.lock().is_empty());
        assert!(recorder.events().iter().any(
            |e| matches!(e, ServerEvent::UnitFailed { error } if error.contains("panicked"))
        ));
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_drains_are_collected() {
        let server = ChatServer::new(local_config());
        server.start(0).await.unwrap();
        server.stop().await.unwrap();

        // No live units, so the drain ends right after the listener is gone
        for _ in 0..50 {
            if server.draining.lock().iter().all(|h| h.is_finished()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.start(0).await.unwrap();
        assert!(server.draining.lock().is_empty());
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_clears_channels() {
        let server = ChatServer::new(local_config());
        server.start(0).await.unwrap();
        server.create_channel("lobby").unwrap();

        server.stop().await.unwrap();

        assert!(server.channel_names().is_empty());
    }
}
