use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::RelayError;
use crate::metrics::{counters, gauges};
use crate::registry::{ConnHandle, Registry};
use crate::router::RouterHandle;
use courier_common::{Identity, InboundMessage};
use futures_util::{Stream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info};

/// Lifecycle of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transport established, nothing verified yet.
    Connecting,
    /// Upgrade request received; credential checked during the handshake,
    /// registration pending.
    Authenticating,
    /// Registered and relaying.
    Active,
    /// Tearing down.
    Closing,
    /// Terminal.
    Closed,
}

/// Per-session tunables.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Interval between keep-alive pings.
    pub ping_interval: Duration,
    /// End the session when nothing was read for this long.
    pub idle_timeout: Duration,
    /// Close the connection this session supersedes, if any.
    pub evict_superseded: bool,
}

impl From<&ServerConfig> for SessionOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            ping_interval: Duration::from_secs(config.ping_interval),
            idle_timeout: Duration::from_secs(config.idle_timeout),
            evict_superseded: config.evict_superseded,
        }
    }
}

/// Drives one verified connection: register, relay inbound messages with
/// the verified sender stamped on, then deregister and close.
pub struct Session {
    handle: ConnHandle,
    registry: Arc<Registry>,
    router: RouterHandle,
    options: SessionOptions,
    state: SessionState,
}

impl Session {
    /// Create a session for a connection whose identity is already verified.
    /// It picks up in [`SessionState::Authenticating`], where the handshake
    /// left off.
    #[must_use]
    pub fn new(
        identity: Identity,
        conn: Arc<dyn Connection>,
        registry: Arc<Registry>,
        router: RouterHandle,
        options: SessionOptions,
    ) -> Self {
        let handle = registry.handle(identity, conn);
        Self {
            handle,
            registry,
            router,
            options,
            state: SessionState::Authenticating,
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The registry handle for this session's connection.
    #[must_use]
    pub fn handle(&self) -> &ConnHandle {
        &self.handle
    }

    /// Run until the connection ends. Always leaves the session `Closed`
    /// with its registry entry removed and its connection closed.
    ///
    /// # Errors
    ///
    /// Returns the error that ended the session, if it did not end cleanly.
    pub async fn run<S>(&mut self, mut source: S) -> Result<(), RelayError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        match self.registry.register(self.handle.clone()) {
            Ok(displaced) => {
                if let Some(old) = displaced {
                    if self.options.evict_superseded {
                        info!(
                            identity = %old.identity,
                            conn_id = old.id,
                            "closing superseded connection"
                        );
                        old.conn.close().await;
                    }
                }
            }
            Err(e) => {
                self.handle.conn.close().await;
                self.state = SessionState::Closed;
                return Err(e);
            }
        }

        self.state = SessionState::Active;
        gauges::inc_connections_active();
        debug!(identity = %self.handle.identity, conn_id = self.handle.id, "session active");

        let result = self.read_loop(&mut source).await;

        self.state = SessionState::Closing;
        self.registry
            .deregister_if(&self.handle.identity, self.handle.id);
        self.handle.conn.close().await;
        gauges::dec_connections_active();
        counters::sessions_closed_total(match &result {
            Ok(()) => "client",
            Err(RelayError::Malformed(_)) => "malformed",
            Err(RelayError::RouterClosed) => "shutdown",
            Err(_) => "error",
        });
        self.state = SessionState::Closed;
        debug!(
            identity = %self.handle.identity,
            conn_id = self.handle.id,
            duration_secs = self.handle.connected_at.elapsed().as_secs(),
            "session closed"
        );

        result
    }

    async fn read_loop<S>(&self, source: &mut S) -> Result<(), RelayError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let conn = Arc::clone(&self.handle.conn);
        let mut ping_interval = interval_at(
            Instant::now() + self.options.ping_interval,
            self.options.ping_interval,
        );
        let mut last_activity = Instant::now();

        loop {
            tokio::select! {
                msg = source.next() => {
                    last_activity = Instant::now();
                    match msg {
                        Some(Ok(Message::Text(text))) => self.forward(text.as_bytes()).await?,
                        Some(Ok(Message::Binary(data))) => self.forward(&data).await?,
                        Some(Ok(Message::Close(_))) | None => return Ok(()),
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(RelayError::WebSocket(e)),
                    }
                }
                () = conn.closed() => {
                    debug!(identity = %self.handle.identity, "connection closed by relay");
                    return Ok(());
                }
                _ = ping_interval.tick() => {
                    if last_activity.elapsed() >= self.options.idle_timeout {
                        debug!(identity = %self.handle.identity, "idle timeout reached, closing connection");
                        return Ok(());
                    }
                    conn.write(Message::Ping(Vec::new())).await?;
                }
            }
        }
    }

    /// Decode, stamp with the verified identity, hand to the router.
    async fn forward(&self, data: &[u8]) -> Result<(), RelayError> {
        let inbound = InboundMessage::decode(data)?;
        let envelope = inbound.stamp(self.handle.identity.clone());
        self.router.submit(envelope).await
    }
}
