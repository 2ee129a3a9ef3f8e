use crate::auth::{bearer_token, AuthError, IdentityVerifier};
use crate::error::RelayError;
use crate::metrics::counters;
use crate::server::ServerState;
use crate::session::{Session, SessionOptions, SessionState};
use async_trait::async_trait;
use courier_common::Identity;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// One live, message-framed, bidirectional connection.
///
/// Writes are serialized per connection: concurrent callers queue on the
/// same writer, so frames from the router and from the owning session never
/// interleave.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Write one frame.
    ///
    /// # Errors
    ///
    /// Fails if the connection is closed, the transport errors, or the write
    /// does not finish in time.
    async fn write(&self, frame: Message) -> Result<(), RelayError>;

    /// Close the connection. Calling it again is a no-op.
    async fn close(&self);

    /// Resolves once [`Connection::close`] has been called.
    async fn closed(&self);

    /// Returns `true` once the connection has been closed.
    fn is_closed(&self) -> bool;
}

/// [`Connection`] over the write half of a WebSocket.
pub struct WsConnection {
    sink: Mutex<WsSink>,
    closed: watch::Sender<bool>,
    write_timeout: Duration,
}

impl WsConnection {
    /// Wrap a WebSocket write half. Each write is bounded by `write_timeout`.
    #[must_use]
    pub fn new(sink: WsSink, write_timeout: Duration) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            sink: Mutex::new(sink),
            closed,
            write_timeout,
        }
    }
}

#[async_trait]
impl Connection for WsConnection {
    async fn write(&self, frame: Message) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::ConnectionClosed);
        }
        let mut sink = self.sink.lock().await;
        match timeout(self.write_timeout, sink.send(frame)).await {
            Ok(result) => result.map_err(RelayError::WebSocket),
            Err(_) => Err(RelayError::WriteTimeout),
        }
    }

    async fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let shutdown = async {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        };
        if timeout(self.write_timeout, shutdown).await.is_err() {
            tracing::debug!("close handshake timed out");
        }
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

fn error_response(status: StatusCode, message: &str) -> ErrorResponse {
    let body = serde_json::json!({ "error": message }).to_string();
    let mut resp = ErrorResponse::new(Some(body));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

/// Handshake-phase bookkeeping for one connection attempt.
///
/// Starts in [`SessionState::Connecting`], moves to
/// [`SessionState::Authenticating`] once the upgrade request arrives, and to
/// [`SessionState::Closed`] if the request is refused.
struct Handshake {
    state: SessionState,
    identity: Option<Identity>,
    rejection: Option<AuthError>,
}

impl Handshake {
    fn new() -> Self {
        Self {
            state: SessionState::Connecting,
            identity: None,
            rejection: None,
        }
    }

    /// Check the upgrade request's path and bearer credential.
    fn check(
        &mut self,
        req: &Request,
        ws_path: &str,
        verifier: &dyn IdentityVerifier,
    ) -> Result<(), ErrorResponse> {
        if req.uri().path() != ws_path {
            self.state = SessionState::Closed;
            return Err(error_response(StatusCode::NOT_FOUND, "not found"));
        }
        self.state = SessionState::Authenticating;
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        match bearer_token(authorization).and_then(|token| verifier.verify(token)) {
            Ok(id) => {
                self.identity = Some(id);
                Ok(())
            }
            Err(e) => {
                let message = match e {
                    AuthError::MissingCredential | AuthError::MalformedCredential => {
                        "Missing or invalid Authorization header"
                    }
                    AuthError::InvalidToken(_) => "Invalid or expired token",
                    AuthError::MissingIdentity => "email not found in token",
                };
                self.rejection = Some(e);
                self.state = SessionState::Closed;
                Err(error_response(StatusCode::UNAUTHORIZED, message))
            }
        }
    }
}

/// Perform the WebSocket upgrade, verifying the bearer credential on the
/// way. Unauthenticated requests are answered with 401 and never upgraded.
/// The whole exchange is bounded by `handshake_timeout`.
async fn accept(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: &ServerState,
) -> Result<(Identity, WebSocketStream<TcpStream>), RelayError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(state.config.max_payload),
        max_frame_size: Some(state.config.max_payload),
        ..WebSocketConfig::default()
    };

    let mut handshake = Handshake::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        handshake
            .check(req, &state.config.ws_path, state.verifier.as_ref())
            .map(|()| resp)
    };

    let upgrade = tokio_tungstenite::accept_hdr_async_with_config(stream, callback, Some(ws_config));
    let Ok(result) = timeout(state.config.handshake_timeout(), upgrade).await else {
        counters::auth_total("timeout");
        tracing::debug!(peer = %peer_addr, "handshake timed out");
        return Err(RelayError::HandshakeTimeout);
    };

    match result {
        Ok(ws) => {
            let identity = handshake.identity.ok_or(RelayError::ConnectionClosed)?;
            counters::auth_total("accepted");
            Ok((identity, ws))
        }
        Err(e) => match handshake.rejection {
            Some(reason) => {
                counters::auth_total("rejected");
                tracing::debug!(peer = %peer_addr, %reason, "rejected connection");
                Err(RelayError::Unauthorized(reason))
            }
            None => Err(RelayError::WebSocket(e)),
        },
    }
}

/// Drive one accepted TCP stream from handshake to teardown.
pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<(), RelayError> {
    let (identity, ws_stream) = accept(stream, peer_addr, &state).await?;
    tracing::debug!(peer = %peer_addr, identity = %identity, "connection authenticated");

    let (ws_tx, ws_rx) = ws_stream.split();
    let conn: Arc<dyn Connection> =
        Arc::new(WsConnection::new(ws_tx, state.config.write_timeout()));

    let mut session = Session::new(
        identity,
        conn,
        Arc::clone(&state.registry),
        state.router.clone(),
        SessionOptions::from(&state.config),
    );
    session.run(ws_rx).await
}
