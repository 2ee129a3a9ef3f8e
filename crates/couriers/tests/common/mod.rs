#![allow(dead_code)]

use courier_common::OutboundMessage;
use couriers::auth::{Claims, JwtVerifier};
use couriers::config::ServerConfig;
use couriers::server::ServerState;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub const SECRET: &[u8] = b"integration-secret";

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn test_config(listen: SocketAddr) -> ServerConfig {
    ServerConfig {
        listen,
        metrics_addr: "127.0.0.1:0".parse().unwrap(),
        ws_path: "/ws".to_string(),
        max_conns: 1000,
        max_payload: 65_536,
        route_queue: 64,
        write_timeout: 5,
        ping_interval: 30,
        idle_timeout: 120,
        shutdown_timeout: 5,
        evict_superseded: false,
        handshake_timeout: 5,
    }
}

fn unix_now() -> i64 {
    i64::try_from(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs(),
    )
    .unwrap()
}

/// Mint an HS256 token for `email` expiring `ttl_secs` from now (negative
/// for an already expired token).
pub fn mint_token(email: &str, ttl_secs: i64) -> String {
    mint_token_with_secret(email, ttl_secs, SECRET)
}

pub fn mint_token_with_secret(email: &str, ttl_secs: i64, secret: &[u8]) -> String {
    let now = unix_now();
    let claims = Claims {
        sub: email.to_string(),
        email: email.to_string(),
        iss: None,
        iat: u64::try_from(now).unwrap(),
        exp: u64::try_from(now + ttl_secs).unwrap(),
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret),
    )
    .unwrap()
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(tweak: impl FnOnce(&mut ServerConfig)) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut config = test_config(addr);
        tweak(&mut config);

        let verifier = Arc::new(JwtVerifier::new(SECRET, None));
        let (state, router) = ServerState::new(config, verifier);
        let (tx, rx) = oneshot::channel();

        let task = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                let shutdown = async {
                    let _ = rx.await;
                };
                if let Err(e) = couriers::serve(listener, state, router, shutdown).await {
                    eprintln!("server error in test: {e}");
                }
            }
        });

        Self {
            addr,
            state,
            shutdown: Some(tx),
            task,
        }
    }

    /// Trigger graceful shutdown and wait for `serve` to return.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        tokio::time::timeout(Duration::from_secs(10), &mut self.task)
            .await
            .expect("server did not shut down")
            .unwrap();
    }

    /// Wait until `identity` has a registry entry.
    pub async fn wait_registered(&self, identity: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.registry.lookup(identity).is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("identity never registered");
    }

    /// Wait until the entry for `identity` belongs to a connection other
    /// than `old_id`.
    pub async fn wait_replaced(&self, identity: &str, old_id: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self
                .state
                .registry
                .lookup(identity)
                .map_or(true, |h| h.id == old_id)
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("identity never re-registered");
    }

    /// Wait until `identity` has no registry entry.
    pub async fn wait_deregistered(&self, identity: &str) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.registry.lookup(identity).is_some() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("identity never deregistered");
    }
}

/// Attempt a WebSocket upgrade, returning the HTTP status on refusal.
pub async fn try_connect(
    addr: &SocketAddr,
    path: &str,
    authorization: Option<&str>,
) -> Result<Ws, StatusCode> {
    let mut req = format!("ws://{addr}{path}").into_client_request().unwrap();
    if let Some(value) = authorization {
        req.headers_mut()
            .insert("Authorization", value.parse().unwrap());
    }
    match tokio_tungstenite::connect_async(req).await {
        Ok((ws, _)) => Ok(ws),
        Err(tungstenite::Error::Http(resp)) => Err(resp.status()),
        Err(e) => panic!("unexpected connect error: {e}"),
    }
}

pub struct TestClient {
    pub ws_tx: SplitSink<Ws, Message>,
    pub ws_rx: SplitStream<Ws>,
    pub identity: String,
}

impl TestClient {
    /// Connect as `identity` and wait for the server to register it.
    pub async fn connect(server: &TestServer, identity: &str) -> Self {
        let token = mint_token(identity, 600);
        let ws = try_connect(&server.addr, "/ws", Some(&format!("Bearer {token}")))
            .await
            .expect("upgrade refused");
        server.wait_registered(identity).await;
        let (ws_tx, ws_rx) = ws.split();
        Self {
            ws_tx,
            ws_rx,
            identity: identity.to_string(),
        }
    }

    pub async fn send(&mut self, recipient: &str, body: &str) {
        let text = serde_json::json!({ "recipient": recipient, "message": body }).to_string();
        self.send_raw(&text).await;
    }

    pub async fn send_raw(&mut self, text: &str) {
        self.ws_tx
            .send(Message::Text(text.to_string()))
            .await
            .unwrap();
    }

    /// Next relayed message, skipping control frames.
    pub async fn recv(&mut self) -> OutboundMessage {
        self.recv_timeout(Duration::from_secs(5))
            .await
            .expect("timeout waiting for message")
    }

    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<OutboundMessage> {
        let next = async {
            loop {
                match self.ws_rx.next().await {
                    Some(Ok(Message::Text(text))) => {
                        return Some(OutboundMessage::decode(text.as_bytes()).unwrap())
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                    _ => return None,
                }
            }
        };
        tokio::time::timeout(timeout, next).await.ok().flatten()
    }

    /// Wait for the server to close this connection.
    pub async fn expect_closed(&mut self) {
        let closed = async {
            loop {
                match self.ws_rx.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return,
                    Some(Ok(_)) => {}
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(5), closed)
            .await
            .expect("connection was not closed");
    }

    pub async fn close(mut self) {
        let _ = self.ws_tx.close().await;
    }
}
