use crate::auth::IdentityVerifier;
use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::RelayError;
use crate::registry::Registry;
use crate::router::{self, stopped, Router, RouterHandle};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Shared state for the relay server.
pub struct ServerState {
    /// Identity → connection table.
    pub registry: Arc<Registry>,
    /// Intake for the single routing worker.
    pub router: RouterHandle,
    /// Checks bearer credentials during the handshake.
    pub verifier: Arc<dyn IdentityVerifier>,
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Connections currently holding a slot, authenticated or not.
    pub active_connections: AtomicUsize,
}

impl ServerState {
    /// Build shared state plus the router worker that must be driven
    /// alongside the accept loop (see [`serve`]).
    #[must_use]
    pub fn new(config: ServerConfig, verifier: Arc<dyn IdentityVerifier>) -> (Arc<Self>, Router) {
        let registry = Arc::new(Registry::new());
        let (handle, router) = router::channel(Arc::clone(&registry), config.route_queue);
        let state = Arc::new(Self {
            registry,
            router: handle,
            verifier,
            config,
            active_connections: AtomicUsize::new(0),
        });
        (state, router)
    }
}

/// Counts against `max_conns` for as long as it is held.
struct ConnectionSlot {
    state: Arc<ServerState>,
}

impl ConnectionSlot {
    fn acquire(state: &Arc<ServerState>) -> Option<Self> {
        // increment first so two racing accepts cannot both pass the check
        let prev = state.active_connections.fetch_add(1, Ordering::AcqRel);
        if prev >= state.config.max_conns {
            state.active_connections.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Self {
            state: Arc::clone(state),
        })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.active_connections.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Accept connections until `shutdown` flips to `true` (or its sender is
/// dropped). Returns the still-running connection tasks.
async fn accept_until(
    listener: TcpListener,
    state: &Arc<ServerState>,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<JoinSet<()>, RelayError> {
    let local_addr = listener.local_addr()?;
    info!("server listening on {}", local_addr);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    let Some(slot) = ConnectionSlot::acquire(state) else {
                        warn!("max connections reached, rejecting {}", addr);
                        drop(stream);
                        continue;
                    };
                    let state = Arc::clone(state);
                    tasks.spawn(async move {
                        let _slot = slot;
                        if let Err(e) = handle_connection(stream, addr, state).await {
                            debug!("connection from {} closed: {}", addr, e);
                        }
                    });
                }
                Err(e) => error!("failed to accept connection: {}", e),
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            () = stopped(shutdown) => {
                info!("shutdown signal received, draining {} connections", tasks.len());
                return Ok(tasks);
            }
        }
    }
}

/// Close every registered connection and wait for connection tasks, all
/// before `deadline`. Whatever is still running then is aborted.
async fn drain(state: &ServerState, mut tasks: JoinSet<()>, deadline: Instant) {
    // the registry is swept on first poll, so a timeout here only skips
    // waiting for the close handshakes
    match timeout_at(deadline, state.registry.close_all()).await {
        Ok(closed) => debug!(closed, "closed registered connections"),
        Err(_) => warn!("close handshakes did not finish before the deadline"),
    }

    while !tasks.is_empty() {
        if timeout_at(deadline, tasks.join_next()).await.is_err() {
            warn!(
                "drain timeout reached with {} connections still active, aborting",
                tasks.len()
            );
            tasks.abort_all();
            break;
        }
    }
}

/// Run the accept loop with an externally-controlled shutdown signal.
///
/// The router worker returned by [`ServerState::new`] must be driven
/// separately; [`serve`] does both. Once `shutdown` flips to `true` (or its
/// sender is dropped) the listener is closed, every registered connection
/// is closed, and in-flight connection tasks get `shutdown_timeout` to
/// finish before being aborted.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), RelayError> {
    let tasks = accept_until(listener, &state, &mut shutdown).await?;
    let deadline = Instant::now() + state.config.shutdown_timeout();
    drain(&state, tasks, deadline).await;
    info!("server shut down");
    Ok(())
}

/// Drive the accept loop and the router worker together until `shutdown`
/// resolves. Teardown (closing connections, joining their tasks, draining
/// the router queue) shares one deadline, `shutdown_timeout` from the
/// moment `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn serve<F>(
    listener: TcpListener,
    state: Arc<ServerState>,
    router: Router,
    shutdown: F,
) -> Result<(), RelayError>
where
    F: Future<Output = ()> + Send,
{
    let (server_stop, mut server_rx) = watch::channel(false);
    let (router_stop, router_rx) = watch::channel(false);
    let mut router_task = tokio::spawn(router.run_with_shutdown(router_rx));

    let accepting = accept_until(listener, &state, &mut server_rx);
    tokio::pin!(accepting);
    tokio::pin!(shutdown);

    let tasks = tokio::select! {
        tasks = &mut accepting => tasks,
        () = &mut shutdown => {
            server_stop.send_replace(true);
            accepting.await
        }
    };
    let deadline = Instant::now() + state.config.shutdown_timeout();

    let result = match tasks {
        Ok(tasks) => {
            drain(&state, tasks, deadline).await;
            Ok(())
        }
        Err(e) => Err(e),
    };

    router_stop.send_replace(true);
    if timeout_at(deadline, &mut router_task).await.is_err() {
        warn!("router did not drain in time, aborting");
        router_task.abort();
    }

    info!("server shut down");
    result
}
