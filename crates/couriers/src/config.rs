use clap::Parser;
use courier_common::types::DEFAULT_WS_PATH;
use std::net::SocketAddr;
use std::time::Duration;

/// CLI arguments for the relay server.
#[derive(Parser, Debug, Clone)]
#[command(name = "couriers")]
#[command(about = "Courier relay server")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:8080", env = "COURIER_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics and health endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "COURIER_METRICS")]
    pub metrics_addr: SocketAddr,
    /// HTTP path that accepts WebSocket upgrades.
    #[arg(long, default_value = DEFAULT_WS_PATH, env = "COURIER_WS_PATH")]
    pub ws_path: String,
    /// Shared HS256 secret used to verify bearer tokens.
    #[arg(long, env = "COURIER_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,
    /// Expected `iss` claim. Unchecked when absent.
    #[arg(long, env = "COURIER_JWT_ISSUER")]
    pub jwt_issuer: Option<String>,
    /// Maximum total concurrent connections.
    #[arg(long, default_value = "100000", env = "COURIER_MAX_CONNS")]
    pub max_conns: usize,
    /// Maximum inbound WebSocket message size in bytes.
    #[arg(long, default_value = "65536", env = "COURIER_MAX_PAYLOAD")]
    pub max_payload: usize,
    /// Capacity of the router queue. Senders wait when it is full.
    #[arg(long, default_value = "1024", env = "COURIER_ROUTE_QUEUE")]
    pub route_queue: usize,
    /// Per-write timeout towards a recipient, in seconds.
    #[arg(long, default_value = "5", env = "COURIER_WRITE_TIMEOUT")]
    pub write_timeout: u64,
    /// Interval between WebSocket pings in seconds.
    #[arg(long, default_value = "30", env = "COURIER_PING_INTERVAL")]
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    #[arg(long, default_value = "120", env = "COURIER_IDLE_TIMEOUT")]
    pub idle_timeout: u64,
    /// Hard deadline for graceful shutdown in seconds.
    #[arg(long, default_value = "10", env = "COURIER_SHUTDOWN_TIMEOUT")]
    pub shutdown_timeout: u64,
    /// Time allowed for the HTTP upgrade and credential check, in seconds.
    #[arg(long, default_value = "10", env = "COURIER_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
    /// Close the older connection when the same identity connects again.
    /// By default it stays open until its own read loop ends.
    #[arg(long, env = "COURIER_EVICT_SUPERSEDED")]
    pub evict_superseded: bool,
    /// Increase log verbosity (repeat for more detail).
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address to listen on.
    pub listen: SocketAddr,
    /// Socket address for the metrics and health endpoint.
    pub metrics_addr: SocketAddr,
    /// HTTP path that accepts WebSocket upgrades.
    pub ws_path: String,
    /// Maximum total concurrent connections.
    pub max_conns: usize,
    /// Maximum inbound WebSocket message size in bytes.
    pub max_payload: usize,
    /// Capacity of the router queue.
    pub route_queue: usize,
    /// Per-write timeout in seconds.
    pub write_timeout: u64,
    /// Interval between WebSocket pings in seconds.
    pub ping_interval: u64,
    /// Connection idle timeout in seconds.
    pub idle_timeout: u64,
    /// Hard deadline for graceful shutdown in seconds.
    pub shutdown_timeout: u64,
    /// Close a connection when a newer one registers the same identity.
    pub evict_superseded: bool,
    /// Handshake deadline in seconds.
    pub handshake_timeout: u64,
}

impl ServerConfig {
    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if !self.ws_path.starts_with('/') {
            return Err("ws_path must start with '/'".to_string());
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        const MAX_ALLOWED_PAYLOAD: usize = 16 * 1024 * 1024;
        if self.max_payload == 0 {
            return Err("max_payload must be greater than 0".to_string());
        }
        if self.max_payload > MAX_ALLOWED_PAYLOAD {
            return Err(format!(
                "max_payload exceeds maximum allowed ({} bytes)",
                MAX_ALLOWED_PAYLOAD
            ));
        }

        if self.route_queue == 0 {
            return Err("route_queue must be greater than 0".to_string());
        }
        if self.route_queue > 1_000_000 {
            return Err("route_queue exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.write_timeout == 0 {
            return Err("write_timeout must be greater than 0".to_string());
        }
        if self.write_timeout > 300 {
            return Err("write_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.ping_interval == 0 {
            return Err("ping_interval must be greater than 0".to_string());
        }
        if self.ping_interval > 3600 {
            return Err("ping_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.idle_timeout == 0 {
            return Err("idle_timeout must be greater than 0".to_string());
        }
        if self.idle_timeout > 86_400 {
            return Err(
                "idle_timeout exceeds reasonable limit (86400 seconds / 1 day)".to_string(),
            );
        }
        if self.idle_timeout < self.ping_interval {
            return Err("idle_timeout cannot be shorter than ping_interval".to_string());
        }

        if self.shutdown_timeout == 0 {
            return Err("shutdown_timeout must be greater than 0".to_string());
        }
        if self.shutdown_timeout > 600 {
            return Err("shutdown_timeout exceeds reasonable limit (600 seconds)".to_string());
        }

        if self.handshake_timeout == 0 {
            return Err("handshake_timeout must be greater than 0".to_string());
        }
        if self.handshake_timeout > 300 {
            return Err("handshake_timeout exceeds reasonable limit (300 seconds)".to_string());
        }
        Ok(())
    }

    /// Per-write timeout as a [`Duration`].
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout)
    }

    /// Shutdown deadline as a [`Duration`].
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    /// Handshake deadline as a [`Duration`].
    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }
}

impl From<Args> for ServerConfig {
    fn from(args: Args) -> Self {
        Self {
            listen: args.listen,
            metrics_addr: args.metrics_addr,
            ws_path: args.ws_path,
            max_conns: args.max_conns,
            max_payload: args.max_payload,
            route_queue: args.route_queue,
            write_timeout: args.write_timeout,
            ping_interval: args.ping_interval,
            idle_timeout: args.idle_timeout,
            shutdown_timeout: args.shutdown_timeout,
            evict_superseded: args.evict_superseded,
            handshake_timeout: args.handshake_timeout,
        }
    }
}
