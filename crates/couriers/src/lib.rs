//! Courier relay server: authenticated WebSocket point-to-point message router.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Bearer-token verification.
pub mod auth;
/// CLI argument parsing and server configuration.
pub mod config;
/// Per-connection writer and handshake handling.
pub mod connection;
/// Error types for relay server operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Identity-keyed table of live connections.
pub mod registry;
/// Single-worker message dispatch.
pub mod router;
/// Accept loop and shared server state.
pub mod server;
/// Per-connection lifecycle.
pub mod session;

pub use server::{run_with_shutdown, serve, ServerState};
