//! Core type definitions and protocol constants.

/// Opaque name of an addressable endpoint, e.g. an email address.
///
/// The relay never parses or validates identities; it only compares them.
pub type Identity = String;

/// Default HTTP path that accepts WebSocket upgrades.
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Scheme prefix expected in the `Authorization` header.
pub const BEARER_PREFIX: &str = "Bearer ";
