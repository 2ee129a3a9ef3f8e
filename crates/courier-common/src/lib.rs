//! Common types shared across the courier relay stack.
//!
//! This crate provides:
//! - Identity and protocol constants ([`types`])
//! - JSON message shapes exchanged over the socket ([`message`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod message;
pub mod types;

pub use message::{Envelope, InboundMessage, MessageError, OutboundMessage};
pub use types::Identity;
