//! # wakegate-server
//!
//! HTTP ingress for device traffic plus the read endpoints for devices,
//! sessions and snapshots. Inbound firmware messages arrive as
//! `{topic, payload}` envelopes and are answered with the command the
//! engine produced, if any.

#![deny(unsafe_code)]

pub mod error;
pub mod handlers;
pub mod health;
pub mod server;

pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
