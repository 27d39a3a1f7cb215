//! clawgate library
//!
//! Control-plane WebSocket gateway: challenge-response handshake, per-IP
//! connect limiting, versioned presence/health broadcasts, and a registry of
//! worker node connections.

pub mod auth;
pub mod cli;
pub mod config;
pub mod logging;
pub mod server;
