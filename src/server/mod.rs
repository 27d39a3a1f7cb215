//! Server module
//!
//! HTTP surface, WebSocket gateway, and the abuse-prevention pieces shared
//! between them.

pub mod http;
pub mod origin;
pub mod ratelimit;
pub mod startup;
pub mod ws;

pub use http::create_router;
pub use startup::{run_server_with_config, ServerConfig, ServerHandle};
pub use ws::WsServerState;
