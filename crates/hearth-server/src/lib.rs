//! WebSocket edge: authentication, per-connection reader/writer tasks, and
//! routing of decoded envelopes into the engine.

pub mod auth;
pub mod connection;
pub mod dispatch;
pub mod server;

pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
