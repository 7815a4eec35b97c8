//! Per-connection sandbox sessions over WebSocket.
//!
//! Every accepted connection gets a dedicated, disposable container. The
//! connection's messages run against that session in order, and the
//! container is stopped and removed however the connection ends.

pub mod channel;
pub mod cli;
pub mod codec;
pub mod handler;
pub mod lifecycle;
pub mod provider;
pub mod router;
pub mod server;
pub mod store;
pub mod testing;

pub use server::{run_server, serve, ServeError, ServerConfig};
