//! Local IPC layer.
//!
//! Provides a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! server speaking newline-delimited JSON-RPC with the desktop client.

pub mod methods;
pub mod server;
