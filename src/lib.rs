#![forbid(unsafe_code)]

//! JSON-RPC 2.0 sidecar that drives Claude and Codex agent CLIs on behalf of
//! a desktop client over a local socket.

pub mod config;
pub mod errors;
pub mod ipc;
pub mod models;
pub mod orchestrator;
pub mod registry;
pub mod rpc;
pub mod runtime;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
