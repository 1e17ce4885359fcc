//! Secrets bridge service.
//!
//! A short-lived mutual-TLS server that hands named secrets, and optionally
//! SSH agent access, to clients holding the bridge descriptor it printed at
//! startup. The client half races the descriptor's endpoints and uses the
//! first that answers.

pub mod agent;
pub mod client;
pub mod config;
pub mod exec;
pub mod lifecycle;
pub mod protocol;
pub mod server;

pub use client::BridgeClient;
pub use config::{ClientOptions, ServeConfig};
pub use lifecycle::ShutdownReason;
pub use secrets_bridge_core::{BridgeDescriptor, Error, Result};
pub use server::BridgeServer;
