//! Core of the secrets bridge.
//!
//! This crate provides everything that does not depend on the HTTP layer:
//! - Ephemeral PKI bootstrap and CA key reuse
//! - Bridge descriptor encoding/decoding
//! - rustls client/server configuration from a descriptor
//! - The secret store and its encoding prefixes
//! - A first-success combinator for endpoint races
//! - The byte relay behind agent tunnels

pub mod descriptor;
mod error;
pub mod net;
pub mod pki;
pub mod race;
pub mod relay;
pub mod secrets;
pub mod tls;

pub use descriptor::BridgeDescriptor;
pub use error::{Error, Result};
pub use pki::{Minted, ServerIdentity};
pub use secrets::{SecretSource, SecretStore};
