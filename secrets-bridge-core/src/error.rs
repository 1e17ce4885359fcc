use thiserror::Error;

/// Errors produced by the bridge core.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or undecodable descriptor, secret spec or configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key generation, certificate signing/parsing, or key-pair mismatch
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Listen, dial, accept or address enumeration failure
    #[error("Network error: {0}")]
    Network(String),

    /// Unexpected status code or body from a peer
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    /// Every candidate endpoint failed its liveness probe
    #[error("no valid endpoints found, tried: {tried:?}")]
    NoEndpoint { tried: Vec<String> },

    /// Daemonization or shutdown path failure
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
