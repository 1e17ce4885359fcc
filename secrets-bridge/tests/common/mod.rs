//! Shared fixture: an in-process bridge server on an ephemeral port.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use secrets_bridge::{BridgeDescriptor, BridgeServer, Result, ServeConfig, ShutdownReason};
use secrets_bridge_core::SecretSource;
use tempfile::TempDir;
use tokio::task::JoinHandle;

// Install default crypto provider for rustls
pub fn install_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    });
}

/// Running server plus the descriptor a client needs to reach it
pub struct TestFixture {
    pub temp_dir: TempDir,
    pub descriptor: BridgeDescriptor,
    pub server_addr: SocketAddr,
    server: Option<JoinHandle<Result<ShutdownReason>>>,
}

impl TestFixture {
    /// Server holding `secrets` (as `key=value` specs)
    pub async fn new(secrets: &[&str]) -> Self {
        Self::with_config(secrets, |_| {}).await
    }

    pub async fn with_config(secrets: &[&str], customize: impl FnOnce(&mut ServeConfig)) -> Self {
        install_crypto_provider();

        let temp_dir = TempDir::new().unwrap();
        let mut config = ServeConfig {
            bridge_conf_file: temp_dir.path().join("bridge-conf"),
            secrets: secrets
                .iter()
                .map(|spec| SecretSource::parse_literal(spec).unwrap())
                .collect(),
            ..Default::default()
        };
        customize(&mut config);

        let server = BridgeServer::bind(&config).await.unwrap();
        let descriptor = server.descriptor().clone();
        let server_addr = server.local_addr();
        let server = tokio::spawn(server.serve());

        Self {
            temp_dir,
            descriptor,
            server_addr,
            server: Some(server),
        }
    }

    pub fn port(&self) -> u16 {
        self.server_addr.port()
    }

    /// `https://127.0.0.1:<port>`
    pub fn loopback_endpoint(&self) -> String {
        format!("https://127.0.0.1:{}", self.port())
    }

    /// The server's trust material with a different endpoint list.
    pub fn descriptor_with_endpoints(&self, endpoints: Vec<String>) -> BridgeDescriptor {
        BridgeDescriptor::new(
            endpoints,
            self.descriptor.ca_cert_pem().to_string(),
            self.descriptor.client_cert_pem().to_string(),
            self.descriptor.client_key_pem().to_string(),
        )
        .unwrap()
    }

    /// Wait for the server task to finish on its own.
    pub async fn stopped(&mut self) -> ShutdownReason {
        let server = self.server.take().expect("server already awaited");
        tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap()
    }
}

impl Drop for TestFixture {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

/// An endpoint on a loopback port nothing listens on.
pub fn closed_endpoint() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("https://127.0.0.1:{port}")
}
