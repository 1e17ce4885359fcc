//! rustls configurations derived from a bridge descriptor.
//!
//! The descriptor's CA is the only trust anchor on both sides. The server
//! requires a client certificate issued by that CA. Running insecure, a
//! client may omit its certificate, but one that is presented is still
//! verified.

use crate::descriptor::BridgeDescriptor;
use crate::pki::ServerIdentity;
use crate::{Error, Result};
use rustls::crypto::CryptoProvider;
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use std::sync::Arc;
use tracing::{debug, warn};

/// Crypto provider used for every bridge connection.
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

fn root_store(descriptor: &BridgeDescriptor) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    roots
        .add(descriptor.ca_cert().clone())
        .map_err(|e| Error::Crypto(format!("Failed to add CA to root store: {e}")))?;
    Ok(roots)
}

/// Server-side configuration presenting `identity`.
pub fn server_config(
    descriptor: &BridgeDescriptor,
    identity: &ServerIdentity,
    insecure: bool,
) -> Result<Arc<ServerConfig>> {
    let provider = crypto_provider();

    let builder = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Crypto(format!("Failed to select TLS versions: {e}")))?;

    let verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(root_store(descriptor)?), provider);
    let verifier = if insecure {
        warn!("Accepting clients without a certificate (insecure mode)");
        verifier.allow_unauthenticated()
    } else {
        debug!("Requiring client certificates issued by the bridge CA");
        verifier
    };
    let verifier = verifier
        .build()
        .map_err(|e| Error::Crypto(format!("Failed to build client verifier: {e}")))?;

    let builder = builder.with_client_cert_verifier(verifier);

    let config = builder
        .with_single_cert(identity.cert_chain.clone(), identity.key.clone_key())
        .map_err(|e| Error::Crypto(format!("Invalid server certificate/key: {e}")))?;

    Ok(Arc::new(config))
}

/// Client-side configuration trusting only the descriptor's CA and
/// presenting the descriptor's client identity.
pub fn client_config(descriptor: &BridgeDescriptor) -> Result<ClientConfig> {
    ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Crypto(format!("Failed to select TLS versions: {e}")))?
        .with_root_certificates(root_store(descriptor)?)
        .with_client_auth_cert(descriptor.client_chain(), descriptor.client_key()?)
        .map_err(|e| Error::Crypto(format!("Invalid client certificate/key: {e}")))
}
