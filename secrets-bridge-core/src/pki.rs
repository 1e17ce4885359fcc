//! Ephemeral certificate authority for one bridge session.
//!
//! Handles:
//! - CA key and self-signed certificate generation
//! - Client identity issuance (embedded in the bridge descriptor)
//! - Server leaf issuance (kept in memory by the serving process)
//! - CA key persistence and reuse across restarts

use crate::descriptor::BridgeDescriptor;
use crate::{Error, Result};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Default lifetime of every minted certificate.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(60 * 60);

const ORGANIZATION: &str = "secrets-bridge";
const CA_COMMON_NAME: &str = "secrets-bridge-server";
const CLIENT_COMMON_NAME: &str = "secrets-bridge";
const SERVER_COMMON_NAME: &str = "secrets-bridge-listener";

/// TLS identity presented by the bridge server.
pub struct ServerIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for ServerIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl fmt::Debug for ServerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerIdentity")
            .field("cert_chain", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// Key material produced by a bootstrap.
pub struct Minted {
    pub descriptor: BridgeDescriptor,
    pub server_identity: ServerIdentity,
    ca_key_pem: Zeroizing<String>,
}

impl fmt::Debug for Minted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Minted")
            .field("descriptor", &self.descriptor)
            .field("server_identity", &self.server_identity)
            .finish_non_exhaustive()
    }
}

impl Minted {
    /// Persist the CA private key (0600) so a restart can reuse the same descriptor.
    pub fn persist_ca_key(&self, path: &Path) -> Result<()> {
        write_private_file(path, self.ca_key_pem.as_bytes())?;
        debug!("Wrote CA key to {:?}", path);
        Ok(())
    }
}

/// Mint a fresh CA, client identity and server leaf.
///
/// `addresses` become IP subject-alternative-names on the CA and the server
/// leaf; `endpoints` are recorded verbatim in the descriptor.
pub fn mint(endpoints: Vec<String>, addresses: &[IpAddr], validity: Duration) -> Result<Minted> {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = now + validity;

    let ca_key = generate_rsa_key("CA")?;
    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name = distinguished_name(CA_COMMON_NAME);
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    ca_params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    ca_params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    ca_params.subject_alt_names = addresses.iter().copied().map(SanType::IpAddress).collect();
    ca_params.not_before = now;
    ca_params.not_after = not_after;

    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| Error::Crypto(format!("Failed to create CA certificate: {e}")))?;

    let client_key = generate_rsa_key("client")?;
    let mut client_params = CertificateParams::default();
    client_params.distinguished_name = distinguished_name(CLIENT_COMMON_NAME);
    client_params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    client_params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ClientAuth,
        ExtendedKeyUsagePurpose::ServerAuth,
    ];
    client_params.not_before = now;
    client_params.not_after = not_after;

    let client_cert = client_params
        .signed_by(&client_key, &ca_cert, &ca_key)
        .map_err(|e| Error::Crypto(format!("Failed to sign client certificate: {e}")))?;

    let server_identity = issue_server_identity(&ca_cert, &ca_key, addresses, not_after)?;

    let descriptor = BridgeDescriptor::new(
        endpoints,
        ca_cert.pem(),
        client_cert.pem(),
        client_key.serialize_pem(),
    )?;

    info!(
        addresses = addresses.len(),
        validity_secs = validity.as_secs(),
        "Minted bridge CA and client identity"
    );

    Ok(Minted {
        descriptor,
        server_identity,
        ca_key_pem: Zeroizing::new(ca_key.serialize_pem()),
    })
}

/// Rebuild a bootstrap from a persisted CA key and the descriptor it produced.
///
/// The descriptor is returned unchanged so downstream consumers keep working;
/// only the in-memory server leaf is reissued. Fails if the CA certificate
/// has expired or the stored key does not belong to it.
pub fn reuse(ca_key_store: &Path, previous: &BridgeDescriptor) -> Result<Minted> {
    let ca_key_pem = Zeroizing::new(fs::read_to_string(ca_key_store)?);
    let ca_key = KeyPair::from_pem(&ca_key_pem)
        .map_err(|e| Error::Crypto(format!("Failed to parse CA key: {e}")))?;

    let (_, parsed) = x509_parser::parse_x509_certificate(previous.ca_cert())
        .map_err(|e| Error::Crypto(format!("Failed to parse CA certificate: {e}")))?;
    if parsed.public_key().subject_public_key.data.as_ref() != ca_key.public_key_raw() {
        return Err(Error::Crypto(format!(
            "CA key in {} does not match the cached CA certificate",
            ca_key_store.display()
        )));
    }

    let ca_params = CertificateParams::from_ca_cert_pem(previous.ca_cert_pem())
        .map_err(|e| Error::Crypto(format!("Failed to parse CA certificate: {e}")))?;
    let not_after = ca_params.not_after;
    if not_after <= ::time::OffsetDateTime::now_utc() {
        return Err(Error::Crypto(format!(
            "cached CA certificate expired at {not_after}"
        )));
    }

    let addresses: Vec<IpAddr> = ca_params
        .subject_alt_names
        .iter()
        .filter_map(|san| match san {
            SanType::IpAddress(ip) => Some(*ip),
            _ => None,
        })
        .collect();

    // Same subject and key identifier as the cached certificate, so leaves
    // signed by it chain to the original trust anchor.
    let issuer = ca_params
        .self_signed(&ca_key)
        .map_err(|e| Error::Crypto(format!("Failed to reconstruct CA certificate: {e}")))?;

    let server_identity = issue_server_identity(&issuer, &ca_key, &addresses, not_after)?;

    info!(
        ca_key_store = %ca_key_store.display(),
        expires = %not_after,
        "Reusing cached bridge CA"
    );

    Ok(Minted {
        descriptor: previous.clone(),
        server_identity,
        ca_key_pem,
    })
}

fn issue_server_identity(
    ca_cert: &Certificate,
    ca_key: &KeyPair,
    addresses: &[IpAddr],
    not_after: ::time::OffsetDateTime,
) -> Result<ServerIdentity> {
    let server_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| Error::Crypto(format!("Failed to generate server key: {e}")))?;

    let mut params = CertificateParams::default();
    params.distinguished_name = distinguished_name(SERVER_COMMON_NAME);
    params.not_before = ::time::OffsetDateTime::now_utc();
    params.not_after = not_after;

    let localhost = rcgen::Ia5String::try_from("localhost")
        .map_err(|e| Error::Crypto(format!("Invalid DNS name: {e}")))?;
    params.subject_alt_names = addresses
        .iter()
        .copied()
        .map(SanType::IpAddress)
        .chain(std::iter::once(SanType::DnsName(localhost)))
        .collect();

    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let server_cert = params
        .signed_by(&server_key, ca_cert, ca_key)
        .map_err(|e| Error::Crypto(format!("Failed to sign server certificate: {e}")))?;

    Ok(ServerIdentity {
        cert_chain: vec![server_cert.der().clone()],
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(server_key.serialize_der())),
    })
}

fn generate_rsa_key(role: &str) -> Result<KeyPair> {
    KeyPair::generate_rsa_for(&rcgen::PKCS_RSA_SHA256, rcgen::RsaKeySize::_2048)
        .map_err(|e| Error::Crypto(format!("Failed to generate {role} key: {e}")))
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    dn.push(DnType::OrganizationName, ORGANIZATION);
    dn
}

/// Write a file readable only by the owner (0600 on Unix).
pub(crate) fn write_private_file(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        std::io::Write::write_all(&mut file, content)?;
    }

    #[cfg(not(unix))]
    {
        fs::write(path, content)?;
    }

    Ok(())
}
