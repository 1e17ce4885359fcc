//! Bridge descriptor: CA certificate + client identity + server endpoints in a single string.
//!
//! Wire format: gzip-compressed JSON, base64url encoded without padding.
//!
//! The JSON payload has the structure:
//! ```json
//! {"endpoints":["https://10.0.0.5:41234"],"ca_cert":"-----BEGIN CERTIFICATE-----\n...","client_cert":"...","client_key":"..."}
//! ```
//!
//! Decoding also accepts the raw JSON and plain (uncompressed) base64 of it,
//! in the standard or URL-safe alphabet, padded or not.

use crate::{Error, Result};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, URL_SAFE_NO_PAD};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::Zeroizing;

/// File name of the descriptor in the user's home directory.
const DEFAULT_FILE_NAME: &str = ".bridge-conf";

const PADDING_INDIFFERENT: GeneralPurposeConfig =
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent);
const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, PADDING_INDIFFERENT);
const STANDARD_LENIENT: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, PADDING_INDIFFERENT);

#[derive(Serialize)]
struct WireRef<'a> {
    endpoints: &'a [String],
    ca_cert: &'a str,
    client_cert: &'a str,
    client_key: &'a str,
}

#[derive(Deserialize)]
struct Wire {
    #[serde(default)]
    endpoints: Vec<String>,
    #[serde(default)]
    ca_cert: String,
    #[serde(default)]
    client_cert: String,
    #[serde(default)]
    client_key: String,
}

/// Everything a client needs to find and authenticate to a bridge server.
///
/// Construction validates the trust material, so a `BridgeDescriptor` value
/// always holds a single CA certificate and a matching client key pair.
#[derive(Clone)]
pub struct BridgeDescriptor {
    endpoints: Vec<String>,
    ca_cert_pem: String,
    client_cert_pem: String,
    client_key_pem: Zeroizing<String>,
    ca_cert: CertificateDer<'static>,
    client_chain: Vec<CertificateDer<'static>>,
}

impl fmt::Debug for BridgeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BridgeDescriptor")
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

impl BridgeDescriptor {
    pub fn new(
        endpoints: Vec<String>,
        ca_cert_pem: String,
        client_cert_pem: String,
        client_key_pem: String,
    ) -> Result<Self> {
        let client_key_pem = Zeroizing::new(client_key_pem);
        if ca_cert_pem.trim().is_empty() {
            return Err(missing_field("ca_cert"));
        }
        if client_cert_pem.trim().is_empty() {
            return Err(missing_field("client_cert"));
        }
        if client_key_pem.trim().is_empty() {
            return Err(missing_field("client_key"));
        }

        let ca_cert = parse_ca_certificate(&ca_cert_pem)?;
        let client_chain = parse_client_identity(&client_cert_pem, &client_key_pem)?;

        Ok(Self {
            endpoints,
            ca_cert_pem,
            client_cert_pem,
            client_key_pem,
            ca_cert,
            client_chain,
        })
    }

    /// Server addresses, in the order the server listed them.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    pub fn client_cert_pem(&self) -> &str {
        &self.client_cert_pem
    }

    pub fn client_key_pem(&self) -> &str {
        &self.client_key_pem
    }

    /// DER form of the CA certificate (the only trust anchor).
    pub fn ca_cert(&self) -> &CertificateDer<'static> {
        &self.ca_cert
    }

    pub fn client_chain(&self) -> Vec<CertificateDer<'static>> {
        self.client_chain.clone()
    }

    /// DER form of the client private key.
    pub fn client_key(&self) -> Result<PrivateKeyDer<'static>> {
        read_private_key(&self.client_key_pem)
    }

    /// Port of the first endpoint; a restarted server listens here again.
    pub fn listen_port(&self) -> Result<u16> {
        let first = self
            .endpoints
            .first()
            .ok_or_else(|| Error::Config("descriptor has no endpoints".to_string()))?;
        crate::net::endpoint_port(first)
    }

    /// Raw JSON form (accepted by [`BridgeDescriptor::decode`]).
    pub fn to_json(&self) -> Result<String> {
        let wire = WireRef {
            endpoints: &self.endpoints,
            ca_cert: &self.ca_cert_pem,
            client_cert: &self.client_cert_pem,
            client_key: &self.client_key_pem,
        };
        serde_json::to_string(&wire)
            .map_err(|e| Error::Config(format!("JSON serialize error: {e}")))
    }

    /// Encode as gzip-compressed, unpadded base64url JSON.
    pub fn encode(&self) -> Result<String> {
        let json = Zeroizing::new(self.to_json()?);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(json.as_bytes())?;
        let compressed = encoder.finish()?;
        Ok(URL_SAFE_NO_PAD.encode(compressed))
    }

    /// Decode any of the accepted encodings.
    pub fn decode(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.starts_with('{') {
            return Self::from_json(trimmed.as_bytes());
        }

        let compact: String = trimmed.chars().filter(|c| !c.is_ascii_whitespace()).collect();
        let raw = Zeroizing::new(
            URL_SAFE_LENIENT
                .decode(&compact)
                .or_else(|_| STANDARD_LENIENT.decode(&compact))
                .map_err(|e| Error::Config(format!("descriptor is not JSON or base64: {e}")))?,
        );

        if raw.trim_ascii_start().starts_with(b"{") {
            debug!("Decoded uncompressed base64 descriptor");
            return Self::from_json(&raw);
        }

        let mut json = Zeroizing::new(Vec::new());
        GzDecoder::new(raw.as_slice())
            .read_to_end(&mut json)
            .map_err(|e| Error::Config(format!("descriptor payload is not gzip data: {e}")))?;
        Self::from_json(&json)
    }

    fn from_json(bytes: &[u8]) -> Result<Self> {
        let wire: Wire = serde_json::from_slice(bytes)
            .map_err(|e| Error::Config(format!("JSON deserialize error: {e}")))?;
        Self::new(wire.endpoints, wire.ca_cert, wire.client_cert, wire.client_key)
    }

    /// Read and decode a descriptor file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = Zeroizing::new(std::fs::read_to_string(path)?);
        Self::decode(&content)
    }

    /// Write the encoded descriptor with owner-only permissions.
    pub fn save(&self, path: &Path) -> Result<()> {
        let encoded = self.encode()?;
        crate::pki::write_private_file(path, encoded.as_bytes())?;
        debug!("Wrote bridge descriptor to {:?}", path);
        Ok(())
    }

    /// `~/.bridge-conf`
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(DEFAULT_FILE_NAME)
    }
}

fn missing_field(name: &'static str) -> Error {
    Error::Config(format!("missing required field: {name}"))
}

fn parse_ca_certificate(ca_pem: &str) -> Result<CertificateDer<'static>> {
    let blocks = pem::parse_many(ca_pem)
        .map_err(|e| Error::Config(format!("invalid CA certificate PEM: {e}")))?;

    let [block] = blocks.as_slice() else {
        return Err(Error::Config(format!(
            "CA certificate must be exactly one PEM block, found {}",
            blocks.len()
        )));
    };
    if block.tag() != "CERTIFICATE" {
        return Err(Error::Config(format!(
            "CA PEM block is {:?}, expected CERTIFICATE",
            block.tag()
        )));
    }
    if block.headers().iter().next().is_some() {
        return Err(Error::Config("CA PEM block carries headers".to_string()));
    }

    x509_parser::parse_x509_certificate(block.contents())
        .map_err(|e| Error::Config(format!("invalid CA certificate: {e}")))?;

    Ok(CertificateDer::from(block.contents().to_vec()))
}

fn parse_client_identity(cert_pem: &str, key_pem: &str) -> Result<Vec<CertificateDer<'static>>> {
    let chain = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::Config(format!("invalid client certificate PEM: {e}")))?;
    if chain.is_empty() {
        return Err(Error::Config(
            "client certificate PEM contains no certificate".to_string(),
        ));
    }

    let key = read_private_key(key_pem)?;
    let signing_key = crate::tls::crypto_provider()
        .key_provider
        .load_private_key(key)
        .map_err(|e| Error::Config(format!("unsupported client key: {e}")))?;

    CertifiedKey::new(chain.clone(), signing_key)
        .keys_match()
        .map_err(|e| Error::Config(format!("client certificate and key do not match: {e}")))?;

    Ok(chain)
}

fn read_private_key(key_pem: &str) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| Error::Config(format!("invalid client key PEM: {e}")))?
        .ok_or_else(|| Error::Config("client key PEM contains no private key".to_string()))
}
