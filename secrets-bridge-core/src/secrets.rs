//! In-memory secret store with base64 encoding prefixes.
//!
//! A name may start with one of:
//!
//! | prefix   | alphabet | padding |
//! |----------|----------|---------|
//! | `b64:`   | standard | yes     |
//! | `b64u:`  | URL-safe | yes     |
//! | `rb64:`  | standard | no      |
//! | `rb64u:` | URL-safe | no      |
//!
//! On `add` the value is decoded with that alphabet before storing under the
//! bare name; on `get` the stored bytes are encoded with it.

use crate::{Error, Result};
use base64::engine::general_purpose::{GeneralPurpose, STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use zeroize::Zeroizing;

const PREFIXES: [(&str, &GeneralPurpose); 4] = [
    ("b64:", &STANDARD),
    ("b64u:", &URL_SAFE),
    ("rb64:", &STANDARD_NO_PAD),
    ("rb64u:", &URL_SAFE_NO_PAD),
];

/// Split an encoding prefix off a secret name.
fn split_prefix(name: &str) -> (Option<&'static GeneralPurpose>, &str) {
    for (prefix, engine) in PREFIXES {
        if let Some(bare) = name.strip_prefix(prefix) {
            return (Some(engine), bare);
        }
    }
    (None, name)
}

/// Secrets held by the bridge server. Populated at startup, read-only while serving.
#[derive(Default)]
pub struct SecretStore {
    secrets: HashMap<String, Zeroizing<Vec<u8>>>,
}

impl fmt::Debug for SecretStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretStore")
            .field("names", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl SecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `name`, decoding it first if `name` carries a prefix.
    ///
    /// Line breaks in encoded values are ignored. On decode failure the store
    /// is left unchanged.
    pub fn add(&mut self, name: &str, value: &[u8]) -> Result<()> {
        let (engine, bare) = split_prefix(name);
        let value = match engine {
            Some(engine) => {
                let compact: Vec<u8> = value
                    .iter()
                    .copied()
                    .filter(|b| *b != b'\r' && *b != b'\n')
                    .collect();
                engine.decode(compact).map_err(|e| {
                    Error::Config(format!("secret {bare:?} is not valid for {name:?}: {e}"))
                })?
            }
            None => value.to_vec(),
        };

        self.secrets.insert(bare.to_string(), Zeroizing::new(value));
        Ok(())
    }

    /// Look up `name`, encoding the stored bytes if `name` carries a prefix.
    pub fn get(&self, name: &str) -> Option<Zeroizing<Vec<u8>>> {
        let (engine, bare) = split_prefix(name);
        let secret = self.secrets.get(bare)?;
        Some(match engine {
            Some(engine) => Zeroizing::new(engine.encode(secret.as_slice()).into_bytes()),
            None => secret.clone(),
        })
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Add every source in order, stopping at the first failure.
    pub fn load(&mut self, sources: &[SecretSource]) -> Result<()> {
        for source in sources {
            match source {
                SecretSource::Literal { name, value } => self.add(name, value.as_bytes())?,
                SecretSource::File { name, path } => {
                    let content = Zeroizing::new(std::fs::read(path).map_err(|e| {
                        Error::Config(format!("cannot read secret file {}: {e}", path.display()))
                    })?);
                    self.add(name, &content)?;
                }
            }
        }
        Ok(())
    }
}

/// Where a secret comes from.
#[derive(Clone, PartialEq, Eq)]
pub enum SecretSource {
    /// `name=value`
    Literal { name: String, value: Zeroizing<String> },
    /// `name=path`, or a bare `path` used as its own name
    File { name: String, path: PathBuf },
}

impl fmt::Debug for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SecretSource::Literal { name, .. } => write!(f, "Literal({name:?})"),
            SecretSource::File { name, path } => write!(f, "File({name:?}, {path:?})"),
        }
    }
}

impl SecretSource {
    pub fn parse_literal(spec: &str) -> Result<Self> {
        match spec.split_once('=') {
            Some((name, value)) if !name.is_empty() => Ok(SecretSource::Literal {
                name: name.to_string(),
                value: Zeroizing::new(value.to_string()),
            }),
            _ => Err(Error::Config(format!(
                "invalid secret {:?}: expected key=value",
                spec.split('=').next().unwrap_or_default()
            ))),
        }
    }

    pub fn parse_file(spec: &str) -> Result<Self> {
        let (name, path) = spec.split_once('=').unwrap_or((spec, spec));
        if name.is_empty() || path.is_empty() {
            return Err(Error::Config(format!(
                "invalid secret file spec {spec:?}: expected key=filename"
            )));
        }
        Ok(SecretSource::File {
            name: name.to_string(),
            path: PathBuf::from(path),
        })
    }
}
