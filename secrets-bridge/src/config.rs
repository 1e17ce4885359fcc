//! Configuration for the bridge server and client commands.
//!
//! Values come from the command line, `SECRETS_BRIDGE_*` environment
//! variables and, for `serve`, an optional TOML file, in that order of
//! precedence. Resolution produces plain records that are passed to
//! constructors; nothing is read from ambient state afterwards.

use crate::exec::ExecRequest;
use secrets_bridge_core::{pki, BridgeDescriptor, Error, Result, SecretSource};
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use zeroize::Zeroizing;

/// Bound on the endpoint race when none is configured.
pub const DEFAULT_RACE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a launcher waits for a detached server to report readiness.
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Environment variable naming the local SSH agent socket.
pub const SSH_AUTH_SOCK: &str = "SSH_AUTH_SOCK";

/// Optional settings file for `serve`. Every field may be omitted.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bridge_conf_file: Option<PathBuf>,
    pub write_conf: Option<bool>,
    pub ca_key_store: Option<PathBuf>,
    pub port: Option<u16>,
    /// Seconds; 0 disables the timeout
    pub timeout: Option<u64>,
    pub insecure: Option<bool>,
    /// Seconds
    pub cert_validity: Option<u64>,
    pub ssh_agent_forwarder: Option<bool>,
    /// `key=value` literals
    #[serde(default)]
    pub secrets: Vec<String>,
    /// `key=filename` specs
    #[serde(default)]
    pub secrets_from_files: Vec<String>,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }

    /// Load `path` if given, else the default file if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default = Self::default_path();
                if default.is_file() {
                    debug!("Using config file {}", default.display());
                    Self::load(&default)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    /// Get the default config file path
    /// - macOS: ~/Library/Application Support/secrets-bridge/config.toml
    /// - Linux: ~/.config/secrets-bridge/config.toml
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("secrets-bridge")
            .join("config.toml")
    }
}

/// Fully resolved server settings.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    /// Port for a freshly minted bridge; 0 picks an ephemeral port
    pub port: u16,
    pub bridge_conf_file: PathBuf,
    /// Write the descriptor to `bridge_conf_file` instead of printing it
    pub write_conf: bool,
    pub ca_key_store: Option<PathBuf>,
    pub secrets: Vec<SecretSource>,
    /// Local agent socket, set when agent forwarding is enabled
    pub agent_socket: Option<PathBuf>,
    /// Hard self-termination deadline
    pub timeout: Option<Duration>,
    pub insecure: bool,
    pub cert_validity: Duration,
    /// Detach and log to this file
    pub daemonize: Option<PathBuf>,
    pub ready_timeout: Duration,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            port: 0,
            bridge_conf_file: BridgeDescriptor::default_path(),
            write_conf: false,
            ca_key_store: None,
            secrets: Vec::new(),
            agent_socket: None,
            timeout: None,
            insecure: false,
            cert_validity: pki::DEFAULT_VALIDITY,
            daemonize: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
        }
    }
}

/// Command-line options for `serve`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ServeArgs {
    /// TOML settings file (default: <config dir>/secrets-bridge/config.toml if present)
    #[arg(long, env = "SECRETS_BRIDGE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Where the bridge descriptor is written, and read back when reusing a CA
    #[arg(short = 'f', long, env = "SECRETS_BRIDGE_CONF_FILE")]
    pub bridge_conf_file: Option<PathBuf>,

    /// Write the descriptor to the bridge conf file instead of printing it
    #[arg(short = 'w', long, env = "SECRETS_BRIDGE_WRITE_CONF")]
    pub write_conf: bool,

    /// Persist the CA key here and reuse it (and the previous descriptor) on restart
    #[arg(long, env = "SECRETS_BRIDGE_CA_KEY_STORE")]
    pub ca_key_store: Option<PathBuf>,

    /// Listen port for a new bridge (0 = ephemeral)
    #[arg(long, env = "SECRETS_BRIDGE_PORT")]
    pub port: Option<u16>,

    /// Literal secret, `key=value`; key may carry a b64:, b64u:, rb64: or rb64u: prefix
    #[arg(
        long = "secret",
        value_name = "KEY=VALUE",
        env = "SECRETS_BRIDGE_SECRET",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub secrets: Vec<String>,

    /// Secret read from a file, `key=filename`; key may carry an encoding prefix
    #[arg(
        long = "secret-from-file",
        value_name = "KEY=FILENAME",
        env = "SECRETS_BRIDGE_SECRET_FROM_FILE",
        value_delimiter = ','
    )]
    pub secrets_from_files: Vec<String>,

    /// Enable SSH agent forwarding to $SSH_AUTH_SOCK
    #[arg(short = 'A', long, env = "SECRETS_BRIDGE_SSH_AGENT_FORWARDER")]
    pub ssh_agent_forwarder: bool,

    /// Seconds before the server exits (0 = never)
    #[arg(short = 't', long, env = "SECRETS_BRIDGE_TIMEOUT")]
    pub timeout: Option<u64>,

    /// Accept clients without a certificate issued by the bridge CA
    #[arg(long, env = "SECRETS_BRIDGE_INSECURE")]
    pub insecure: bool,

    /// Seconds the minted certificates remain valid
    #[arg(long, env = "SECRETS_BRIDGE_CERT_VALIDITY")]
    pub cert_validity: Option<u64>,

    /// Run in the background, logging to this file
    #[arg(short = 'd', long, value_name = "LOGFILE", env = "SECRETS_BRIDGE_DAEMONIZE")]
    pub daemonize: Option<PathBuf>,
}

impl ServeArgs {
    /// Merge with the settings file and validate.
    pub fn resolve(self) -> Result<ServeConfig> {
        let file = FileConfig::load_or_default(self.config.as_deref())?;
        self.resolve_with(file, std::env::var_os(SSH_AUTH_SOCK).map(PathBuf::from))
    }

    fn resolve_with(self, file: FileConfig, ssh_auth_sock: Option<PathBuf>) -> Result<ServeConfig> {
        let defaults = ServeConfig::default();

        let mut secrets = Vec::new();
        for spec in file.secrets.iter().chain(&self.secrets) {
            secrets.push(SecretSource::parse_literal(spec)?);
        }
        for spec in file.secrets_from_files.iter().chain(&self.secrets_from_files) {
            secrets.push(SecretSource::parse_file(spec)?);
        }

        let agent_socket = if self.ssh_agent_forwarder || file.ssh_agent_forwarder.unwrap_or(false)
        {
            Some(ssh_auth_sock.ok_or_else(|| {
                Error::Config(format!(
                    "SSH agent forwarding requested but {SSH_AUTH_SOCK} is not set"
                ))
            })?)
        } else {
            None
        };

        let timeout = match self.timeout.or(file.timeout) {
            None | Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
        };

        let cert_validity = match self.cert_validity.or(file.cert_validity) {
            None => defaults.cert_validity,
            Some(0) => {
                return Err(Error::Config(
                    "certificate validity must be at least one second".to_string(),
                ))
            }
            Some(secs) => Duration::from_secs(secs),
        };

        Ok(ServeConfig {
            port: self.port.or(file.port).unwrap_or(defaults.port),
            bridge_conf_file: self
                .bridge_conf_file
                .or(file.bridge_conf_file)
                .unwrap_or(defaults.bridge_conf_file),
            write_conf: self.write_conf || file.write_conf.unwrap_or(false),
            ca_key_store: self.ca_key_store.or(file.ca_key_store),
            secrets,
            agent_socket,
            timeout,
            insecure: self.insecure || file.insecure.unwrap_or(false),
            cert_validity,
            daemonize: self.daemonize,
            ready_timeout: defaults.ready_timeout,
        })
    }
}

/// Settings for a bridge client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Bound on the whole endpoint race
    pub race_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            race_timeout: DEFAULT_RACE_TIMEOUT,
        }
    }
}

/// Command-line options shared by the client commands.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ClientArgs {
    /// Bridge descriptor text, in any accepted encoding
    #[arg(short = 'c', long, env = "SECRETS_BRIDGE_CONF", hide_env_values = true)]
    pub bridge_conf: Option<String>,

    /// Read the bridge descriptor from this file when --bridge-conf is absent (default: ~/.bridge-conf)
    #[arg(short = 'f', long, env = "SECRETS_BRIDGE_CONF_FILE")]
    pub bridge_conf_file: Option<PathBuf>,

    /// Seconds to wait for any endpoint to answer
    #[arg(long, env = "SECRETS_BRIDGE_RACE_TIMEOUT")]
    pub race_timeout: Option<u64>,
}

impl ClientArgs {
    pub fn descriptor(&self) -> Result<BridgeDescriptor> {
        if let Some(text) = &self.bridge_conf {
            let text = Zeroizing::new(text.clone());
            return BridgeDescriptor::decode(&text);
        }
        let path = self
            .bridge_conf_file
            .clone()
            .unwrap_or_else(BridgeDescriptor::default_path);
        BridgeDescriptor::load(&path).map_err(|e| match e {
            Error::Io(io) => Error::Config(format!(
                "cannot read bridge descriptor {}: {io}",
                path.display()
            )),
            other => other,
        })
    }

    pub fn options(&self) -> ClientOptions {
        ClientOptions {
            race_timeout: self
                .race_timeout
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RACE_TIMEOUT),
        }
    }
}

/// Command-line options for `exec`, besides the shared client ones.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct ExecArgs {
    /// Set ENV to the secret KEY (repeatable)
    #[arg(
        short = 'e',
        long = "env",
        value_name = "ENV=KEY",
        env = "SECRETS_BRIDGE_ENV",
        value_delimiter = ','
    )]
    pub env: Vec<String>,

    /// Do not forward the SSH agent to the command
    #[arg(short = 'A', long, env = "SECRETS_BRIDGE_NO_SSH_AGENT")]
    pub no_ssh_agent: bool,

    /// Path for the forwarded agent socket
    #[arg(long, env = "SECRETS_BRIDGE_AGENT_SOCKET")]
    pub agent_socket: Option<PathBuf>,

    /// Command and its arguments
    #[arg(trailing_var_arg = true, required = true, num_args = 1.., value_name = "COMMAND")]
    pub command: Vec<OsString>,
}

impl ExecArgs {
    pub fn request(self) -> Result<ExecRequest> {
        let env = self
            .env
            .iter()
            .map(|spec| EnvSecret::parse(spec))
            .collect::<Result<Vec<_>>>()?;
        Ok(ExecRequest {
            env,
            forward_agent: !self.no_ssh_agent,
            agent_socket: self.agent_socket,
            command: self.command,
        })
    }
}

/// One `ENV=key` mapping for `exec`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvSecret {
    pub var: String,
    pub key: String,
}

impl EnvSecret {
    pub fn parse(spec: &str) -> Result<Self> {
        match spec.split_once('=') {
            Some((var, key)) if !var.is_empty() && !key.is_empty() => Ok(Self {
                var: var.to_string(),
                key: key.to_string(),
            }),
            _ => Err(Error::Config(format!(
                "invalid environment mapping {spec:?}: expected ENV=key"
            ))),
        }
    }
}
