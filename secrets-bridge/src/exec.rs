//! Run a command with secrets injected into its environment.

use crate::client::BridgeClient;
use crate::config::EnvSecret;
use secrets_bridge_core::{Error, Result};
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info};

/// Exit code reported when the command fails to start or exits non-zero.
pub const CHILD_FAILED_EXIT_CODE: u8 = 199;

#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub env: Vec<EnvSecret>,
    /// Serve a local agent socket and point `SSH_AUTH_SOCK` at it
    pub forward_agent: bool,
    /// Agent socket location, a per-process temp path when unset
    pub agent_socket: Option<PathBuf>,
    /// Program followed by its arguments
    pub command: Vec<OsString>,
}

#[derive(Debug)]
pub enum ExecOutcome {
    Exited(ExitStatus),
    FailedToStart(std::io::Error),
}

impl ExecOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            ExecOutcome::Exited(status) if status.success() => 0,
            _ => CHILD_FAILED_EXIT_CODE,
        }
    }
}

/// Fetch every mapped secret, then run the command to completion.
///
/// A secret that cannot be fetched aborts before the command starts.
pub async fn run(client: Arc<BridgeClient>, request: ExecRequest) -> Result<ExecOutcome> {
    let (program, args) = request
        .command
        .split_first()
        .ok_or_else(|| Error::Config("no command given".to_string()))?;

    let mut command = Command::new(program);
    command.args(args);
    for mapping in &request.env {
        let value = client.get_secret(&mapping.key).await?;
        command.env(&mapping.var, secret_os_str(&value));
        debug!(var = %mapping.var, key = %mapping.key, "Injected secret");
    }

    #[cfg(unix)]
    let forwarder = if request.forward_agent {
        let path = request
            .agent_socket
            .clone()
            .unwrap_or_else(crate::agent::AgentForwarder::default_path);
        let forwarder = crate::agent::AgentForwarder::bind(path)?;
        command.env(crate::config::SSH_AUTH_SOCK, forwarder.path());
        Some(forwarder)
    } else {
        None
    };
    #[cfg(not(unix))]
    if request.forward_agent {
        return Err(Error::Lifecycle(
            "SSH agent forwarding is not supported on this platform".to_string(),
        ));
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return Ok(ExecOutcome::FailedToStart(e)),
    };
    info!(pid = child.id(), program = %program.to_string_lossy(), "Started command");

    #[cfg(unix)]
    let status = match &forwarder {
        Some(forwarder) => {
            let serving = forwarder.serve(client.clone());
            tokio::pin!(serving);
            tokio::select! {
                status = child.wait() => status?,
                stopped = &mut serving => {
                    if let Err(e) = stopped {
                        tracing::warn!("Agent forwarder stopped: {}", e);
                    }
                    child.wait().await?
                }
            }
        }
        None => child.wait().await?,
    };
    #[cfg(not(unix))]
    let status = child.wait().await?;

    debug!(?status, "Command finished");
    Ok(ExecOutcome::Exited(status))
}

#[cfg(unix)]
fn secret_os_str(value: &[u8]) -> &OsStr {
    std::os::unix::ffi::OsStrExt::from_bytes(value)
}

#[cfg(not(unix))]
fn secret_os_str(value: &[u8]) -> &OsStr {
    // Non-UTF-8 secrets cannot be expressed in a wide-char environment.
    OsStr::new(std::str::from_utf8(value).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_exit_codes() {
        use std::os::unix::process::ExitStatusExt;

        assert_eq!(ExecOutcome::Exited(ExitStatus::from_raw(0)).exit_code(), 0);
        assert_eq!(
            ExecOutcome::Exited(ExitStatus::from_raw(1 << 8)).exit_code(),
            CHILD_FAILED_EXIT_CODE
        );
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert_eq!(
            ExecOutcome::FailedToStart(missing).exit_code(),
            CHILD_FAILED_EXIT_CODE
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_secret_bytes_preserved() {
        let raw = [0x66, 0x6f, 0xff, 0x6f];
        assert_eq!(
            std::os::unix::ffi::OsStrExt::as_bytes(secret_os_str(&raw)),
            &raw
        );
    }
}
