//! Process lifecycle: background launch with a readiness handshake, and the
//! reasons a serving process ends.

use crate::config::ServeConfig;
use secrets_bridge_core::{Error, Result};
use std::ffi::OsString;
use std::path::Path;
#[cfg(unix)]
use tracing::debug;

/// Carries the launcher's PID into a detached server.
pub const DAEMON_PARENT_ENV: &str = "SECRETS_BRIDGE_DAEMON_PARENT";

/// Why [`crate::server::BridgeServer::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A client sent `quit`
    Quit,
    /// The configured timeout elapsed
    TimedOut,
}

impl ShutdownReason {
    pub fn exit_code(self) -> u8 {
        match self {
            ShutdownReason::Quit => 0,
            ShutdownReason::TimedOut => 1,
        }
    }
}

fn parent_from(value: Option<OsString>) -> Option<u32> {
    value?.to_str()?.parse().ok()
}

/// PID of the launcher when running as a detached server.
pub fn daemon_parent() -> Option<u32> {
    parent_from(std::env::var_os(DAEMON_PARENT_ENV))
}

pub fn is_daemon_child() -> bool {
    daemon_parent().is_some()
}

/// Tell the launcher that the listener is bound. No-op in the foreground.
pub fn notify_parent_ready() -> Result<()> {
    match daemon_parent() {
        Some(parent) => signal_ready(parent),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn signal_ready(parent: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let pid = i32::try_from(parent)
        .map_err(|_| Error::Lifecycle(format!("invalid parent pid {parent}")))?;
    kill(Pid::from_raw(pid), Signal::SIGUSR1)
        .map_err(|e| Error::Lifecycle(format!("cannot signal readiness to {parent}: {e}")))?;
    debug!(parent, "Signalled readiness");
    Ok(())
}

#[cfg(not(unix))]
fn signal_ready(_parent: u32) -> Result<()> {
    Err(Error::Lifecycle(
        "daemonization is not supported on this platform".to_string(),
    ))
}

/// Re-run this program detached, logging to `log_file`, and wait for it to
/// report that its listener is bound.
///
/// When the readiness signal does not arrive in time the outcome is unknown:
/// the server may still be starting. If it was told to write its descriptor,
/// the endpoints in that file are probed before giving up.
#[cfg(unix)]
pub async fn launch_daemon(config: &ServeConfig, log_file: &Path) -> Result<()> {
    use std::os::unix::process::CommandExt;
    use std::process::{Command, Stdio};
    use std::time::SystemTime;
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::{info, warn};

    // Registered before the child exists so an early signal is not lost.
    let mut ready = signal(SignalKind::user_defined1())
        .map_err(|e| Error::Lifecycle(format!("cannot watch for readiness signal: {e}")))?;

    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .map_err(|e| Error::Config(format!("cannot open log file {}: {e}", log_file.display())))?;

    let launched_at = SystemTime::now();
    let mut command = Command::new(std::env::current_exe()?);
    command
        .args(std::env::args_os().skip(1))
        .env(DAEMON_PARENT_ENV, std::process::id().to_string())
        .stdin(Stdio::null())
        .stdout(log.try_clone()?)
        .stderr(log);
    // SAFETY: the hook only calls setsid, which is async-signal-safe.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid()?;
            Ok(())
        });
    }

    let child = command
        .spawn()
        .map_err(|e| Error::Lifecycle(format!("cannot start background server: {e}")))?;
    info!(pid = child.id(), log = %log_file.display(), "Started background server");

    if let Ok(Some(())) = tokio::time::timeout(config.ready_timeout, ready.recv()).await {
        info!("Background server is ready");
        return Ok(());
    }

    if answers_since(config, launched_at).await {
        warn!("Readiness signal missed, but the background server answered");
        return Ok(());
    }

    Err(Error::Timeout(format!(
        "background server did not report readiness within {:?}; it may still be starting, see {}",
        config.ready_timeout,
        log_file.display()
    )))
}

/// Whether a descriptor written since `since` leads to a live server.
#[cfg(unix)]
async fn answers_since(config: &ServeConfig, since: std::time::SystemTime) -> bool {
    if !config.write_conf || !written_since(&config.bridge_conf_file, since) {
        return false;
    }
    let options = crate::config::ClientOptions {
        race_timeout: config.ready_timeout,
    };
    let probe = async {
        let descriptor = secrets_bridge_core::BridgeDescriptor::load(&config.bridge_conf_file)?;
        crate::client::BridgeClient::connect(&descriptor, &options).await
    };
    match probe.await {
        Ok(_) => true,
        Err(e) => {
            debug!("Probe after missed readiness signal failed: {}", e);
            false
        }
    }
}

/// Coarsest modification-time resolution among common filesystems.
#[cfg(unix)]
const MTIME_RESOLUTION: std::time::Duration = std::time::Duration::from_secs(1);

#[cfg(unix)]
fn written_since(path: &Path, since: std::time::SystemTime) -> bool {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map(|modified| modified + MTIME_RESOLUTION >= since)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub async fn launch_daemon(_config: &ServeConfig, _log_file: &Path) -> Result<()> {
    Err(Error::Lifecycle(
        "daemonization is not supported on this platform".to_string(),
    ))
}
