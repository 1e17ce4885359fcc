//! SSH agent forwarding over WebSocket tunnels.
//!
//! Server side, each upgraded `/ssh-agent-forwarder` request is relayed to
//! the local agent socket. Client side, [`AgentForwarder`] listens on a Unix
//! socket and opens one tunnel per accepted connection.

use axum::extract::ws::{Message, WebSocket};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Relay one upgraded WebSocket to the agent at `agent`.
#[cfg(unix)]
pub async fn serve_agent_session(socket: WebSocket, agent: Arc<PathBuf>) {
    use futures::{future, SinkExt, StreamExt};
    use secrets_bridge_core::relay::relay;
    use tokio::net::UnixStream;

    let local = match UnixStream::connect(agent.as_path()).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(socket = %agent.display(), "Cannot reach SSH agent: {}", e);
            return;
        }
    };

    let (sink, stream) = socket.split();
    let sink =
        sink.with(|chunk: bytes::Bytes| future::ready(Ok::<_, axum::Error>(Message::Binary(chunk))));
    let frames = stream
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        });

    let stats = relay(local, sink, frames).await;
    debug!(
        sent = stats.local_to_remote,
        received = stats.remote_to_local,
        "Agent session finished"
    );
}

#[cfg(not(unix))]
pub async fn serve_agent_session(_socket: WebSocket, agent: Arc<PathBuf>) {
    warn!(socket = %agent.display(), "SSH agent forwarding is not supported on this platform");
}

#[cfg(unix)]
pub use forwarder::AgentForwarder;

#[cfg(unix)]
mod forwarder {
    use crate::client::{AgentTunnel, BridgeClient};
    use futures::{future, SinkExt, StreamExt};
    use secrets_bridge_core::relay::{relay, RelayStats};
    use secrets_bridge_core::{Error, Result};
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tokio::net::{UnixListener, UnixStream};
    use tokio_tungstenite::tungstenite::Message;
    use tracing::{debug, info, warn};

    /// Local agent socket whose connections are tunnelled to the bridge.
    ///
    /// The socket file is removed when the forwarder is dropped.
    #[derive(Debug)]
    pub struct AgentForwarder {
        listener: UnixListener,
        path: PathBuf,
    }

    impl AgentForwarder {
        /// Bind at `path`, replacing any stale socket left there.
        pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
            let path = path.into();
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "Removed stale agent socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }

            let listener = UnixListener::bind(&path).map_err(|e| {
                Error::Network(format!("cannot bind agent socket {}: {e}", path.display()))
            })?;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
            info!(path = %path.display(), "Agent forwarder listening");

            Ok(Self { listener, path })
        }

        pub fn default_path() -> PathBuf {
            std::env::temp_dir().join(format!(
                "secrets-bridge-agent-{}.sock",
                std::process::id()
            ))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Accept agent clients until the listener fails.
        pub async fn serve(&self, client: Arc<BridgeClient>) -> Result<()> {
            loop {
                let (stream, _) = self
                    .listener
                    .accept()
                    .await
                    .map_err(|e| Error::Network(format!("agent socket accept failed: {e}")))?;
                let client = client.clone();
                tokio::spawn(async move {
                    match client.open_agent_tunnel().await {
                        Ok(tunnel) => {
                            let stats = forward_session(stream, tunnel).await;
                            debug!(
                                sent = stats.local_to_remote,
                                received = stats.remote_to_local,
                                "Agent tunnel closed"
                            );
                        }
                        Err(e) => warn!("Cannot open agent tunnel: {}", e),
                    }
                });
            }
        }
    }

    impl Drop for AgentForwarder {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    async fn forward_session(local: UnixStream, tunnel: AgentTunnel) -> RelayStats {
        let (sink, stream) = tunnel.split();
        let sink = sink.with(|chunk: bytes::Bytes| {
            future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(
                Message::Binary(chunk),
            ))
        });
        let frames = stream
            .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(Message::Binary(data)) => Some(Ok(data)),
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                })
            });
        relay(local, sink, frames).await
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use tempfile::TempDir;

        #[tokio::test]
        async fn test_bind_replaces_stale_socket() {
            let temp = TempDir::new().unwrap();
            let path = temp.path().join("agent.sock");
            std::fs::write(&path, b"stale").unwrap();

            let forwarder = AgentForwarder::bind(&path).unwrap();
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
            assert_eq!(forwarder.path(), path);

            drop(forwarder);
            assert!(!path.exists());
        }

        #[test]
        fn test_default_path_is_per_process() {
            let path = AgentForwarder::default_path();
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            assert!(name.contains(&std::process::id().to_string()));
        }
    }
}
