//! The bridge server: bootstrap, mutual-TLS listener and request routing.

use crate::agent;
use crate::config::ServeConfig;
use crate::lifecycle::ShutdownReason;
use crate::protocol::{
    AGENT_FORWARDER_PATH, PING_PATH, PROTOCOL_VERSION, QUIT_ACK, QUIT_PATH, SECRETS_PATH,
};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use secrets_bridge_core::{net, pki, tls, BridgeDescriptor, Error, Minted, Result, SecretStore};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Bound on a client completing its TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Time given to in-flight responses after `quit` before connections are dropped.
const QUIT_GRACE: Duration = Duration::from_millis(50);

/// First and largest pause after a transient accept failure.
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Clone)]
struct AppState {
    secrets: Arc<SecretStore>,
    quit: mpsc::Sender<()>,
    agent_socket: Option<Arc<PathBuf>>,
}

/// A bound, not yet serving, bridge server.
pub struct BridgeServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    descriptor: BridgeDescriptor,
    acceptor: TlsAcceptor,
    secrets: Arc<SecretStore>,
    agent_socket: Option<Arc<PathBuf>>,
    timeout: Option<Duration>,
}

impl BridgeServer {
    /// Load secrets, mint or reuse the bridge identity and bind the listener.
    ///
    /// Every failure here is fatal for the process: there is no useful
    /// server without its trust root or its port.
    pub async fn bind(config: &ServeConfig) -> Result<Self> {
        let mut secrets = SecretStore::new();
        secrets.load(&config.secrets)?;
        info!(count = secrets.len(), "Loaded secrets");

        let (minted, listener) = mint_or_reuse(config).await?;
        let local_addr = listener.local_addr()?;

        let tls_config = tls::server_config(
            &minted.descriptor,
            &minted.server_identity,
            config.insecure,
        )?;

        if config.write_conf {
            minted.descriptor.save(&config.bridge_conf_file)?;
            info!(path = %config.bridge_conf_file.display(), "Wrote bridge descriptor");
        }

        if let Some(socket) = &config.agent_socket {
            info!(socket = %socket.display(), "SSH agent forwarding enabled");
        }

        Ok(Self {
            listener,
            local_addr,
            descriptor: minted.descriptor,
            acceptor: TlsAcceptor::from(tls_config),
            secrets: Arc::new(secrets),
            agent_socket: config.agent_socket.clone().map(Arc::new),
            timeout: config.timeout,
        })
    }

    pub fn descriptor(&self) -> &BridgeDescriptor {
        &self.descriptor
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve connections until `quit`, the timeout, or a listener failure.
    pub async fn serve(self) -> Result<ShutdownReason> {
        let BridgeServer {
            listener,
            local_addr,
            descriptor,
            acceptor,
            secrets,
            agent_socket,
            timeout,
        } = self;

        let (quit_tx, mut quit_rx) = mpsc::channel(1);
        let router = router(AppState {
            secrets,
            quit: quit_tx,
            agent_socket,
        });

        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        info!(addr = %local_addr, endpoints = ?descriptor.endpoints(), "Bridge server listening");

        let mut connections = JoinSet::new();
        let mut backoff: Option<Duration> = None;
        let reason = loop {
            tokio::select! {
                _ = quit_rx.recv() => {
                    info!("Quit requested, shutting down");
                    break ShutdownReason::Quit;
                }
                _ = &mut deadline => {
                    info!(?timeout, "Timeout reached, shutting down");
                    break ShutdownReason::TimedOut;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) if is_transient_accept_error(&e) => {
                            let delay = next_backoff(backoff);
                            backoff = Some(delay);
                            warn!(?delay, "Accept failed, retrying: {}", e);
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        Err(e) => {
                            error!("Listener failed: {}", e);
                            return Err(Error::Network(format!("accept failed: {e}")));
                        }
                    };
                    backoff = None;
                    connections.spawn(serve_connection(
                        stream,
                        peer,
                        acceptor.clone(),
                        router.clone(),
                    ));
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        };

        drop(listener);
        if reason == ShutdownReason::Quit {
            tokio::time::sleep(QUIT_GRACE).await;
        }
        connections.shutdown().await;
        Ok(reason)
    }
}

/// Errors after which the listener is still usable: a peer gave up before
/// being accepted, or the process ran out of descriptors for a moment.
fn is_transient_accept_error(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        e.kind(),
        ErrorKind::ConnectionAborted | ErrorKind::ConnectionReset | ErrorKind::Interrupted
    ) {
        return true;
    }
    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(libc::EMFILE | libc::ENFILE)) {
        return true;
    }
    false
}

fn next_backoff(previous: Option<Duration>) -> Duration {
    match previous {
        Some(delay) => (delay * 2).min(ACCEPT_BACKOFF_MAX),
        None => ACCEPT_BACKOFF_MIN,
    }
}

fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route(PING_PATH, get(ping))
        .route(&format!("{SECRETS_PATH}/{{*key}}"), get(get_secret))
        .route(QUIT_PATH, post(quit));
    if state.agent_socket.is_some() {
        router = router.route(AGENT_FORWARDER_PATH, get(agent_forwarder));
    }
    router.with_state(state)
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, acceptor: TlsAcceptor, router: Router) {
    let tls = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            debug!(%peer, "TLS handshake failed: {}", e);
            return;
        }
        Err(_) => {
            debug!(%peer, "TLS handshake timed out");
            return;
        }
    };

    let service = TowerToHyperService::new(router);
    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service)
        .with_upgrades()
        .await
    {
        debug!(%peer, "Connection ended with error: {}", e);
    }
}

async fn ping() -> &'static str {
    PROTOCOL_VERSION
}

async fn get_secret(State(state): State<AppState>, UrlPath(key): UrlPath<String>) -> Response {
    match state.secrets.get(&key) {
        Some(value) => {
            info!(key = %key, "Serving secret");
            (
                [(header::CONTENT_TYPE, "application/octet-stream")],
                value.to_vec(),
            )
                .into_response()
        }
        None => {
            debug!(key = %key, "Secret not found");
            (StatusCode::NOT_FOUND, format!("secret {key:?} not found\n")).into_response()
        }
    }
}

async fn quit(State(state): State<AppState>) -> &'static str {
    // Full channel means shutdown is already under way.
    let _ = state.quit.try_send(());
    QUIT_ACK
}

async fn agent_forwarder(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    let Some(socket) = state.agent_socket.clone() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    ws.on_upgrade(move |ws| agent::serve_agent_session(ws, socket))
}

async fn mint_or_reuse(config: &ServeConfig) -> Result<(Minted, TcpListener)> {
    if let Some(store) = config.ca_key_store.as_deref() {
        if store.exists() {
            match reuse(store, &config.bridge_conf_file).await {
                Ok(reused) => return Ok(reused),
                Err(e) => warn!(
                    "Cannot reuse CA key from {}: {}; minting a new bridge",
                    store.display(),
                    e
                ),
            }
        }
    }

    let listener = bind_listener(config.port).await?;
    let port = listener.local_addr()?.port();
    let addresses = net::local_addresses()?;
    let endpoints = addresses
        .iter()
        .map(|ip| net::endpoint_url(*ip, port))
        .collect();

    let validity = config.cert_validity;
    let minted = tokio::task::spawn_blocking(move || pki::mint(endpoints, &addresses, validity))
        .await
        .map_err(|e| Error::Crypto(format!("key generation task failed: {e}")))??;

    if let Some(store) = &config.ca_key_store {
        minted.persist_ca_key(store)?;
    }
    Ok((minted, listener))
}

async fn reuse(store: &Path, bridge_conf_file: &Path) -> Result<(Minted, TcpListener)> {
    let previous = BridgeDescriptor::load(bridge_conf_file)?;
    let port = previous.listen_port()?;
    let minted = pki::reuse(store, &previous)?;
    let listener = bind_listener(port).await?;
    Ok((minted, listener))
}

async fn bind_listener(port: u16) -> Result<TcpListener> {
    let mut failures = Vec::new();
    for addr in net::wildcard_addrs(port) {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                debug!(%addr, "Bound listener");
                return Ok(listener);
            }
            Err(e) => {
                debug!(%addr, "Cannot bind: {}", e);
                failures.push(format!("{addr}: {e}"));
            }
        }
    }
    Err(Error::Network(format!(
        "cannot listen on port {port}: {}",
        failures.join(", ")
    )))
}
