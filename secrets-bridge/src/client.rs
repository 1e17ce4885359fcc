//! Bridge client: endpoint race, secret fetch, shutdown and agent tunnels.

use crate::config::ClientOptions;
use crate::protocol::{AGENT_FORWARDER_PATH, PING_PATH, PROTOCOL_VERSION, QUIT_PATH, SECRETS_PATH};
use bytes::Bytes;
use reqwest::StatusCode;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use secrets_bridge_core::{race, tls, BridgeDescriptor, Error, Result};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info};
use url::{Host, Url};
use zeroize::Zeroizing;

/// Extra time a losing probe may run after the race deadline.
const PROBE_OVERRUN: Duration = Duration::from_secs(1);

/// WebSocket carrying one agent session over mutual TLS.
pub type AgentTunnel = WebSocketStream<TlsStream<TcpStream>>;

/// A client bound to the first endpoint that answered.
#[derive(Debug)]
pub struct BridgeClient {
    http: reqwest::Client,
    tls: Arc<ClientConfig>,
    endpoint: Url,
}

impl BridgeClient {
    /// Build the mutual-TLS client and race every endpoint in `descriptor`.
    pub async fn connect(descriptor: &BridgeDescriptor, options: &ClientOptions) -> Result<Self> {
        let tls = Arc::new(tls::client_config(descriptor)?);
        let http = reqwest::Client::builder()
            .use_preconfigured_tls(ClientConfig::clone(&tls))
            .connect_timeout(options.race_timeout + PROBE_OVERRUN)
            .build()
            .map_err(|e| Error::Network(format!("Failed to build HTTP client: {e}")))?;

        let endpoint = choose_endpoint(&http, descriptor.endpoints(), options.race_timeout).await?;
        info!(%endpoint, "Connected to bridge server");

        Ok(Self {
            http,
            tls,
            endpoint,
        })
    }

    /// The endpoint that won the race.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn ping(&self) -> Result<()> {
        check_version(&self.http, &self.endpoint, None).await
    }

    pub async fn get_secret(&self, key: &str) -> Result<Zeroizing<Vec<u8>>> {
        let mut url = self.endpoint.clone();
        url.set_path(SECRETS_PATH);
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("endpoint {} cannot carry a path", self.endpoint)))?
            .push(key);

        let response = self
            .http
            .get(url.clone())
            .send()
            .await
            .map_err(|e| request_failed(&url, e))?;
        let body = expect_ok(response).await?;
        debug!(key, len = body.len(), "Fetched secret");
        Ok(Zeroizing::new(body.to_vec()))
    }

    /// Ask the server to exit. Returns the acknowledgement text.
    pub async fn quit(&self) -> Result<String> {
        let mut url = self.endpoint.clone();
        url.set_path(QUIT_PATH);
        let response = self
            .http
            .post(url.clone())
            .send()
            .await
            .map_err(|e| request_failed(&url, e))?;
        let body = expect_ok(response).await?;
        Ok(String::from_utf8_lossy(&body).into_owned())
    }

    /// Open a WebSocket to the server's agent forwarder.
    pub async fn open_agent_tunnel(&self) -> Result<AgentTunnel> {
        let port = self
            .endpoint
            .port_or_known_default()
            .ok_or_else(|| Error::Config(format!("endpoint {} has no port", self.endpoint)))?;
        let server_name = match self.endpoint.host() {
            Some(Host::Ipv4(ip)) => ServerName::from(IpAddr::V4(ip)),
            Some(Host::Ipv6(ip)) => ServerName::from(IpAddr::V6(ip)),
            Some(Host::Domain(name)) => ServerName::try_from(name.to_string())
                .map_err(|e| Error::Config(format!("invalid server name {name:?}: {e}")))?,
            None => return Err(Error::Config(format!("endpoint {} has no host", self.endpoint))),
        };

        let host = self
            .endpoint
            .host_str()
            .unwrap_or_default()
            .trim_start_matches('[')
            .trim_end_matches(']');
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::Network(format!("Failed to connect to {}: {e}", self.endpoint)))?;
        let stream = TlsConnector::from(self.tls.clone())
            .connect(server_name, stream)
            .await
            .map_err(|e| Error::Network(format!("TLS handshake with {} failed: {e}", self.endpoint)))?;

        let mut url = self.endpoint.clone();
        url.set_scheme("wss")
            .map_err(|_| Error::Config(format!("endpoint {} cannot use wss", self.endpoint)))?;
        url.set_path(AGENT_FORWARDER_PATH);

        let (tunnel, _) = tokio_tungstenite::client_async(url.as_str(), stream)
            .await
            .map_err(|e| Error::Protocol(format!("agent tunnel upgrade failed: {e}")))?;
        debug!(%url, "Opened agent tunnel");
        Ok(tunnel)
    }
}

/// Probe every endpoint concurrently and return the first that answers.
///
/// Probes run as spawned tasks, so losers finish on their own after a
/// winner is chosen. The whole race is bounded by `within`.
async fn choose_endpoint(
    http: &reqwest::Client,
    endpoints: &[String],
    within: Duration,
) -> Result<Url> {
    let probes = endpoints.iter().map(|endpoint| {
        let http = http.clone();
        let target = endpoint.clone();
        let handle = tokio::spawn(async move {
            let url = Url::parse(&target)
                .map_err(|e| Error::Config(format!("invalid endpoint {target:?}: {e}")))?;
            check_version(&http, &url, Some(within + PROBE_OVERRUN)).await?;
            Ok::<_, Error>(url)
        });
        let endpoint = endpoint.clone();
        async move {
            match handle.await {
                Ok(outcome) => outcome.map_err(|e| (endpoint, e)),
                Err(e) => Err((endpoint, Error::Network(format!("probe task failed: {e}")))),
            }
        }
    });

    match tokio::time::timeout(within, race::first_ok(probes)).await {
        Ok(Ok(url)) => Ok(url),
        Ok(Err(failures)) => {
            for (endpoint, e) in &failures {
                debug!(%endpoint, "Endpoint unusable: {}", e);
            }
            Err(Error::NoEndpoint {
                tried: endpoints.to_vec(),
            })
        }
        Err(_) => Err(Error::Timeout(format!(
            "no endpoint answered within {within:?}"
        ))),
    }
}

async fn check_version(http: &reqwest::Client, endpoint: &Url, within: Option<Duration>) -> Result<()> {
    let mut url = endpoint.clone();
    url.set_path(PING_PATH);
    let mut request = http.get(url.clone());
    if let Some(within) = within {
        request = request.timeout(within);
    }
    let response = request.send().await.map_err(|e| request_failed(&url, e))?;
    let body = expect_ok(response).await?;
    if body != PROTOCOL_VERSION.as_bytes() {
        return Err(Error::Protocol(format!(
            "unexpected protocol version {:?} from {endpoint}",
            String::from_utf8_lossy(&body)
        )));
    }
    Ok(())
}

fn request_failed(url: &Url, e: reqwest::Error) -> Error {
    Error::Network(format!("request to {url} failed: {e}"))
}

async fn expect_ok(response: reqwest::Response) -> Result<Bytes> {
    let status = response.status();
    let body = response
        .bytes()
        .await
        .map_err(|e| Error::Network(format!("Failed to read response: {e}")))?;
    if status != StatusCode::OK {
        return Err(Error::Protocol(format!(
            "status {}: {}",
            status.as_u16(),
            String::from_utf8_lossy(&body).trim()
        )));
    }
    Ok(body)
}
