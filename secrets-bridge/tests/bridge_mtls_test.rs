//! Integration tests for the bridge server and client over mutual TLS.
//!
//! These tests verify that:
//! - Secrets round-trip through a descriptor-configured client
//! - Request-level failures surface as protocol errors, not server failures
//! - `quit` and the timeout stop the server with the right reason
//! - Only clients holding the bridge's identity are served
//! - The endpoint race finds the live server among dead candidates
//! - A restart with a stored CA key keeps the bridge, or mints a new one
//!   when the old port or key cannot be used

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{closed_endpoint, TestFixture};
use secrets_bridge::config::{ClientOptions, EnvSecret};
use secrets_bridge::exec::{self, ExecOutcome, ExecRequest, CHILD_FAILED_EXIT_CODE};
use secrets_bridge::protocol::{PROTOCOL_VERSION, QUIT_ACK};
use secrets_bridge::{
    BridgeClient, BridgeDescriptor, BridgeServer, Error, ServeConfig, ShutdownReason,
};
use secrets_bridge_core::{pki, tls, SecretSource};

fn options() -> ClientOptions {
    ClientOptions {
        race_timeout: Duration::from_secs(5),
    }
}

async fn loopback_client(fixture: &TestFixture) -> BridgeClient {
    let descriptor = fixture.descriptor_with_endpoints(vec![fixture.loopback_endpoint()]);
    BridgeClient::connect(&descriptor, &options()).await.unwrap()
}

/// reqwest client trusting the bridge CA, with or without the client identity.
fn raw_http(descriptor: &BridgeDescriptor, with_identity: bool) -> reqwest::Client {
    let config = if with_identity {
        tls::client_config(descriptor).unwrap()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(descriptor.ca_cert().clone()).unwrap();
        rustls::ClientConfig::builder_with_provider(tls::crypto_provider())
            .with_safe_default_protocol_versions()
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };
    reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_secret_round_trip() {
    let fixture = TestFixture::new(&["hello=world", "b64:token=c2VjcmV0"]).await;
    let client = BridgeClient::connect(&fixture.descriptor, &options())
        .await
        .unwrap();

    client.ping().await.unwrap();
    assert_eq!(client.get_secret("hello").await.unwrap().as_slice(), b"world");
    assert_eq!(client.get_secret("token").await.unwrap().as_slice(), b"secret");
    assert_eq!(
        client.get_secret("b64:hello").await.unwrap().as_slice(),
        b"d29ybGQ="
    );
}

#[tokio::test]
async fn test_descriptor_survives_encoding() {
    let fixture = TestFixture::new(&["hello=world"]).await;
    let encoded = fixture.descriptor.encode().unwrap();
    let decoded = BridgeDescriptor::decode(&encoded).unwrap();

    let client = BridgeClient::connect(&decoded, &options()).await.unwrap();
    assert_eq!(client.get_secret("hello").await.unwrap().as_slice(), b"world");
}

#[tokio::test]
async fn test_missing_secret_is_not_found() {
    let fixture = TestFixture::new(&["hello=world"]).await;
    let client = loopback_client(&fixture).await;

    let err = client.get_secret("absent").await.unwrap_err();
    match err {
        Error::Protocol(msg) => assert!(msg.starts_with("status 404"), "{msg}"),
        other => panic!("Expected protocol error, got: {other:?}"),
    }

    // Server keeps serving after a failed request
    assert_eq!(client.get_secret("hello").await.unwrap().as_slice(), b"world");
}

#[tokio::test]
async fn test_secrets_path_rejects_other_methods() {
    let fixture = TestFixture::new(&["hello=world"]).await;
    let http = raw_http(&fixture.descriptor, true);
    let url = format!("{}/secrets/hello", fixture.loopback_endpoint());

    let response = http.post(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::METHOD_NOT_ALLOWED);

    let response = http.get(&url).send().await.unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), b"world");
}

#[tokio::test]
async fn test_quit_stops_server() {
    let mut fixture = TestFixture::new(&["hello=world"]).await;
    let client = loopback_client(&fixture).await;

    assert_eq!(client.quit().await.unwrap(), QUIT_ACK);
    assert_eq!(fixture.stopped().await, ShutdownReason::Quit);

    let descriptor = fixture.descriptor_with_endpoints(vec![fixture.loopback_endpoint()]);
    let err = BridgeClient::connect(&descriptor, &options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoEndpoint { .. }), "{err:?}");
}

#[tokio::test]
async fn test_timeout_stops_server() {
    let mut fixture = TestFixture::with_config(&[], |config| {
        config.timeout = Some(Duration::from_millis(300));
    })
    .await;

    let reason = fixture.stopped().await;
    assert_eq!(reason, ShutdownReason::TimedOut);
    assert_eq!(reason.exit_code(), 1);
}

#[tokio::test]
async fn test_foreign_client_rejected() {
    let fixture = TestFixture::new(&["hello=world"]).await;
    let other = pki::mint(vec![], &[], pki::DEFAULT_VALIDITY).unwrap();

    // Trusts the server, but presents a certificate from another bridge
    let foreign = BridgeDescriptor::new(
        vec![fixture.loopback_endpoint()],
        fixture.descriptor.ca_cert_pem().to_string(),
        other.descriptor.client_cert_pem().to_string(),
        other.descriptor.client_key_pem().to_string(),
    )
    .unwrap();

    let err = BridgeClient::connect(&foreign, &options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoEndpoint { .. }), "{err:?}");

    // No certificate at all is refused too
    let anonymous = raw_http(&fixture.descriptor, false);
    assert!(anonymous
        .get(format!("{}/ping", fixture.loopback_endpoint()))
        .send()
        .await
        .is_err());
}

#[tokio::test]
async fn test_insecure_mode_serves_anonymous_clients() {
    let fixture = TestFixture::with_config(&["hello=world"], |config| {
        config.insecure = true;
    })
    .await;

    let anonymous = raw_http(&fixture.descriptor, false);
    let response = anonymous
        .get(format!("{}/ping", fixture.loopback_endpoint()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), PROTOCOL_VERSION);

    // A presented certificate is still verified
    let other = pki::mint(vec![], &[], pki::DEFAULT_VALIDITY).unwrap();
    let foreign = BridgeDescriptor::new(
        vec![fixture.loopback_endpoint()],
        fixture.descriptor.ca_cert_pem().to_string(),
        other.descriptor.client_cert_pem().to_string(),
        other.descriptor.client_key_pem().to_string(),
    )
    .unwrap();
    assert!(BridgeClient::connect(&foreign, &options()).await.is_err());
}

#[tokio::test]
async fn test_untrusted_server_rejected() {
    let fixture = TestFixture::new(&["hello=world"]).await;
    let other = pki::mint(vec![], &[], pki::DEFAULT_VALIDITY).unwrap();

    // Valid identity for some other bridge, pointed at this server
    let stranger = BridgeDescriptor::new(
        vec![fixture.loopback_endpoint()],
        other.descriptor.ca_cert_pem().to_string(),
        other.descriptor.client_cert_pem().to_string(),
        other.descriptor.client_key_pem().to_string(),
    )
    .unwrap();

    let err = BridgeClient::connect(&stranger, &options())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NoEndpoint { .. }), "{err:?}");
}

#[tokio::test]
async fn test_race_finds_live_endpoint() {
    let fixture = TestFixture::new(&["hello=world"]).await;
    let descriptor = fixture.descriptor_with_endpoints(vec![
        closed_endpoint(),
        closed_endpoint(),
        fixture.loopback_endpoint(),
        closed_endpoint(),
    ]);

    let client = BridgeClient::connect(&descriptor, &options()).await.unwrap();
    assert_eq!(client.endpoint().port(), Some(fixture.port()));
    assert_eq!(client.get_secret("hello").await.unwrap().as_slice(), b"world");
}

#[tokio::test]
async fn test_race_without_live_endpoint() {
    let fixture = TestFixture::new(&[]).await;
    let endpoints = vec![closed_endpoint(), closed_endpoint(), closed_endpoint()];
    let descriptor = fixture.descriptor_with_endpoints(endpoints.clone());

    match BridgeClient::connect(&descriptor, &options()).await {
        Err(Error::NoEndpoint { tried }) => assert_eq!(tried, endpoints),
        other => panic!("Expected NoEndpoint, got: {other:?}"),
    }
}

#[tokio::test]
async fn test_race_bounded_by_timeout() {
    let fixture = TestFixture::new(&[]).await;

    // Accepts TCP connections but never speaks TLS
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let descriptor = fixture.descriptor_with_endpoints(vec![format!("https://{silent_addr}")]);
    let options = ClientOptions {
        race_timeout: Duration::from_millis(500),
    };

    let started = std::time::Instant::now();
    let err = BridgeClient::connect(&descriptor, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));

    holder.abort();
}

#[cfg(unix)]
#[tokio::test]
async fn test_exec_injects_secrets() {
    let fixture = TestFixture::new(&["hello=world"]).await;
    let client = Arc::new(loopback_client(&fixture).await);

    let request = |script: &str| ExecRequest {
        env: vec![EnvSecret::parse("GREETING=hello").unwrap()],
        forward_agent: false,
        agent_socket: None,
        command: vec!["sh".into(), "-c".into(), script.into()],
    };

    let outcome = exec::run(client.clone(), request(r#"test "$GREETING" = world"#))
        .await
        .unwrap();
    assert_eq!(outcome.exit_code(), 0);

    let outcome = exec::run(client.clone(), request(r#"test "$GREETING" = other"#))
        .await
        .unwrap();
    assert_eq!(outcome.exit_code(), CHILD_FAILED_EXIT_CODE);

    let outcome = exec::run(
        client.clone(),
        ExecRequest {
            command: vec!["/nonexistent/secrets-bridge-test".into()],
            ..request("")
        },
    )
    .await
    .unwrap();
    assert!(matches!(outcome, ExecOutcome::FailedToStart(_)));
    assert_eq!(outcome.exit_code(), CHILD_FAILED_EXIT_CODE);
}

#[tokio::test]
async fn test_exec_fails_on_missing_secret() {
    let fixture = TestFixture::new(&[]).await;
    let client = Arc::new(loopback_client(&fixture).await);

    let err = exec::run(
        client,
        ExecRequest {
            env: vec![EnvSecret::parse("TOKEN=absent").unwrap()],
            forward_agent: false,
            agent_socket: None,
            command: vec!["true".into()],
        },
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "{err:?}");
}

/// Writes its descriptor and keeps its CA key, so a second bind can reuse both.
fn reusable_config(dir: &std::path::Path) -> ServeConfig {
    common::install_crypto_provider();
    ServeConfig {
        bridge_conf_file: dir.join("bridge-conf"),
        write_conf: true,
        ca_key_store: Some(dir.join("ca.key")),
        secrets: vec![SecretSource::parse_literal("hello=world").unwrap()],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_restart_reuses_descriptor_and_port() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = reusable_config(temp.path());

    let first = BridgeServer::bind(&config).await.unwrap();
    let descriptor = first.descriptor().clone();
    let port = first.local_addr().port();
    drop(first);

    let second = BridgeServer::bind(&config).await.unwrap();
    assert_eq!(second.local_addr().port(), port);
    assert_eq!(
        second.descriptor().encode().unwrap(),
        descriptor.encode().unwrap()
    );
    let serving = tokio::spawn(second.serve());

    // A client holding the first run's descriptor reaches the new server
    let loopback = BridgeDescriptor::new(
        vec![format!("https://127.0.0.1:{port}")],
        descriptor.ca_cert_pem().to_string(),
        descriptor.client_cert_pem().to_string(),
        descriptor.client_key_pem().to_string(),
    )
    .unwrap();
    let client = BridgeClient::connect(&loopback, &options()).await.unwrap();
    assert_eq!(client.get_secret("hello").await.unwrap().as_slice(), b"world");

    serving.abort();
}

#[tokio::test]
async fn test_restart_mints_fresh_when_port_busy() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = reusable_config(temp.path());

    let first = BridgeServer::bind(&config).await.unwrap();
    let second = BridgeServer::bind(&config).await.unwrap();

    assert_ne!(second.local_addr().port(), first.local_addr().port());
    assert_ne!(
        second.descriptor().ca_cert_pem(),
        first.descriptor().ca_cert_pem()
    );

    // The fresh bridge replaced the stored one
    let written = BridgeDescriptor::load(&config.bridge_conf_file).unwrap();
    assert_eq!(written.ca_cert_pem(), second.descriptor().ca_cert_pem());
}

#[tokio::test]
async fn test_restart_mints_fresh_with_foreign_key() {
    let temp = tempfile::TempDir::new().unwrap();
    let config = reusable_config(temp.path());

    let first = BridgeServer::bind(&config).await.unwrap();
    let ca_cert = first.descriptor().ca_cert_pem().to_string();
    drop(first);

    let other = pki::mint(vec![], &[], pki::DEFAULT_VALIDITY).unwrap();
    other
        .persist_ca_key(config.ca_key_store.as_deref().unwrap())
        .unwrap();

    let second = BridgeServer::bind(&config).await.unwrap();
    assert_ne!(second.descriptor().ca_cert_pem(), ca_cert);
    assert_ne!(second.descriptor().ca_cert_pem(), other.descriptor.ca_cert_pem());
}
