//! httpbin diagnostic server
//!
//! Small HTTP server with deterministic, inspectable endpoints for testing
//! the infrastructure in front of it (proxies, load balancers, retry and
//! timeout policies, TLS termination):
//! 1. `/version` reports host identity and the configured version
//! 2. `/header` echoes request metadata
//! 3. `/timeout` delays its answer by a client-chosen number of seconds
//! 4. `/retry` fails a fixed number of times before each success

mod config;
mod error;
mod handlers;
mod metrics;
mod server;
mod tls;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::routing::any;
use axum_server::Handle;
use clap::Parser;
use fault_injection::FaultCounter;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Cli, Config, LogFormat};
use crate::handlers::HandlerState;
use crate::server::DRAIN_TIMEOUT;
use crate::tls::TlsPaths;

/// Build the axum router with the diagnostic endpoints.
///
/// Exact path matches only; every method is accepted and anything else gets
/// axum's default 404. There is no request cap: a sleeping `/timeout` must
/// never hold back another request.
fn build_router(state: HandlerState) -> Router {
    Router::new()
        .route("/version", any(handlers::version))
        .route("/header", any(handlers::header))
        .route("/timeout", any(handlers::timeout))
        .route("/retry", any(handlers::retry))
        .route_layer(axum::middleware::from_fn(metrics::track_request))
        .with_state(state)
}

fn init_tracing(format: LogFormat) {
    // LOG_LEVEL wins over RUST_LOG; default is info
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::resolve(Cli::parse()).context("failed to load configuration")?;
    init_tracing(config.log_format);

    info!("starting httpbin");
    info!(
        listen_addr = %config.listen_addr,
        version = %config.version,
        tls = config.tls.enable,
        verify_client = config.tls.verify_client,
        retry_failures = config.retry_failures,
        max_timeout = ?config.max_timeout,
        "configuration loaded"
    );
    if config.max_timeout.is_none() {
        info!("/timeout sleeps are unbounded");
    }

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus = metrics::install_recorder().context("failed to install metrics recorder")?;

    let fault = Arc::new(FaultCounter::new(config.retry_failures));
    metrics::set_retry_remaining(fault.remaining());

    let app = build_router(HandlerState::new(&config, fault));

    let tls = if config.tls.enable {
        let paths = TlsPaths::default();
        let rustls = tls::load_rustls_config(&paths, config.tls.verify_client)
            .context("failed to load TLS material")?;
        Some(rustls)
    } else {
        None
    };

    if let Some(metrics_addr) = config.metrics_addr {
        let listener = TcpListener::bind(metrics_addr)
            .await
            .with_context(|| format!("failed to bind metrics listener to {metrics_addr}"))?;
        info!(addr = %metrics_addr, "serving metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, metrics::router(prometheus)).await {
                error!(error = %e, "metrics listener failed");
            }
        });
    }

    let handle = Handle::new();
    let listen_addr = config.listen_addr;
    let mut server = tokio::spawn(server::serve(listen_addr, tls, app, handle.clone()));

    let listening = handle.clone();
    tokio::spawn(async move {
        if let Some(addr) = listening.listening().await {
            info!(addr = %addr, "accepting requests");
        }
    });

    tokio::select! {
        result = &mut server => {
            // The server only returns on its own when it fails (bind error, accept failure)
            result
                .context("server task panicked")?
                .with_context(|| format!("failed to serve on {listen_addr}"))?;
            return Ok(());
        }
        _ = shutdown_signal() => {}
    }

    // Stop accepting and give in-flight requests DRAIN_TIMEOUT to finish.
    // Long /timeout sleeps are cut off when it expires.
    handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
    match server.await {
        Ok(Ok(())) => info!("shutdown complete"),
        Ok(Err(e)) => error!(error = %e, "server error during shutdown"),
        Err(e) => error!(error = %e, "server task panicked"),
    }
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tower::ServiceExt;

    /// Serializes tests that mutate HOSTNAME.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    fn test_state() -> HandlerState {
        HandlerState {
            version: Arc::from("v1"),
            fault: Arc::new(FaultCounter::default()),
            max_timeout: None,
        }
    }

    fn test_app() -> Router {
        build_router(test_state())
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, String) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    /// Split a `/header` body into (json, query param line).
    fn parse_echo(body: &str) -> (serde_json::Value, String) {
        let (_, rest) = body.split_once("headers: ").expect("headers prefix");
        let (json, query) = rest.split_once("\n query param: ").expect("query line");
        (
            serde_json::from_str(json).expect("echo must be valid JSON"),
            query.to_string(),
        )
    }

    #[tokio::test]
    async fn version_reports_configured_version() {
        let app = test_app();
        let (status, body) = send(&app, get("/version")).await;

        assert_eq!(status, StatusCode::OK);
        let lines: Vec<&str> = body.split('\n').collect();
        assert_eq!(lines.len(), 3, "hostname line, version line, trailing newline");
        assert_eq!(lines[1], "version: v1");
        assert_eq!(lines[2], "");
    }

    #[tokio::test]
    async fn version_is_stable_across_concurrent_requests() {
        let app = test_app();
        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let app = app.clone();
                tokio::spawn(async move { send(&app, get("/version")).await })
            })
            .collect();

        for task in tasks {
            let (status, body) = task.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert!(body.ends_with("version: v1\n"), "got: {body}");
        }
    }

    #[tokio::test]
    async fn hostname_is_read_on_every_request() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let app = test_app();
        let original = std::env::var("HOSTNAME").ok();

        // SAFETY: ENV_MUTEX serializes HOSTNAME mutation within this crate's tests.
        unsafe { std::env::set_var("HOSTNAME", "pod-a") };
        let (_, first) = send(&app, get("/version")).await;
        unsafe { std::env::set_var("HOSTNAME", "pod-b") };
        let (_, second) = send(&app, get("/header")).await;

        match original {
            Some(value) => unsafe { std::env::set_var("HOSTNAME", value) },
            None => unsafe { std::env::remove_var("HOSTNAME") },
        }

        assert!(first.starts_with("pod-a\n"), "got: {first}");
        assert!(second.starts_with("pod-b\n"), "got: {second}");
    }

    #[tokio::test]
    async fn header_echoes_request_metadata() {
        let app = test_app();
        let request = Request::builder()
            .uri("/header?q=1")
            .header("host", "httpbin.test")
            .header("x-test", "a")
            .body(Body::empty())
            .unwrap();

        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with("\n query param: q=1\n"), "got: {body}");

        let (json, query) = parse_echo(&body);
        assert_eq!(query, "q=1\n");
        assert_eq!(json["Path"], serde_json::json!(["/header?q=1"]));
        assert_eq!(json["URL"], serde_json::json!(["/header?q=1"]));
        assert_eq!(json["Protocol"], serde_json::json!(["HTTP/1.1"]));
        assert_eq!(json["Host"], serde_json::json!(["httpbin.test"]));
        assert_eq!(json["x-test"], serde_json::json!(["a"]));
        assert!(json.get("host").is_none(), "client host header is replaced");
        assert!(json.get("TLSHandshake").is_none());
    }

    #[tokio::test]
    async fn header_json_is_indented_under_label() {
        let app = test_app();
        let (_, body) = send(&app, get("/header")).await;
        assert!(
            body.contains("headers: {\n    \""),
            "expected two-space indented JSON under the label, got: {body}"
        );
    }

    #[tokio::test]
    async fn header_without_query_reports_empty_query() {
        let app = test_app();
        let (status, body) = send(&app, get("/header")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.ends_with("\n query param: \n"), "got: {body}");
    }

    #[tokio::test]
    async fn retry_cycle_is_deterministic() {
        let app = test_app();
        let expected = [
            (StatusCode::BAD_GATEWAY, "error, count: 2\n"),
            (StatusCode::BAD_GATEWAY, "error, count: 1\n"),
            (StatusCode::BAD_GATEWAY, "error, count: 0\n"),
            (StatusCode::OK, "success"),
        ];

        for cycle in 0..3 {
            for (status, body) in expected {
                let got = send(&app, get("/retry")).await;
                assert_eq!(got, (status, body.to_string()), "cycle {cycle}");
            }
        }
    }

    #[tokio::test]
    async fn retry_accepts_any_method() {
        let app = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/retry")
            .body(Body::from("ignored"))
            .unwrap();
        let (status, _) = send(&app, request).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retry_is_consistent_under_concurrency() {
        let app = test_app();
        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let app = app.clone();
                tokio::spawn(async move { send(&app, get("/retry")).await })
            })
            .collect();

        let mut bodies: HashMap<String, usize> = HashMap::new();
        let mut successes = 0;
        for task in tasks {
            let (status, body) = task.await.unwrap();
            if status == StatusCode::OK {
                successes += 1;
            }
            *bodies.entry(body).or_default() += 1;
        }

        assert_eq!(successes, 50, "exactly one success per four requests");
        for body in ["error, count: 2\n", "error, count: 1\n", "error, count: 0\n", "success"] {
            assert_eq!(bodies.get(body), Some(&50), "{body:?} count");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_waits_requested_seconds() {
        let app = test_app();
        let started = tokio::time::Instant::now();
        let (status, body) = send(&app, get("/timeout?time=2")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "success");
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_accepts_form_body() {
        let app = test_app();
        let request = Request::builder()
            .method("POST")
            .uri("/timeout")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("time=3"))
            .unwrap();

        let started = tokio::time::Instant::now();
        let (status, body) = send(&app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "success");
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_with_zero_or_negative_returns_immediately() {
        let app = test_app();
        for uri in ["/timeout?time=0", "/timeout?time=-10"] {
            let started = tokio::time::Instant::now();
            let (status, body) = send(&app, get(uri)).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(body, "success");
            assert!(started.elapsed() < Duration::from_secs(1), "{uri}");
        }
    }

    #[tokio::test]
    async fn timeout_rejects_missing_or_invalid_time() {
        let app = test_app();
        for uri in ["/timeout", "/timeout?time=abc", "/timeout?other=1", "/timeout?time=%zz"] {
            let (status, body) = send(&app, get(uri)).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{uri}");
            assert!(body.is_empty(), "{uri} must have an empty body");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_respects_configured_bound() {
        let state = HandlerState {
            max_timeout: Some(Duration::from_secs(5)),
            ..test_state()
        };
        let app = build_router(state);

        let started = tokio::time::Instant::now();
        let (status, _) = send(&app, get("/timeout?time=3600")).await;
        assert_eq!(status, StatusCode::OK);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5) && elapsed < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_does_not_block_other_requests() {
        let app = test_app();
        let slow = {
            let app = app.clone();
            tokio::spawn(async move { send(&app, get("/timeout?time=30")).await })
        };
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        let (status, _) = send(&app, get("/version")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(started.elapsed() < Duration::from_secs(1));

        let (status, body) = slow.await.unwrap();
        assert_eq!((status, body.as_str()), (StatusCode::OK, "success"));
    }

    #[tokio::test(start_paused = true)]
    async fn sleeping_timeouts_do_not_hold_back_new_timeouts() {
        let app = test_app();
        let sleepers: Vec<_> = (0..1100)
            .map(|_| {
                let app = app.clone();
                tokio::spawn(async move { send(&app, get("/timeout?time=30")).await })
            })
            .collect();
        tokio::task::yield_now().await;

        let started = tokio::time::Instant::now();
        let (status, body) = send(&app, get("/timeout?time=0")).await;
        assert_eq!((status, body.as_str()), (StatusCode::OK, "success"));
        assert!(
            started.elapsed() < Duration::from_secs(1),
            "a zero-second timeout must not wait behind sleeping ones"
        );

        for sleeper in sleepers {
            let (status, _) = sleeper.await.unwrap();
            assert_eq!(status, StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn unknown_paths_fall_back_to_404() {
        let app = test_app();
        for uri in ["/", "/versions", "/retry/extra", "/metrics"] {
            let (status, _) = send(&app, get(uri)).await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
        }
    }

    async fn start_server(tls: Option<axum_server::tls_rustls::RustlsConfig>) -> (std::net::SocketAddr, Handle) {
        let handle = Handle::new();
        tokio::spawn(server::serve(
            "127.0.0.1:0".parse().unwrap(),
            tls,
            test_app(),
            handle.clone(),
        ));
        let addr = handle.listening().await.expect("server must bind");
        (addr, handle)
    }

    #[tokio::test]
    async fn plaintext_listener_serves_endpoints() {
        let (addr, handle) = start_server(None).await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!("http://{addr}/header?q=1"))
            .header("x-test", "a")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 200);
        let body = response.text().await.unwrap();
        let (json, _) = parse_echo(&body);
        assert_eq!(json["Protocol"], serde_json::json!(["HTTP/1.1"]));
        assert_eq!(json["Host"], serde_json::json!([addr.to_string()]));
        assert!(json.get("TLSHandshake").is_none());

        let response = client
            .get(format!("http://{addr}/retry"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 502);

        handle.shutdown();
    }

    /// Poll until the server tracks `expected` open connections.
    async fn wait_for_connections(handle: &Handle, expected: usize) -> bool {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.connection_count() != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn client_disconnect_cancels_timeout_sleep() {
        let (addr, handle) = start_server(None).await;

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /timeout?time=3600 HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        assert!(
            wait_for_connections(&handle, 1).await,
            "sleeping request must hold its connection open"
        );

        drop(stream);
        assert!(
            wait_for_connections(&handle, 0).await,
            "dropping the client must end the hour-long sleep"
        );

        handle.shutdown();
    }

    async fn tls_request(
        addr: std::net::SocketAddr,
        client_config: rustls::ClientConfig,
        path: &str,
    ) -> String {
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
        let tcp = tokio::net::TcpStream::connect(addr).await.unwrap();
        let server_name = rustls::pki_types::ServerName::try_from("localhost").unwrap();

        let mut buf = Vec::new();
        if let Ok(mut stream) = connector.connect(server_name, tcp).await {
            let request =
                format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
            if stream.write_all(request.as_bytes()).await.is_ok() {
                // A peer that closes without close_notify ends in an error; keep what was read.
                let _ = stream.read_to_end(&mut buf).await;
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn client_trusting(cert: rustls::pki_types::CertificateDer<'static>) -> rustls::ClientConfig {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(cert).unwrap();
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }

    #[tokio::test]
    async fn tls_listener_reports_completed_handshake() {
        let pki = tls::tests::test_pki();
        let rustls = tls::load_rustls_config(&pki.paths, false).unwrap();
        let (addr, handle) = start_server(Some(rustls)).await;

        let response = tls_request(addr, client_trusting(pki.cert_der.clone()), "/header").await;
        assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");

        let (_, body) = response.split_once("\r\n\r\n").unwrap();
        let (json, _) = parse_echo(body);
        assert_eq!(json["TLSHandshake"], serde_json::json!(["true"]));
        assert_eq!(json["Protocol"], serde_json::json!(["HTTP/1.1"]));

        handle.shutdown();
    }

    #[tokio::test]
    async fn client_verification_rejects_anonymous_clients() {
        let pki = tls::tests::test_pki();
        let rustls = tls::load_rustls_config(&pki.paths, true).unwrap();
        let (addr, handle) = start_server(Some(rustls)).await;

        let response = tls_request(addr, client_trusting(pki.cert_der.clone()), "/version").await;
        assert!(
            !response.contains(" 200 "),
            "request without a client certificate must not be served, got: {response}"
        );

        handle.shutdown();
    }
}
