//! Request handlers
//!
//! - `/version`: hostname + configured version
//! - `/header`: echoes request metadata as JSON
//! - `/timeout`: sleeps for a client-chosen number of seconds
//! - `/retry`: fails a fixed number of times before each success
//!
//! Handlers accept any method. The only shared mutable state is the
//! `FaultCounter` behind `/retry`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, Method, StatusCode, Version, header};
use axum::response::{IntoResponse, Response};
use fault_injection::{FaultCounter, Outcome};
use tracing::{debug, error, info, warn};
use url::form_urlencoded;

use crate::config::Config;
use crate::error::HandlerError;
use crate::metrics;
use crate::tls::TlsSession;

/// Environment variable holding the pod/host identity. Read on every request.
const HOSTNAME_VAR: &str = "HOSTNAME";

/// Largest form body `/timeout` will read.
const MAX_FORM_BODY: usize = 10 * 1024 * 1024;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Shared state passed to the handlers via axum State extractor
#[derive(Clone)]
pub struct HandlerState {
    pub version: Arc<str>,
    pub fault: Arc<FaultCounter>,
    pub max_timeout: Option<Duration>,
}

impl HandlerState {
    pub fn new(config: &Config, fault: Arc<FaultCounter>) -> Self {
        Self {
            version: Arc::from(config.version.as_str()),
            fault,
            max_timeout: config.max_timeout,
        }
    }

    /// Sleep duration for a requested number of seconds. Zero and negative
    /// requests do not sleep; `max_timeout`, when set, caps the rest.
    fn delay_for(&self, seconds: i64) -> Duration {
        let requested = Duration::from_secs(seconds.max(0).unsigned_abs());
        match self.max_timeout {
            Some(max) if requested > max => {
                warn!(
                    requested_secs = seconds,
                    max_secs = max.as_secs(),
                    "timeout request exceeds configured bound, clamping"
                );
                max
            }
            _ => requested,
        }
    }
}

fn hostname_line() -> String {
    let hostname = std::env::var(HOSTNAME_VAR).unwrap_or_default();
    format!("{hostname}\n")
}

/// `/version`: hostname line, then `version: {version}`.
pub async fn version(State(state): State<HandlerState>) -> String {
    format!("{}version: {}\n", hostname_line(), state.version)
}

/// `/header`: hostname line, the augmented header map as indented JSON, then
/// the raw query string.
pub async fn header(request: Request) -> Result<String, HandlerError> {
    let (parts, _body) = request.into_parts();
    let echo = echo_headers(&parts);

    let json = indented_json(&echo).map_err(|e| {
        error!(error = %e, degraded_echo = true, "header echo serialization failed");
        HandlerError::from(e)
    })?;

    Ok(format!(
        "{}headers: {json}\n query param: {}\n",
        hostname_line(),
        parts.uri.query().unwrap_or("")
    ))
}

/// Two-space indented JSON where every line after the first carries an extra
/// two-space prefix, so the block sits indented under the `headers:` label.
fn indented_json(echo: &BTreeMap<String, Vec<String>>) -> serde_json::Result<String> {
    // JSON strings escape newlines, so every raw newline is a line break
    Ok(serde_json::to_string_pretty(echo)?.replace('\n', "\n  "))
}

/// Build the echo record: request headers grouped by name, plus synthetic
/// `Host`, `Path`, `Protocol`, `URL` and (TLS only) `TLSHandshake` entries.
///
/// Header names arrive lowercased from the transport, so synthetic keys are
/// compared case-insensitively and replace any client header of the same
/// name: a client `host` header is dropped in favour of the synthetic `Host`.
pub fn echo_headers(parts: &Parts) -> BTreeMap<String, Vec<String>> {
    let mut echo: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in &parts.headers {
        echo.entry(name.as_str().to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_owned())
        .unwrap_or_else(|| parts.uri.path().to_owned());

    let mut synthetic = vec![
        ("Host", request_host(parts)),
        ("Path", target.clone()),
        ("Protocol", protocol(parts.version).to_owned()),
        ("URL", target),
    ];
    if let Some(session) = parts.extensions.get::<TlsSession>() {
        synthetic.push(("TLSHandshake", session.handshake_complete.to_string()));
    }

    for (key, value) in synthetic {
        echo.retain(|name, _| !name.eq_ignore_ascii_case(key));
        echo.insert(key.to_owned(), vec![value]);
    }
    echo
}

/// Host from the `Host` header, falling back to the URI authority (HTTP/2).
fn request_host(parts: &Parts) -> String {
    parts
        .headers
        .get(header::HOST)
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned())
        .or_else(|| parts.uri.authority().map(|a| a.as_str().to_owned()))
        .unwrap_or_default()
}

fn protocol(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_11 => "HTTP/1.1",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/?",
    }
}

/// `/timeout`: sleep for `time` seconds, then answer `success`.
///
/// 503 with an empty body when the form cannot be parsed or `time` is missing
/// or not an integer. The sleep has no upper bound unless `max_timeout` is
/// configured. If the client goes away, the server drops this future and the
/// sleep is cancelled with it.
pub async fn timeout(State(state): State<HandlerState>, request: Request) -> Response {
    let seconds = match requested_seconds(request).await {
        Ok(seconds) => seconds,
        Err(reason) => {
            debug!(reason, "rejecting timeout request");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    let delay = state.delay_for(seconds);
    debug!(delay_secs = delay.as_secs(), "sleeping before response");
    tokio::time::sleep(delay).await;
    "success".into_response()
}

async fn requested_seconds(request: Request) -> Result<i64, &'static str> {
    let values = form_values(request, "time").await?;
    let first = values.first().ok_or("missing time field")?;
    first.parse().map_err(|_| "time is not an integer")
}

/// Values of `field` from the request form: a url-encoded body (POST, PUT,
/// PATCH) first, then the query string.
async fn form_values(request: Request, field: &str) -> Result<Vec<String>, &'static str> {
    let (parts, body) = request.into_parts();
    let mut values = Vec::new();

    if carries_form_body(&parts.method, &parts.headers) {
        let bytes = axum::body::to_bytes(body, MAX_FORM_BODY)
            .await
            .map_err(|_| "unreadable form body")?;
        values.extend(decode_field(&bytes, field)?);
    }

    if let Some(query) = parts.uri.query() {
        values.extend(decode_field(query.as_bytes(), field)?);
    }
    Ok(values)
}

fn carries_form_body(method: &Method, headers: &HeaderMap) -> bool {
    if !matches!(*method, Method::POST | Method::PUT | Method::PATCH) {
        return false;
    }
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(FORM_CONTENT_TYPE))
}

fn decode_field(input: &[u8], field: &str) -> Result<Vec<String>, &'static str> {
    if has_malformed_escape(input) {
        return Err("malformed percent-encoding");
    }
    Ok(form_urlencoded::parse(input)
        .filter(|(name, _)| name == field)
        .map(|(_, value)| value.into_owned())
        .collect())
}

/// A `%` not followed by two hex digits makes the whole form invalid.
fn has_malformed_escape(input: &[u8]) -> bool {
    input.iter().enumerate().any(|(i, &byte)| {
        byte == b'%'
            && !matches!(
                (input.get(i + 1), input.get(i + 2)),
                (Some(hi), Some(lo)) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit()
            )
    })
}

/// `/retry`: 502 `error, count: N` while the fault counter is non-zero, then
/// 200 `success` and the counter starts over.
///
/// The 502s are the product of this endpoint, so they are logged at info.
pub async fn retry(State(state): State<HandlerState>) -> Response {
    let attempt = state.fault.attempt();
    info!(count = attempt.observed, "receive request");
    metrics::set_retry_remaining(attempt.remaining(state.fault.threshold()));

    match attempt.outcome {
        Outcome::Failed { remaining } => (
            StatusCode::BAD_GATEWAY,
            format!("error, count: {remaining}\n"),
        )
            .into_response(),
        Outcome::Succeeded => "success".into_response(),
    }
}
