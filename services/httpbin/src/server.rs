//! Listener setup
//!
//! Binds the configured address and serves the router over plain TCP or
//! TLS. axum-server owns the accept loop: one task per connection, requests
//! within a connection handled as the protocol allows.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;

use crate::tls::SessionAcceptor;

/// How long in-flight requests may run after a shutdown signal.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Serve `app` on `addr` until `handle` shuts the server down.
///
/// With `tls`, every connection is terminated by rustls and its requests
/// carry a `TlsSession` extension. Bind errors surface as the returned
/// `io::Error`.
pub async fn serve(
    addr: SocketAddr,
    tls: Option<RustlsConfig>,
    app: Router,
    handle: Handle,
) -> io::Result<()> {
    let service = app.into_make_service();
    match tls {
        Some(config) => {
            axum_server::bind(addr)
                .acceptor(SessionAcceptor::new(config))
                .handle(handle)
                .serve(service)
                .await
        }
        None => {
            axum_server::bind(addr)
                .handle(handle)
                .serve(service)
                .await
        }
    }
}
