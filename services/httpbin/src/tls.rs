//! TLS transport setup
//!
//! Certificate material lives at fixed, well-known paths (mounted from a
//! secret in containerized test environments):
//!
//! - `/etc/httpbin/tls/tls.crt`, `/etc/httpbin/tls/tls.key`: server identity
//! - `/etc/httpbin/ca/ca.crt`: CA used to verify client certificates
//!
//! The rustls acceptor is wrapped so every request on an encrypted connection
//! carries a `TlsSession` extension. Handlers use its presence to tell TLS
//! from plaintext connections.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Extension;
use axum::middleware::AddExtension;
use axum_server::accept::Accept;
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures_util::future::BoxFuture;
use rustls::RootCertStore;
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tracing::info;

use crate::error::{Error, Result};

const TLS_CERT_PATH: &str = "/etc/httpbin/tls/tls.crt";
const TLS_KEY_PATH: &str = "/etc/httpbin/tls/tls.key";
const CA_CERT_PATH: &str = "/etc/httpbin/ca/ca.crt";

/// Locations of the PEM files. `Default` gives the fixed production paths.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

impl Default for TlsPaths {
    fn default() -> Self {
        Self {
            cert: PathBuf::from(TLS_CERT_PATH),
            key: PathBuf::from(TLS_KEY_PATH),
            ca: PathBuf::from(CA_CERT_PATH),
        }
    }
}

/// Per-connection TLS state, attached to every request as an extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsSession {
    pub handshake_complete: bool,
}

/// Build the rustls server config from PEM files.
///
/// With `verify_client`, clients must present a certificate chaining to the
/// CA at `paths.ca`; otherwise client authentication is off.
pub fn load_server_config(paths: &TlsPaths, verify_client: bool) -> Result<ServerConfig> {
    let certs = load_certs(&paths.cert)?;
    let key = load_private_key(&paths.key)?;

    let builder = if verify_client {
        let roots = load_roots(&paths.ca)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| Error::ClientVerifier(e.to_string()))?;
        ServerConfig::builder().with_client_cert_verifier(verifier)
    } else {
        ServerConfig::builder().with_no_client_auth()
    };

    let mut config = builder.with_single_cert(certs, key)?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    info!(
        cert = %paths.cert.display(),
        verify_client,
        "TLS configuration loaded"
    );
    Ok(config)
}

/// Load the server config and wrap it for axum-server.
pub fn load_rustls_config(paths: &TlsPaths, verify_client: bool) -> Result<RustlsConfig> {
    let config = load_server_config(paths, verify_client)?;
    Ok(RustlsConfig::from_config(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::io(path, e))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<io::Result<Vec<_>>>()
        .map_err(|e| Error::io(path, e))?;
    if certs.is_empty() {
        return Err(Error::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|e| Error::io(path, e))?
        .ok_or_else(|| Error::NoPrivateKey(path.to_path_buf()))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

/// rustls acceptor that tags each connection's service with its `TlsSession`.
#[derive(Clone)]
pub struct SessionAcceptor {
    inner: RustlsAcceptor,
}

impl SessionAcceptor {
    pub fn new(config: RustlsConfig) -> Self {
        Self {
            inner: RustlsAcceptor::new(config),
        }
    }
}

impl<I, S> Accept<I, S> for SessionAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, TlsSession>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let acceptor = self.inner.clone();

        Box::pin(async move {
            let (stream, service) = acceptor.accept(stream, service).await?;
            let (_, connection) = stream.get_ref();
            let session = TlsSession {
                handshake_complete: !connection.is_handshaking(),
            };
            Ok((stream, Extension(session).layer(service)))
        })
    }
}
