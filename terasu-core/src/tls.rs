//! Client-side TLS configuration and the frag-TLS handshake entry point.

use std::io;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::warn;

use crate::fragment::FragmentedStream;

/// TLS stream type produced by every egress dial in this crate.
pub type FragTlsStream = TlsStream<FragmentedStream<TcpStream>>;

/// Platform trust store, falling back to the bundled webpki roots when the
/// native store cannot be loaded.
pub fn root_store() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    if native.certs.is_empty() {
        if let Some(err) = native.errors.first() {
            warn!("failed to load native TLS roots ({err}), falling back to webpki roots");
        }
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    } else {
        for cert in native.certs {
            let _ = roots.add(cert);
        }
    }
    roots
}

/// Builds a client config on the platform trust store with the given ALPN
/// protocols. rustls only speaks TLS 1.2 and 1.3, which matches the minimum
/// version every dial in this crate requires.
pub fn client_config(alpn: &[&[u8]]) -> Arc<ClientConfig> {
    let mut config = ClientConfig::builder()
        .with_root_certificates(root_store())
        .with_no_client_auth();
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Arc::new(config)
}

/// Runs a client handshake over `stream` with the first handshake record
/// split at `first_fragment_len` bytes (0 = stock handshake). Handshake
/// errors are returned verbatim; fallback policy belongs to the caller.
pub async fn handshake<S>(
    connector: &TlsConnector,
    server_name: ServerName<'static>,
    stream: S,
    first_fragment_len: u8,
) -> io::Result<TlsStream<FragmentedStream<S>>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    connector
        .connect(server_name, FragmentedStream::new(stream, first_fragment_len))
        .await
}

/// Parses a host into a `ServerName`, accepting both DNS names and IP
/// literals (with or without IPv6 brackets).
pub fn server_name(host: &str) -> io::Result<ServerName<'static>> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_owned())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid server name {host:?}")))
}
