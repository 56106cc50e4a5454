//! Upstream dialing: resolve, connect, frag-TLS handshake with a plain
//! retry, and the hyper connector built on top of it.

use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::Uri;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::dns::Resolver;
use crate::tls::{self, FragTlsStream};

/// TCP connect timeout for egress dials.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How egress hostnames are resolved. The frag-TLS handshake applies in
/// every mode; only the resolution path differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsMode {
    /// The built-in DoT/DoH cascade.
    Terasu,
    /// The operating system resolver.
    System,
    /// Currently identical to [`DnsMode::Terasu`].
    Auto,
}

impl DnsMode {
    /// Unrecognized strings fall back to `Auto`, matching the permissive
    /// config handling elsewhere.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "system" => Self::System,
            "terasu" => Self::Terasu,
            _ => Self::Auto,
        }
    }
}

/// Dials each address in order. Per address: TCP connect, fragmented
/// handshake; when the fragmented handshake fails the same address is
/// reconnected and retried once with a stock handshake — some servers and
/// middleboxes mishandle the split flight, and reachability wins over
/// evasion. Returns the last error when every address is exhausted.
pub(crate) async fn dial_with_fallback(
    connector: &TlsConnector,
    server_name: ServerName<'static>,
    addrs: &[IpAddr],
    port: u16,
    first_fragment_len: u8,
    connect_timeout: Duration,
) -> io::Result<FragTlsStream> {
    if addrs.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty host addr"));
    }
    let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address attempted");
    for &addr in addrs {
        let target = SocketAddr::new(addr, port);

        let tcp = match connect(target, connect_timeout).await {
            Ok(tcp) => tcp,
            Err(err) => {
                debug!(%target, %err, "tcp dial failed");
                last_err = err;
                continue;
            }
        };
        match handshake(connector, server_name.clone(), tcp, first_fragment_len).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(%target, %err, "fragmented handshake failed");
                last_err = err;
            }
        }

        if first_fragment_len == 0 {
            continue;
        }
        // Unfragmented retry on the same address.
        let tcp = match connect(target, connect_timeout).await {
            Ok(tcp) => tcp,
            Err(err) => {
                debug!(%target, %err, "tcp redial failed");
                last_err = err;
                continue;
            }
        };
        match handshake(connector, server_name.clone(), tcp, 0).await {
            Ok(stream) => {
                debug!(%target, "plain handshake fallback succeeded");
                return Ok(stream);
            }
            Err(err) => {
                debug!(%target, %err, "plain handshake failed");
                last_err = err;
            }
        }
    }
    Err(last_err)
}

async fn connect(target: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
    tokio::time::timeout(timeout, TcpStream::connect(target))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tcp connect timed out"))?
}

async fn handshake(
    connector: &TlsConnector,
    server_name: ServerName<'static>,
    tcp: TcpStream,
    first_fragment_len: u8,
) -> io::Result<FragTlsStream> {
    tokio::time::timeout(
        HANDSHAKE_TIMEOUT,
        tls::handshake(connector, server_name, tcp, first_fragment_len),
    )
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "tls handshake timed out"))?
}

/// Egress dialer: resolves per the configured DNS mode, then runs the
/// fragment-then-plain dial loop.
pub struct Egress {
    resolver: Resolver,
    mode: DnsMode,
    config: Arc<ClientConfig>,
    first_fragment_len: u8,
}

impl Egress {
    pub fn new(resolver: Resolver, mode: DnsMode, first_fragment_len: u8) -> Self {
        Self {
            resolver,
            mode,
            config: tls::client_config(&[b"h2", b"http/1.1"]),
            first_fragment_len,
        }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub async fn dial_tls(&self, host: &str, port: u16) -> io::Result<FragTlsStream> {
        let addrs = self.resolve(host).await.map_err(io::Error::other)?;
        let server_name = tls::server_name(host)?;
        let connector = TlsConnector::from(Arc::clone(&self.config));
        dial_with_fallback(
            &connector,
            server_name,
            &addrs,
            port,
            self.first_fragment_len,
            CONNECT_TIMEOUT,
        )
        .await
    }

    /// Plain TCP dial for cleartext upstreams; same resolution, no TLS.
    pub async fn dial_plain(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let addrs = self.resolve(host).await.map_err(io::Error::other)?;
        if addrs.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty host addr"));
        }
        let mut last_err = io::Error::new(io::ErrorKind::AddrNotAvailable, "no address attempted");
        for &addr in &addrs {
            match connect(SocketAddr::new(addr, port), CONNECT_TIMEOUT).await {
                Ok(tcp) => return Ok(tcp),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }

    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, crate::DnsError> {
        match self.mode {
            DnsMode::System => self.resolver.lookup_system(host).await,
            DnsMode::Terasu | DnsMode::Auto => self.resolver.lookup_host(host).await,
        }
    }
}

enum ConnInner {
    Tls(TokioIo<FragTlsStream>),
    Plain(TokioIo<TcpStream>),
}

/// An established egress connection handed to hyper. Reports `negotiated_h2`
/// so the client pool drives HTTP/2 when ALPN selected it.
pub struct EgressConnection {
    inner: ConnInner,
    is_h2: bool,
}

impl EgressConnection {
    pub(crate) fn from_tls(stream: FragTlsStream) -> Self {
        let is_h2 = stream
            .get_ref()
            .1
            .alpn_protocol()
            .map_or(false, |proto| proto == b"h2");
        Self {
            inner: ConnInner::Tls(TokioIo::new(stream)),
            is_h2,
        }
    }

    pub(crate) fn from_plain(stream: TcpStream) -> Self {
        Self {
            inner: ConnInner::Plain(TokioIo::new(stream)),
            is_h2: false,
        }
    }
}

impl Connection for EgressConnection {
    fn connected(&self) -> Connected {
        if self.is_h2 {
            Connected::new().negotiated_h2()
        } else {
            Connected::new()
        }
    }
}

impl Read for EgressConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            ConnInner::Tls(io) => Pin::new(io).poll_read(cx, buf),
            ConnInner::Plain(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl Write for EgressConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.get_mut().inner {
            ConnInner::Tls(io) => Pin::new(io).poll_write(cx, buf),
            ConnInner::Plain(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            ConnInner::Tls(io) => Pin::new(io).poll_flush(cx),
            ConnInner::Plain(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            ConnInner::Tls(io) => Pin::new(io).poll_shutdown(cx),
            ConnInner::Plain(io) => Pin::new(io).poll_shutdown(cx),
        }
    }
}

pub(crate) type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// hyper connector that egresses every connection through [`Egress`]:
/// TLS with the fragmented first flight for `https`, plain TCP for `http`.
#[derive(Clone)]
pub struct FragTlsConnector {
    egress: Arc<Egress>,
}

impl FragTlsConnector {
    pub fn new(egress: Arc<Egress>) -> Self {
        Self { egress }
    }
}

impl tower::Service<Uri> for FragTlsConnector {
    type Response = EgressConnection;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<EgressConnection, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let egress = Arc::clone(&self.egress);
        Box::pin(async move {
            let host = dst
                .host()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "uri has no host"))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_owned();
            if dst.scheme_str() == Some("http") {
                let port = dst.port_u16().unwrap_or(80);
                let stream = egress.dial_plain(&host, port).await?;
                return Ok(EgressConnection::from_plain(stream));
            }
            let port = dst.port_u16().unwrap_or(443);
            let stream = egress.dial_tls(&host, port).await?;
            Ok(EgressConnection::from_tls(stream))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dns_mode_parsing() {
        assert_eq!(DnsMode::parse("system"), DnsMode::System);
        assert_eq!(DnsMode::parse("terasu"), DnsMode::Terasu);
        assert_eq!(DnsMode::parse("auto"), DnsMode::Auto);
        assert_eq!(DnsMode::parse("TERASU"), DnsMode::Terasu);
        assert_eq!(DnsMode::parse("bogus"), DnsMode::Auto);
    }

    #[tokio::test]
    async fn empty_address_list_is_rejected() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let connector = TlsConnector::from(tls::client_config(&[]));
        let name = tls::server_name("example.com").unwrap();
        let err = dial_with_fallback(&connector, name, &[], 443, 3, CONNECT_TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
