//! Proxy front-end: accept loop, auth, CONNECT tunneling and MITM.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context as _, Result};
use chrono::Utc;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{header, Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::graceful::GracefulShutdown;
use rustls::server::ResolvesServerCert;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use terasu_core::FragTlsConnector;

use crate::auth::BasicAuth;
use crate::metrics::body::CountingBody;
use crate::metrics::{Aggregator, RequestEvent};
use crate::rules::{strip_port, Rules};

use super::forward::{self, empty_body, status_response, ProxyBody};

/// TCP dial timeout for opaque tunnels.
const TUNNEL_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// In-flight requests get this long to finish once shutdown starts.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub type EgressClient = Client<FragTlsConnector, CountingBody<Incoming>>;

/// Everything a connection handler needs.
pub struct ProxyCtx {
    pub auth: BasicAuth,
    pub rules: Rules,
    pub client: EgressClient,
    pub metrics: Arc<Aggregator>,
    pub tls_server: Arc<ServerConfig>,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_conns: usize,
}

/// TLS server config for the MITM side: leaf certs resolved per SNI from
/// the store, h2 and http/1.1 offered.
pub fn mitm_server_config(store: Arc<dyn ResolvesServerCert>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(store);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

/// Accept loop. `max_conns` is enforced by a semaphore acquired before
/// `accept`, so excess connections queue in the listen backlog. Shutdown
/// stops accepting, then drains in-flight connections with a deadline.
pub async fn run(
    ctx: Arc<ProxyCtx>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let graceful = GracefulShutdown::new();
    let semaphore = (ctx.max_conns > 0).then(|| Arc::new(Semaphore::new(ctx.max_conns)));

    loop {
        let permit = match &semaphore {
            Some(sem) => tokio::select! {
                permit = Arc::clone(sem).acquire_owned() => {
                    Some(permit.expect("connection semaphore never closed"))
                }
                _ = shutdown.changed() => break,
            },
            None => None,
        };

        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "accept failed");
                        continue;
                    }
                };
                let read_timeout = ctx.read_timeout;
                let ctx = Arc::clone(&ctx);
                let service = service_fn(move |req| handle(req, Arc::clone(&ctx)));
                let conn = http1::Builder::new()
                    .preserve_header_case(true)
                    .timer(TokioTimer::new())
                    .header_read_timeout(read_timeout)
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades();
                let conn = graceful.watch(conn);
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = conn.await {
                        debug!(%peer, %err, "connection ended with error");
                    }
                });
            }
            _ = shutdown.changed() => break,
        }
    }

    info!("draining in-flight connections");
    tokio::select! {
        () = graceful.shutdown() => info!("all connections drained"),
        () = tokio::time::sleep(SHUTDOWN_TIMEOUT) => warn!("graceful shutdown timed out"),
    }
    Ok(())
}

async fn handle(
    req: Request<Incoming>,
    ctx: Arc<ProxyCtx>,
) -> Result<Response<ProxyBody>, Infallible> {
    if !ctx.auth.check(req.headers().get(header::PROXY_AUTHORIZATION)) {
        let response = Response::builder()
            .status(StatusCode::PROXY_AUTHENTICATION_REQUIRED)
            .header(
                header::PROXY_AUTHENTICATE,
                "Basic realm=\"terasu-proxy\"",
            )
            .body(forward::text_body("proxy auth required"))
            .expect("static response parts are valid");
        return Ok(response);
    }

    if req.method() == Method::CONNECT {
        return Ok(handle_connect(req, ctx));
    }

    // Anything else must be an absolute-form proxy request.
    if req.uri().host().is_none() {
        return Ok(status_response(StatusCode::BAD_REQUEST, "bad request"));
    }
    Ok(forward::forward(&ctx, req).await)
}

/// Answers `200` and finishes the CONNECT on the upgraded socket in a
/// separate task: opaque tunnel or MITM per policy.
fn handle_connect(req: Request<Incoming>, ctx: Arc<ProxyCtx>) -> Response<ProxyBody> {
    let target = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    if target.is_empty() {
        return status_response(StatusCode::BAD_REQUEST, "bad connect");
    }

    let intercept = ctx.rules.should_intercept(&target);
    debug!(%target, intercept, "CONNECT");

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let result = if intercept {
                    mitm(upgraded, &target, ctx).await
                } else {
                    tunnel(upgraded, &target, ctx).await
                };
                if let Err(err) = result {
                    warn!(%target, "CONNECT handling failed: {err:#}");
                }
            }
            Err(err) => warn!(%err, "CONNECT upgrade failed"),
        }
    });

    Response::new(empty_body())
}

/// Copies until EOF or error, then shuts the write half down. The count of
/// bytes actually delivered is returned either way.
async fn copy_counted<R, W>(mut reader: R, mut writer: W) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                total += n as u64;
            }
        }
    }
    let _ = writer.shutdown().await;
    total
}

/// Opaque tunnel: dial the target, copy both directions concurrently, and
/// close only after both sides finish. Records a synthetic CONNECT event.
async fn tunnel(upgraded: Upgraded, target: &str, ctx: Arc<ProxyCtx>) -> Result<()> {
    let started = Instant::now();
    let upstream = tokio::time::timeout(TUNNEL_CONNECT_TIMEOUT, TcpStream::connect(target))
        .await
        .context("tunnel dial timed out")?
        .with_context(|| format!("dial {target}"))?;

    let (client_read, client_write) = tokio::io::split(TokioIo::new(upgraded));
    let (upstream_read, upstream_write) = upstream.into_split();

    let up = tokio::spawn(copy_counted(client_read, upstream_write));
    let down = tokio::spawn(copy_counted(upstream_read, client_write));
    let (up, down) = tokio::join!(up, down);
    let (bytes_out, bytes_in) = (up.unwrap_or(0), down.unwrap_or(0));

    ctx.metrics.add(RequestEvent {
        ts: Utc::now(),
        host: strip_port(target).to_owned(),
        method: Method::CONNECT.to_string(),
        path: "/".to_owned(),
        code: 200,
        ms: started.elapsed().as_millis() as i64,
        bytes_in,
        bytes_out,
    });
    Ok(())
}

/// MITM: terminate TLS on the client socket with a minted leaf, serve one
/// HTTP connection on top, and re-originate each request upstream.
async fn mitm(upgraded: Upgraded, target: &str, ctx: Arc<ProxyCtx>) -> Result<()> {
    let acceptor = TlsAcceptor::from(Arc::clone(&ctx.tls_server));
    let tls = acceptor
        .accept(TokioIo::new(upgraded))
        .await
        .context("client tls handshake")?;

    let target = target.to_owned();
    let service = service_fn(move |req| {
        let ctx = Arc::clone(&ctx);
        let target = target.clone();
        async move { Ok::<_, Infallible>(mitm_request(req, &target, &ctx).await) }
    });

    hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection(TokioIo::new(tls), service)
        .await
        .map_err(|err| anyhow!("serve mitm connection: {err}"))
}

/// Rewrites a decrypted request to absolute form against the CONNECT target
/// and forwards it.
async fn mitm_request(
    req: Request<Incoming>,
    target: &str,
    ctx: &ProxyCtx,
) -> Response<ProxyBody> {
    let (mut parts, body) = req.into_parts();
    if parts.uri.host().is_none() {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .to_owned();
        match Uri::builder()
            .scheme("https")
            .authority(target)
            .path_and_query(path_and_query)
            .build()
        {
            Ok(uri) => parts.uri = uri,
            Err(_) => return status_response(StatusCode::BAD_REQUEST, "bad request"),
        }
    }
    parts.headers.remove("proxy-connection");
    forward::forward(ctx, Request::from_parts(parts, body)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copy_counted_preserves_bytes_both_ways() {
        let (client, server) = tokio::io::duplex(1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);

        let echo = tokio::spawn(copy_counted(server_read, server_write));

        let payload = vec![0xA5u8; 10_000];
        let writer = {
            let payload = payload.clone();
            tokio::spawn(async move {
                let mut client_write = client_write;
                client_write.write_all(&payload).await.unwrap();
                client_write.shutdown().await.unwrap();
            })
        };

        let mut received = Vec::new();
        let mut client_read = client_read;
        client_read.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);

        writer.await.unwrap();
        assert_eq!(echo.await.unwrap(), payload.len() as u64);
    }

    #[test]
    fn mitm_config_offers_h2_and_http11() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        #[derive(Debug)]
        struct NoCert;
        impl ResolvesServerCert for NoCert {
            fn resolve(
                &self,
                _hello: rustls::server::ClientHello<'_>,
            ) -> Option<Arc<rustls::sign::CertifiedKey>> {
                None
            }
        }
        let config = mitm_server_config(Arc::new(NoCert));
        assert_eq!(
            config.alpn_protocols,
            vec![b"h2".to_vec(), b"http/1.1".to_vec()]
        );
    }
}
