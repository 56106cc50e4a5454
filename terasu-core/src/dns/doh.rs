//! DNS-over-HTTPS in the JSON variant (`application/dns-json`).
//!
//! The DoH connection itself goes out through the frag-TLS dialer, but the
//! DoH server's own hostname is resolved via the system resolver (with the
//! shared cache) — the cascade cannot depend on itself.

use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body_util::{BodyExt, Empty};
use hyper::body::Bytes;
use hyper::{header, Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::ClientConfig;
use serde::Deserialize;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::dns::ResolverInner;
use crate::egress::{self, BoxError, EgressConnection};
use crate::error::{is_transient_io, DnsError};
use crate::probe;
use crate::tls;

const RECORD_TYPE_A: u16 = 1;
const RECORD_TYPE_AAAA: u16 = 28;

pub(crate) type DohClient = Client<DohConnector, Empty<Bytes>>;

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type", default)]
    rtype: u16,
    #[serde(default)]
    data: String,
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status", default)]
    status: u32,
    #[serde(rename = "Answer", default)]
    answers: Vec<DohAnswer>,
    #[serde(rename = "Comment", default)]
    comment: String,
}

impl DohResponse {
    fn hosts(&self) -> Vec<IpAddr> {
        self.answers
            .iter()
            .filter(|a| a.rtype == RECORD_TYPE_A || a.rtype == RECORD_TYPE_AAAA)
            .filter_map(|a| a.data.parse().ok())
            .collect()
    }
}

/// HTTP/2 client whose connector resolves via the system path and performs
/// the fragmented handshake with the process default length.
pub(crate) fn client(resolver: Arc<ResolverInner>) -> DohClient {
    let connector = DohConnector {
        resolver,
        config: tls::client_config(&[b"h2"]),
    };
    Client::builder(TokioExecutor::new())
        .http2_only(true)
        .build(connector)
}

/// Walks the DoH entries in pool order. The first server returning answers
/// is marked sticky; failing servers cool down unless the failure was a
/// missing route. When the cascade is dry the hard-coded fallback map is the
/// last resort.
pub(crate) async fn cascade(
    resolver: &Arc<ResolverInner>,
    host: &str,
) -> Result<Vec<IpAddr>, DnsError> {
    let client = resolver
        .doh
        .get()
        .expect("doh client is initialized at resolver construction");
    for entry in resolver.pool.doh_entries().await {
        if !entry.usable() {
            continue;
        }
        debug!(server = %entry.addr(), %host, "DoH lookup");
        match lookup(client, entry.addr(), host).await {
            Ok(addrs) if !addrs.is_empty() => {
                entry.mark_sticky();
                return Ok(addrs);
            }
            Ok(_) => {}
            Err(err) => {
                debug!(server = %entry.addr(), %err, "DoH lookup failed");
                if !err.is_transient() {
                    entry.cool_down();
                }
            }
        }
    }
    if let Some(addrs) = resolver.pool.fallback(host).await {
        return Ok(addrs);
    }
    Err(DnsError::NoDnsAvailable)
}

async fn lookup(client: &DohClient, server: &str, host: &str) -> Result<Vec<IpAddr>, DnsError> {
    let preferred = if probe::is_ipv6_available() {
        RECORD_TYPE_AAAA
    } else {
        RECORD_TYPE_A
    };
    match query(client, server, host, preferred).await {
        Ok(addrs) => Ok(addrs),
        // An AAAA failure still leaves A worth asking for.
        Err(_) if preferred == RECORD_TYPE_AAAA => query(client, server, host, RECORD_TYPE_A).await,
        Err(err) => Err(err),
    }
}

async fn query(
    client: &DohClient,
    server: &str,
    host: &str,
    rtype: u16,
) -> Result<Vec<IpAddr>, DnsError> {
    let mut url =
        Url::parse(server).map_err(|_| DnsError::InvalidName(server.to_owned()))?;
    url.query_pairs_mut()
        .append_pair("name", host)
        .append_pair("type", &rtype.to_string());
    let uri: Uri = url
        .as_str()
        .parse()
        .map_err(|_| DnsError::InvalidName(url.to_string()))?;

    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header(header::ACCEPT, "application/dns-json")
        .body(Empty::new())
        .map_err(|err| DnsError::DohRequest(err.to_string()))?;

    let response = client.request(request).await.map_err(classify_client_err)?;
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|err| DnsError::DohRequest(err.to_string()))?
        .to_bytes();

    let decoded: DohResponse = serde_json::from_slice(&body)?;
    if decoded.status != 0 {
        return Err(DnsError::DohStatus {
            status: decoded.status,
            comment: decoded.comment,
        });
    }
    Ok(decoded.hosts())
}

/// Surfaces a missing route buried in the client error as an io error so the
/// health policy can spare the upstream.
fn classify_client_err(err: hyper_util::client::legacy::Error) -> DnsError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            if is_transient_io(io_err) {
                return DnsError::Io(io::Error::new(io_err.kind(), err.to_string()));
            }
        }
        source = cause.source();
    }
    DnsError::DohRequest(err.to_string())
}

/// Connector for the DoH client: system-resolved addresses, frag-TLS
/// handshake with plain retry, ALPN pinned to h2.
#[derive(Clone)]
pub(crate) struct DohConnector {
    resolver: Arc<ResolverInner>,
    config: Arc<ClientConfig>,
}

impl tower::Service<Uri> for DohConnector {
    type Response = EgressConnection;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<EgressConnection, BoxError>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let resolver = Arc::clone(&self.resolver);
        let config = Arc::clone(&self.config);
        Box::pin(async move {
            let host = dst
                .host()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "uri has no host"))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_owned();
            let port = dst.port_u16().unwrap_or(443);
            let addrs = if let Ok(ip) = host.parse::<IpAddr>() {
                vec![ip]
            } else {
                resolver
                    .lookup_cached_system(&host)
                    .await
                    .map_err(io::Error::other)?
            };
            let server_name = tls::server_name(&host)?;
            let connector = TlsConnector::from(config);
            let stream = egress::dial_with_fallback(
                &connector,
                server_name,
                &addrs,
                port,
                resolver.first_fragment_len,
                resolver.pool.dot_timeout(),
            )
            .await?;
            Ok(EgressConnection::from_tls(stream))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_answers_and_filters_by_type() {
        let body = r#"{
            "Status": 0,
            "TC": false,
            "Answer": [
                {"name": "example.com.", "type": 1, "TTL": 299, "data": "93.184.216.34"},
                {"name": "example.com.", "type": 5, "TTL": 299, "data": "alias.example.net."},
                {"name": "example.com.", "type": 28, "TTL": 299, "data": "2606:2800:220:1:248:1893:25c8:1946"}
            ]
        }"#;
        let decoded: DohResponse = serde_json::from_str(body).unwrap();
        assert_eq!(decoded.status, 0);
        let hosts = decoded.hosts();
        assert_eq!(
            hosts,
            vec![
                "93.184.216.34".parse::<IpAddr>().unwrap(),
                "2606:2800:220:1:248:1893:25c8:1946".parse::<IpAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn nonzero_status_carries_comment() {
        let body = r#"{"Status": 2, "Comment": "server failure"}"#;
        let decoded: DohResponse = serde_json::from_str(body).unwrap();
        assert_eq!(decoded.status, 2);
        assert_eq!(decoded.comment, "server failure");
        assert!(decoded.hosts().is_empty());
    }

    #[test]
    fn missing_answer_section_defaults_to_empty() {
        let decoded: DohResponse = serde_json::from_str(r#"{"Status": 0}"#).unwrap();
        assert!(decoded.hosts().is_empty());
    }
}
