//! Upstream forwarding through the frag-TLS client, with byte accounting.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Request, Response, StatusCode, Uri, Version};
use tracing::warn;

use crate::metrics::body::{CountingBody, Finisher};
use crate::metrics::RequestEvent;

use super::server::ProxyCtx;

pub(crate) type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers consumed by this hop, never forwarded (RFC 9110 §7.6.1 plus the
/// legacy proxy pair).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub(crate) fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

pub(crate) fn text_body(text: &'static str) -> ProxyBody {
    Full::new(Bytes::from_static(text.as_bytes()))
        .map_err(|never| match never {})
        .boxed()
}

pub(crate) fn status_response(status: StatusCode, text: &'static str) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(text_body(text))
        .expect("static response parts are valid")
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Rewrites the absolute-form request for upstream and proxies it through
/// the shared client. Bodies stream in both directions; the request event is
/// emitted when the response body completes.
pub(crate) async fn forward(ctx: &ProxyCtx, req: Request<Incoming>) -> Response<ProxyBody> {
    let started = Instant::now();
    let (mut parts, body) = req.into_parts();

    // A missing scheme means https here.
    if parts.uri.scheme().is_none() {
        if let Some(authority) = parts.uri.authority().cloned() {
            let path_and_query = parts
                .uri
                .path_and_query()
                .map_or("/", |pq| pq.as_str())
                .to_owned();
            match Uri::builder()
                .scheme("https")
                .authority(authority)
                .path_and_query(path_and_query)
                .build()
            {
                Ok(uri) => parts.uri = uri,
                Err(_) => return status_response(StatusCode::BAD_REQUEST, "bad request"),
            }
        }
    }

    let host = parts.uri.host().unwrap_or_default().to_owned();
    let path = {
        let p = parts.uri.path();
        if p.is_empty() {
            "/".to_owned()
        } else {
            p.to_owned()
        }
    };
    let method = parts.method.to_string();

    strip_hop_by_hop(&mut parts.headers);
    if let Some(authority) = parts.uri.authority() {
        if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
            parts.headers.insert(header::HOST, value);
        }
    }
    // The client picks the real protocol per pooled connection.
    parts.version = Version::HTTP_11;

    let bytes_out = Arc::new(AtomicU64::new(0));
    let bytes_in = Arc::new(AtomicU64::new(0));
    let upstream_req =
        Request::from_parts(parts, CountingBody::request(body, Arc::clone(&bytes_out)));

    let result = tokio::time::timeout(ctx.write_timeout, ctx.client.request(upstream_req)).await;
    match result {
        Ok(Ok(response)) => {
            let (mut parts, body) = response.into_parts();
            strip_hop_by_hop(&mut parts.headers);
            let finisher = Finisher {
                agg: Arc::clone(&ctx.metrics),
                host,
                method,
                path,
                code: parts.status.as_u16(),
                started,
                bytes_in: Arc::clone(&bytes_in),
                bytes_out,
            };
            let body = CountingBody::response(body, bytes_in, finisher);
            Response::from_parts(parts, body.boxed())
        }
        Ok(Err(err)) => {
            warn!(%host, %err, "upstream request failed");
            record_failure(ctx, host, method, path, started);
            status_response(StatusCode::BAD_GATEWAY, "bad gateway")
        }
        Err(_) => {
            warn!(%host, "upstream request timed out");
            record_failure(ctx, host, method, path, started);
            status_response(StatusCode::BAD_GATEWAY, "bad gateway")
        }
    }
}

fn record_failure(ctx: &ProxyCtx, host: String, method: String, path: String, started: Instant) {
    ctx.metrics.add(RequestEvent {
        ts: Utc::now(),
        host,
        method,
        path,
        code: 0,
        ms: started.elapsed().as_millis() as i64,
        bytes_in: 0,
        bytes_out: 0,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONNECTION, HeaderValue::from_static("x-drop-me"));
        headers.insert("x-drop-me", HeaderValue::from_static("1"));
        headers.insert("proxy-connection", HeaderValue::from_static("keep-alive"));
        headers.insert("proxy-authorization", HeaderValue::from_static("Basic zzz"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-keep-me", HeaderValue::from_static("1"));

        strip_hop_by_hop(&mut headers);

        assert!(headers.get("x-drop-me").is_none());
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("proxy-connection").is_none());
        assert!(headers.get("proxy-authorization").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("x-keep-me").unwrap(), "1");
    }
}
