//! Metrics side-server: `/healthz`, `/metrics` (JSON snapshot), `/logs`
//! (Server-Sent Events).

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use futures_util::StreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Bytes, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use super::aggregator::{Aggregator, RequestEvent};

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const SSE_QUEUE: usize = 64;

type MetricsBody = BoxBody<Bytes, Infallible>;

fn text(body: &'static str) -> MetricsBody {
    Full::new(Bytes::from_static(body.as_bytes())).boxed()
}

pub async fn run(
    addr: &str,
    agg: Arc<Aggregator>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind metrics listener on {addr}"))?;
    info!("metrics listening on {addr}");

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, _) = match result {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        warn!(%err, "metrics accept failed");
                        continue;
                    }
                };
                let agg = Arc::clone(&agg);
                tokio::spawn(async move {
                    let service = service_fn(move |req| handle(req, Arc::clone(&agg)));
                    let conn = http1::Builder::new()
                        .timer(TokioTimer::new())
                        .header_read_timeout(HEADER_READ_TIMEOUT)
                        .serve_connection(TokioIo::new(stream), service);
                    if let Err(err) = conn.await {
                        warn!(%err, "metrics connection error");
                    }
                });
            }
            _ = shutdown.changed() => {
                info!("metrics server shutting down");
                break;
            }
        }
    }
    Ok(())
}

async fn handle<B>(
    req: Request<B>,
    agg: Arc<Aggregator>,
) -> Result<Response<MetricsBody>, Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => Response::new(text("ok")),
        (&Method::GET, "/metrics") => {
            let body = serde_json::to_vec(&agg.snapshot()).unwrap_or_default();
            Response::builder()
                .header(header::CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body)).boxed())
                .expect("static response parts are valid")
        }
        (&Method::GET, "/logs") => event_stream(&agg),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(text("not found"))
            .expect("static response parts are valid"),
    };
    Ok(response)
}

fn sse_frame(event: &RequestEvent) -> Bytes {
    let json = serde_json::to_string(event).unwrap_or_default();
    Bytes::from(format!("data: {json}\n\n"))
}

/// Streams the recent backlog, then live events, with a comment line every
/// 30 s of silence so idle connections stay open.
fn event_stream(agg: &Aggregator) -> Response<MetricsBody> {
    let (backlog, mut events) = agg.subscribe();
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(SSE_QUEUE);

    tokio::spawn(async move {
        for event in &backlog {
            if tx.send(sse_frame(event)).await.is_err() {
                return;
            }
        }
        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        if tx.send(sse_frame(&event)).await.is_err() {
                            return;
                        }
                    }
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return,
                },
                () = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                    if tx.send(Bytes::from_static(b": keepalive\n\n")).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(|chunk| Ok::<_, Infallible>(Frame::data(chunk)));
    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(BodyExt::boxed(StreamBody::new(stream)))
        .expect("static response parts are valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(host: &str) -> RequestEvent {
        RequestEvent {
            ts: Utc::now(),
            host: host.to_owned(),
            method: "GET".to_owned(),
            path: "/".to_owned(),
            code: 200,
            ms: 1,
            bytes_in: 1,
            bytes_out: 1,
        }
    }

    async fn get(path: &str, agg: &Arc<Aggregator>) -> Response<MetricsBody> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(path)
            .body(())
            .unwrap();
        handle(req, Arc::clone(agg)).await.unwrap()
    }

    #[tokio::test]
    async fn healthz_and_metrics_endpoints() {
        let agg = Arc::new(Aggregator::new());
        agg.add(event("a.example"));

        let health = get("/healthz", &agg).await;
        assert_eq!(health.status(), StatusCode::OK);
        let body = health.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"ok");

        let metrics = get("/metrics", &agg).await;
        assert_eq!(
            metrics.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = metrics.into_body().collect().await.unwrap().to_bytes();
        let snap: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(snap["totalRequests"], 1);
        assert!(snap["hosts"]["a.example"].is_object());

        let missing = get("/nope", &agg).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sse_stream_replays_backlog_and_live_events() {
        let agg = Arc::new(Aggregator::new());
        agg.add(event("backlog.example"));

        let response = event_stream(&agg);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/event-stream"
        );
        let mut body = response.into_body();

        let frame = body.frame().await.unwrap().unwrap();
        let chunk = frame.into_data().unwrap();
        let line = String::from_utf8(chunk.to_vec()).unwrap();
        assert!(line.starts_with("data: "));
        assert!(line.contains("backlog.example"));
        assert!(line.ends_with("\n\n"));

        agg.add(event("live.example"));
        let frame = body.frame().await.unwrap().unwrap();
        let chunk = frame.into_data().unwrap();
        assert!(String::from_utf8(chunk.to_vec())
            .unwrap()
            .contains("live.example"));
    }
}
