//! Byte-counting body wrappers. The request and response bodies of one
//! forwarded exchange share counters; the event is emitted exactly once,
//! when the response body finishes (or the client abandons it).

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use chrono::Utc;
use hyper::body::{Body, Bytes, Frame, SizeHint};

use super::aggregator::{Aggregator, RequestEvent};

/// Emits the final [`RequestEvent`] with whatever the counters say.
pub struct Finisher {
    pub agg: Arc<Aggregator>,
    pub host: String,
    pub method: String,
    pub path: String,
    pub code: u16,
    pub started: Instant,
    pub bytes_in: Arc<AtomicU64>,
    pub bytes_out: Arc<AtomicU64>,
}

impl Finisher {
    fn emit(self) {
        self.agg.add(RequestEvent {
            ts: Utc::now(),
            host: self.host,
            method: self.method,
            path: self.path,
            code: self.code,
            ms: self.started.elapsed().as_millis() as i64,
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        });
    }
}

pub struct CountingBody<B> {
    inner: B,
    counter: Arc<AtomicU64>,
    finisher: Option<Finisher>,
}

impl<B> CountingBody<B> {
    /// Counts data frames into `counter`; no event on completion.
    pub fn request(inner: B, counter: Arc<AtomicU64>) -> Self {
        Self {
            inner,
            counter,
            finisher: None,
        }
    }

    /// Counts data frames into `counter` and emits the event when the body
    /// ends, errors, or is dropped.
    pub fn response(inner: B, counter: Arc<AtomicU64>, finisher: Finisher) -> Self {
        Self {
            inner,
            counter,
            finisher: Some(finisher),
        }
    }
}

impl<B> Body for CountingBody<B>
where
    B: Body<Data = Bytes> + Unpin,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        match &frame {
            Some(Ok(f)) => {
                if let Some(data) = f.data_ref() {
                    this.counter.fetch_add(data.len() as u64, Ordering::Relaxed);
                }
            }
            Some(Err(_)) | None => {
                if let Some(finisher) = this.finisher.take() {
                    finisher.emit();
                }
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B> Drop for CountingBody<B> {
    fn drop(&mut self) {
        // Client walked away mid-body: report what was transferred.
        if let Some(finisher) = self.finisher.take() {
            finisher.emit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full};

    fn finisher(agg: &Arc<Aggregator>, bytes_in: &Arc<AtomicU64>) -> Finisher {
        Finisher {
            agg: Arc::clone(agg),
            host: "example.com".to_owned(),
            method: "GET".to_owned(),
            path: "/".to_owned(),
            code: 200,
            started: Instant::now(),
            bytes_in: Arc::clone(bytes_in),
            bytes_out: Arc::new(AtomicU64::new(0)),
        }
    }

    #[tokio::test]
    async fn counts_bytes_and_emits_once_on_completion() {
        let agg = Arc::new(Aggregator::new());
        let counter = Arc::new(AtomicU64::new(0));
        let body = CountingBody::response(
            Full::new(Bytes::from_static(b"hello world")),
            Arc::clone(&counter),
            finisher(&agg, &counter),
        );

        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello world");
        assert_eq!(counter.load(Ordering::Relaxed), 11);

        let json = serde_json::to_value(agg.snapshot()).unwrap();
        assert_eq!(json["totalRequests"], 1);
        assert_eq!(json["bytesIn"], 11);
    }

    #[tokio::test]
    async fn dropping_an_unfinished_body_still_emits() {
        let agg = Arc::new(Aggregator::new());
        let counter = Arc::new(AtomicU64::new(0));
        let body = CountingBody::response(
            Full::new(Bytes::from_static(b"abandoned")),
            Arc::clone(&counter),
            finisher(&agg, &counter),
        );
        drop(body);

        let json = serde_json::to_value(agg.snapshot()).unwrap();
        assert_eq!(json["totalRequests"], 1);
        assert_eq!(json["bytesIn"], 0);
    }

    #[tokio::test]
    async fn request_wrapper_counts_without_emitting() {
        let agg = Arc::new(Aggregator::new());
        let counter = Arc::new(AtomicU64::new(0));
        let body = CountingBody::request(Full::new(Bytes::from_static(b"abc")), Arc::clone(&counter));
        let _ = body.collect().await.unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 3);
        let json = serde_json::to_value(agg.snapshot()).unwrap();
        assert_eq!(json["totalRequests"], 0);
    }
}
