//! Record-layer splitter for the first TLS handshake flight.
//!
//! Sits between the TLS client and the transport. Reads pass through
//! untouched. The first write is inspected: when it carries a complete
//! handshake record (the ClientHello), the record is re-emitted as two
//! consecutive records, the first holding exactly `first_len` payload bytes.
//! The TLS state machine above never sees the split, so the transcript hash
//! and key schedule are those of a stock handshake.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

#[derive(Debug)]
enum WriteState {
    /// First write not seen yet.
    Inspect,
    /// Draining the rewritten first flight. `boundary` marks the end of the
    /// first record so the two records go out as separate transport writes.
    Splice {
        out: Vec<u8>,
        boundary: usize,
        pos: usize,
        consumed: usize,
    },
    Passthrough,
}

/// Transport adapter that fragments the first handshake record.
#[derive(Debug)]
pub struct FragmentedStream<S> {
    inner: S,
    first_len: u8,
    state: WriteState,
}

impl<S> FragmentedStream<S> {
    pub fn new(inner: S, first_len: u8) -> Self {
        Self {
            inner,
            first_len,
            state: WriteState::Inspect,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

/// Rewrites `buf` so its leading handshake record becomes two records, the
/// first carrying exactly `first_len` payload bytes. Returns the rewritten
/// bytes and the offset where the second transport write should start, or
/// `None` when no split applies (fragmentation off, oversized `first_len`,
/// or `buf` does not start with a complete handshake record).
fn split_first_record(buf: &[u8], first_len: u8) -> Option<(Vec<u8>, usize)> {
    if first_len == 0 || buf.len() < RECORD_HEADER_LEN || buf[0] != CONTENT_TYPE_HANDSHAKE {
        return None;
    }
    let payload_len = usize::from(u16::from_be_bytes([buf[3], buf[4]]));
    if buf.len() < RECORD_HEADER_LEN + payload_len {
        return None;
    }
    let first = usize::from(first_len);
    if first >= payload_len {
        return None;
    }

    let payload = &buf[RECORD_HEADER_LEN..RECORD_HEADER_LEN + payload_len];
    let mut out = Vec::with_capacity(buf.len() + RECORD_HEADER_LEN);

    // Record #1: same outer version, `first` payload bytes.
    out.push(CONTENT_TYPE_HANDSHAKE);
    out.extend_from_slice(&buf[1..3]);
    out.extend_from_slice(&(first as u16).to_be_bytes());
    out.extend_from_slice(&payload[..first]);
    let boundary = out.len();

    // Record #2: the remainder.
    out.push(CONTENT_TYPE_HANDSHAKE);
    out.extend_from_slice(&buf[1..3]);
    out.extend_from_slice(&((payload_len - first) as u16).to_be_bytes());
    out.extend_from_slice(&payload[first..]);

    // Anything after the first record (e.g. early data) is left untouched.
    out.extend_from_slice(&buf[RECORD_HEADER_LEN + payload_len..]);

    Some((out, boundary))
}

impl<S: AsyncRead + Unpin> AsyncRead for FragmentedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for FragmentedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                WriteState::Passthrough => return Pin::new(&mut this.inner).poll_write(cx, buf),
                WriteState::Inspect => match split_first_record(buf, this.first_len) {
                    Some((out, boundary)) => {
                        this.state = WriteState::Splice {
                            out,
                            boundary,
                            pos: 0,
                            consumed: buf.len(),
                        };
                    }
                    None => this.state = WriteState::Passthrough,
                },
                WriteState::Splice {
                    out,
                    boundary,
                    pos,
                    consumed,
                } => {
                    // Two transport writes: [0, boundary) then [boundary, len).
                    while *pos < out.len() {
                        let end = if *pos < *boundary { *boundary } else { out.len() };
                        let n = ready!(Pin::new(&mut this.inner).poll_write(cx, &out[*pos..end]))?;
                        if n == 0 {
                            return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
                        }
                        *pos += n;
                    }
                    let consumed = *consumed;
                    this.state = WriteState::Passthrough;
                    return Poll::Ready(Ok(consumed));
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
