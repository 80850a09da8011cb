//! Streaming tee: duplicates a successful streaming upstream response into
//! the client sink (unbounded, network-backpressured) and a bounded
//! in-memory accounting sink, without ever blocking the former on the
//! latter.

use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Bounded ring buffer retaining the *head* of the stream — the first
/// `capacity` bytes seen are kept, everything after is dropped but still
/// counted so `truncated` reflects whether anything was lost.
pub struct TeeBuffer {
    capacity: usize,
    bytes: Vec<u8>,
    truncated: bool,
}

impl TeeBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            bytes: Vec::new(),
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let remaining = self.capacity.saturating_sub(self.bytes.len());
        if remaining == 0 {
            if !chunk.is_empty() {
                self.truncated = true;
            }
            return;
        }
        let take = remaining.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..take]);
        if take < chunk.len() {
            self.truncated = true;
        }
    }

    pub fn snapshot(&self) -> (Vec<u8>, bool) {
        (self.bytes.clone(), self.truncated)
    }
}

pub type SharedTeeBuffer = Arc<Mutex<TeeBuffer>>;

/// Wraps an upstream byte stream, writing every chunk into the shared
/// accounting buffer as a side effect while passing it through unchanged
/// to whatever consumes this stream (the client response body).
///
/// `done` fires exactly once with the buffer's final `truncated` flag: on
/// clean EOF, on an upstream error, or — via `Drop` — on early cancellation
/// (client disconnect). This is what lets the orchestrator defer a
/// streaming request's `UsageRecord` until the stream has actually
/// finished, rather than at the moment headers came back.
pub struct TeeStream<S> {
    inner: S,
    accounting: SharedTeeBuffer,
    done: Option<oneshot::Sender<bool>>,
}

impl<S> TeeStream<S> {
    pub fn new(inner: S, accounting: SharedTeeBuffer, done: oneshot::Sender<bool>) -> Self {
        Self {
            inner,
            accounting,
            done: Some(done),
        }
    }

    fn finish(&mut self) {
        if let Some(done) = self.done.take() {
            let truncated = self.accounting.lock().map(|b| b.truncated).unwrap_or(false);
            let _ = done.send(truncated);
        }
    }
}

impl<S, E> Stream for TeeStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                // Accounting write never blocks or back-pressures the
                // client path: it's a sync mutex over an in-memory Vec.
                if let Ok(mut buf) = self.accounting.lock() {
                    buf.push(&chunk);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(None) => {
                self.finish();
                Poll::Ready(None)
            }
            Poll::Ready(Some(Err(err))) => {
                self.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> Drop for TeeStream<S> {
    /// Covers client-disconnect cancellation: axum drops the body stream
    /// without polling it to completion, so EOF never arrives through
    /// `poll_next`. The buffer reflects whatever was seen before drop.
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_retains_head_and_flags_truncation() {
        let mut buf = TeeBuffer::new(4);
        buf.push(b"ab");
        buf.push(b"cdef");
        let (bytes, truncated) = buf.snapshot();
        assert_eq!(bytes, b"abcd");
        assert!(truncated);
    }

    #[test]
    fn buffer_not_truncated_when_under_capacity() {
        let mut buf = TeeBuffer::new(1024);
        buf.push(b"hello");
        let (bytes, truncated) = buf.snapshot();
        assert_eq!(bytes, b"hello");
        assert!(!truncated);
    }

    #[tokio::test]
    async fn done_fires_with_truncated_flag_on_eof() {
        let accounting: SharedTeeBuffer = Arc::new(Mutex::new(TeeBuffer::new(2)));
        let chunks: Vec<Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"abcdef"))];
        let (tx, rx) = oneshot::channel();
        let mut teed = TeeStream::new(futures::stream::iter(chunks), accounting, tx);

        use futures::StreamExt;
        while teed.next().await.is_some() {}
        drop(teed);

        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn done_fires_on_drop_before_eof() {
        let accounting: SharedTeeBuffer = Arc::new(Mutex::new(TeeBuffer::new(64)));
        let (tx, rx) = oneshot::channel();
        let pending = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        let teed = TeeStream::new(pending, accounting, tx);

        drop(teed);

        assert!(!rx.await.unwrap());
    }
}
