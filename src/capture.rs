//! Bounded response capture.
//!
//! [`CaptureBody`] sits between the downstream handler's response body and the
//! client. Every data frame is forwarded untouched while a [`CaptureBuffer`]
//! keeps at most `capacity` bytes of it as a side record for the trace.

use bytes::{Bytes, BytesMut};
use http_body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Maximum number of response body bytes retained per trace.
pub const MAX_BODY: usize = 10 * 1024;

/// Error type produced by [`CaptureBody`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fixed-budget accumulator for response bytes.
///
/// The byte counter lives here and nowhere else; a buffer is scoped to a
/// single response.
#[derive(Debug, Clone, Default)]
pub struct CaptureBuffer {
    buf: BytesMut,
    capacity: usize,
}

impl CaptureBuffer {
    /// Create an empty buffer that retains at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity.min(MAX_BODY)),
            capacity,
        }
    }

    /// Record the prefix of `chunk` that still fits in the budget.
    ///
    /// Returns the number of bytes retained from this chunk.
    pub fn record(&mut self, chunk: &[u8]) -> usize {
        let remaining = self.remaining();
        let take = chunk.len().min(remaining);
        self.buf.extend_from_slice(&chunk[..take]);
        take
    }

    /// Bytes captured so far.
    pub fn captured(&self) -> usize {
        self.buf.len()
    }

    /// Budget left before further writes are ignored.
    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.remaining() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Convert the captured bytes into a string no longer than the budget.
    ///
    /// Invalid UTF-8 is replaced with U+FFFD. A multi-byte character cut at the
    /// budget boundary is dropped rather than replaced, and the result is
    /// clipped back to a character boundary if replacements grew it past
    /// `capacity`.
    pub fn into_string(self) -> String {
        let bytes = match std::str::from_utf8(&self.buf) {
            Ok(_) => &self.buf[..],
            Err(e) if e.error_len().is_none() => &self.buf[..e.valid_up_to()],
            Err(_) => &self.buf[..],
        };
        let mut out = String::from_utf8_lossy(bytes).into_owned();
        if out.len() > self.capacity {
            let mut end = self.capacity;
            while !out.is_char_boundary(end) {
                end -= 1;
            }
            out.truncate(end);
        }
        out
    }
}

type OnComplete = Box<dyn FnOnce(CaptureBuffer) + Send>;

/// Capture state plus the hook run once the response has been fully seen.
struct Observer {
    buffer: CaptureBuffer,
    on_complete: Option<OnComplete>,
}

impl Observer {
    fn complete(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(std::mem::take(&mut self.buffer));
        }
    }
}

impl Drop for Observer {
    // A body dropped before end of stream (client went away, or the server
    // stopped polling after `is_end_stream`) still reports what it captured.
    // The hook then runs inside drop, possibly while the task is unwinding;
    // a panic in it at that point aborts the process.
    fn drop(&mut self) {
        self.complete();
    }
}

enum Kind<B> {
    Passthrough(B),
    Observed { inner: B, observer: Observer },
    Fixed(Option<Bytes>),
}

/// Response body returned by the instrumentation layer.
///
/// Three shapes share one type so the layer has a single response type:
/// an untouched passthrough, an observed body feeding a [`CaptureBuffer`],
/// and a fixed in-memory body used for the block response.
pub struct CaptureBody<B> {
    kind: Kind<B>,
}

impl<B> CaptureBody<B> {
    /// Forward `inner` without recording anything.
    pub fn passthrough(inner: B) -> Self {
        Self {
            kind: Kind::Passthrough(inner),
        }
    }

    /// Forward `inner`, retaining up to `capacity` bytes.
    ///
    /// `on_complete` runs exactly once with the captured bytes, either when
    /// the inner body reports end of stream or when this body is dropped.
    pub fn observed<F>(inner: B, capacity: usize, on_complete: F) -> Self
    where
        F: FnOnce(CaptureBuffer) + Send + 'static,
    {
        Self {
            kind: Kind::Observed {
                inner,
                observer: Observer {
                    buffer: CaptureBuffer::new(capacity),
                    on_complete: Some(Box::new(on_complete)),
                },
            },
        }
    }

    /// A complete body made of `data`.
    pub fn fixed(data: impl Into<Bytes>) -> Self {
        Self {
            kind: Kind::Fixed(Some(data.into())),
        }
    }

    /// Bytes captured so far, if this body is being observed.
    pub fn captured(&self) -> Option<&[u8]> {
        match &self.kind {
            Kind::Observed { observer, .. } => Some(observer.buffer.as_bytes()),
            _ => None,
        }
    }
}

impl<B> Body for CaptureBody<B>
where
    B: Body<Data = Bytes> + Unpin,
    B::Error: Into<BoxError>,
{
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        match &mut this.kind {
            Kind::Passthrough(inner) => match Pin::new(inner).poll_frame(cx) {
                Poll::Ready(result) => Poll::Ready(result.map(|r| r.map_err(Into::into))),
                Poll::Pending => Poll::Pending,
            },
            Kind::Observed { inner, observer } => {
                let polled = Pin::new(&mut *inner).poll_frame(cx);
                match polled {
                    Poll::Ready(Some(Ok(frame))) => {
                        if let Some(data) = frame.data_ref() {
                            observer.buffer.record(data);
                        }
                        if inner.is_end_stream() {
                            observer.complete();
                        }
                        Poll::Ready(Some(Ok(frame)))
                    }
                    Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e.into()))),
                    Poll::Ready(None) => {
                        observer.complete();
                        Poll::Ready(None)
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
            Kind::Fixed(data) => Poll::Ready(data.take().map(|d| Ok(Frame::data(d)))),
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Passthrough(inner) => inner.is_end_stream(),
            Kind::Observed { inner, .. } => inner.is_end_stream(),
            Kind::Fixed(data) => data.is_none(),
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Passthrough(inner) => inner.size_hint(),
            Kind::Observed { inner, .. } => inner.size_hint(),
            Kind::Fixed(data) => SizeHint::with_exact(data.as_ref().map_or(0, |d| d.len() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::{BodyExt, Full, StreamBody};
    use proptest::prelude::*;
    use std::sync::{Arc, Mutex};

    fn chunked(chunks: Vec<Vec<u8>>) -> StreamBody<futures_util::stream::Iter<std::vec::IntoIter<Result<Frame<Bytes>, std::io::Error>>>> {
        let frames: Vec<Result<Frame<Bytes>, std::io::Error>> = chunks
            .into_iter()
            .map(|c| Ok(Frame::data(Bytes::from(c))))
            .collect();
        StreamBody::new(futures_util::stream::iter(frames))
    }

    fn sink() -> (Arc<Mutex<Option<CaptureBuffer>>>, impl FnOnce(CaptureBuffer) + Send + 'static) {
        let slot = Arc::new(Mutex::new(None));
        let writer = Arc::clone(&slot);
        (slot, move |buffer| {
            *writer.lock().unwrap() = Some(buffer);
        })
    }

    #[test]
    fn test_record_stops_at_capacity() {
        let mut buffer = CaptureBuffer::new(8);
        assert_eq!(buffer.record(b"hello"), 5);
        assert_eq!(buffer.record(b" world"), 3);
        assert!(buffer.is_full());
        assert_eq!(buffer.record(b"more"), 0);
        assert_eq!(buffer.as_bytes(), b"hello wo");
    }

    #[test]
    fn test_zero_capacity_captures_nothing() {
        let mut buffer = CaptureBuffer::new(0);
        assert_eq!(buffer.record(b"anything"), 0);
        assert_eq!(buffer.captured(), 0);
        assert_eq!(buffer.into_string(), "");
    }

    #[test]
    fn test_separate_buffers_capture_identically() {
        let payload = vec![7u8; MAX_BODY + 100];
        let mut a = CaptureBuffer::new(MAX_BODY);
        let mut b = CaptureBuffer::new(MAX_BODY);
        a.record(&payload);
        b.record(&payload);
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.captured(), MAX_BODY);
    }

    #[test]
    fn test_into_string_drops_split_character() {
        // "é" is two bytes; a budget of 2 keeps "a" and half of "é".
        let mut buffer = CaptureBuffer::new(2);
        buffer.record("aé".as_bytes());
        assert_eq!(buffer.into_string(), "a");
    }

    #[test]
    fn test_into_string_never_exceeds_capacity() {
        let mut buffer = CaptureBuffer::new(4);
        buffer.record(&[0xff, 0xfe, 0xfd, 0xfc]);
        let s = buffer.into_string();
        assert!(s.len() <= 4);
        assert!(s.starts_with('\u{fffd}'));
    }

    #[tokio::test]
    async fn test_observed_body_forwards_everything() {
        let data = Bytes::from(vec![b'x'; 3 * MAX_BODY]);
        let (slot, on_complete) = sink();
        let body = CaptureBody::observed(Full::new(data.clone()), MAX_BODY, on_complete);

        let collected = body.collect().await.unwrap().to_bytes();

        assert_eq!(collected, data);
        let captured = slot.lock().unwrap().take().unwrap();
        assert_eq!(captured.captured(), MAX_BODY);
    }

    #[tokio::test]
    async fn test_observed_body_accumulates_in_order() {
        let (slot, on_complete) = sink();
        let body = CaptureBody::observed(
            chunked(vec![b"ab".to_vec(), b"cd".to_vec(), b"ef".to_vec()]),
            5,
            on_complete,
        );

        let collected = body.collect().await.unwrap().to_bytes();

        assert_eq!(&collected[..], b"abcdef");
        let captured = slot.lock().unwrap().take().unwrap();
        assert_eq!(captured.as_bytes(), b"abcde");
    }

    #[tokio::test]
    async fn test_dropped_body_still_completes() {
        let (slot, on_complete) = sink();
        let body = CaptureBody::observed(chunked(vec![b"partial".to_vec()]), 64, on_complete);
        drop(body);

        let captured = slot.lock().unwrap().take().unwrap();
        assert_eq!(captured.captured(), 0);
    }

    #[tokio::test]
    async fn test_dropped_mid_stream_completes_once_with_prefix() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let writer = Arc::clone(&runs);
        let mut body = CaptureBody::observed(
            chunked(vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]),
            64,
            move |buffer: CaptureBuffer| writer.lock().unwrap().push(buffer),
        );

        let frame = body.frame().await.unwrap().unwrap();
        assert_eq!(frame.into_data().unwrap(), Bytes::from_static(b"first"));
        assert!(runs.lock().unwrap().is_empty());
        assert_eq!(body.captured(), Some(&b"first"[..]));

        drop(body);

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].as_bytes(), b"first");
    }

    #[tokio::test]
    async fn test_drop_after_end_of_stream_does_not_complete_again() {
        let runs = Arc::new(Mutex::new(Vec::new()));
        let writer = Arc::clone(&runs);
        let mut body = CaptureBody::observed(
            chunked(vec![b"ab".to_vec(), b"cd".to_vec()]),
            64,
            move |buffer: CaptureBuffer| writer.lock().unwrap().push(buffer),
        );

        while let Some(frame) = body.frame().await {
            frame.unwrap();
        }
        drop(body);

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].as_bytes(), b"abcd");
    }

    #[tokio::test]
    async fn test_passthrough_records_nothing() {
        let body = CaptureBody::passthrough(Full::new(Bytes::from("plain")));
        assert!(body.captured().is_none());
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"plain");
    }

    #[tokio::test]
    async fn test_fixed_body() {
        let body: CaptureBody<Full<Bytes>> = CaptureBody::fixed("Forbidden");
        assert_eq!(body.size_hint().exact(), Some(9));
        let collected = body.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"Forbidden");
    }

    proptest! {
        #[test]
        fn captured_is_bounded_prefix(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..512), 0..32),
            capacity in 0usize..4096,
        ) {
            let mut buffer = CaptureBuffer::new(capacity);
            for chunk in &chunks {
                buffer.record(chunk);
            }
            let all: Vec<u8> = chunks.concat();
            let expected = all.len().min(capacity);
            prop_assert_eq!(buffer.captured(), expected);
            prop_assert_eq!(buffer.as_bytes(), &all[..expected]);
            prop_assert!(buffer.into_string().len() <= capacity);
        }
    }
}
