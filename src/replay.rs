//! Handing a buffered request body back to the inner service.
//!
//! The layer reads the request body before the handler runs. Whatever the read
//! produced must reach the handler exactly as the client sent it: the same
//! bytes, and if the read failed part way, the same failure after those bytes.

use crate::capture::BoxError;
use bytes::{BufMut, Bytes, BytesMut};
use http_body::{Body, Frame, SizeHint};
use http_body_util::BodyExt;
use http_body_util::combinators::{BoxBody, UnsyncBoxBody};
use std::pin::Pin;
use std::task::{Context, Poll};

/// Request body types the layer can rebuild after reading them.
pub trait ReplayBody: Body + Sized {
    /// Rebuild a body yielding `read`, followed by `error` if the original
    /// body failed after producing those bytes.
    fn replay(read: Bytes, error: Option<BoxError>) -> Self;
}

impl ReplayBody for axum::body::Body {
    fn replay(read: Bytes, error: Option<BoxError>) -> Self {
        match error {
            None => axum::body::Body::from(read),
            Some(error) => axum::body::Body::new(PartialBody::new(read, Some(error))),
        }
    }
}

impl ReplayBody for UnsyncBoxBody<Bytes, BoxError> {
    fn replay(read: Bytes, error: Option<BoxError>) -> Self {
        PartialBody::new(read, error).boxed_unsync()
    }
}

impl ReplayBody for BoxBody<Bytes, BoxError> {
    fn replay(read: Bytes, error: Option<BoxError>) -> Self {
        PartialBody::new(read, error).boxed()
    }
}

/// Bytes already read from a body, then the error that ended the read.
pub struct PartialBody {
    data: Option<Bytes>,
    error: Option<BoxError>,
}

impl PartialBody {
    pub fn new(data: Bytes, error: Option<BoxError>) -> Self {
        Self {
            data: (!data.is_empty()).then_some(data),
            error,
        }
    }
}

impl Body for PartialBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        if let Some(data) = self.data.take() {
            return Poll::Ready(Some(Ok(Frame::data(data))));
        }
        Poll::Ready(self.error.take().map(Err))
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none() && self.error.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        let len = self.data.as_ref().map_or(0, |d| d.len() as u64);
        if self.error.is_some() {
            // The stream ends in an error, so only a lower bound is known.
            let mut hint = SizeHint::new();
            hint.set_lower(len);
            hint
        } else {
            SizeHint::with_exact(len)
        }
    }
}

/// The outcome of reading a whole request body.
pub(crate) struct ReadBody {
    pub bytes: Bytes,
    pub error: Option<BoxError>,
}

/// Read `body` to the end, keeping the bytes that arrived before any error.
pub(crate) async fn read_body<B>(body: B) -> ReadBody
where
    B: Body,
    B::Error: Into<BoxError>,
{
    let mut body = std::pin::pin!(body);
    let mut buf = BytesMut::new();

    while let Some(frame) = body.frame().await {
        match frame {
            Ok(frame) => {
                // Trailers are not part of the trace or the replay.
                if let Ok(data) = frame.into_data() {
                    buf.put(data);
                }
            }
            Err(e) => {
                return ReadBody {
                    bytes: buf.freeze(),
                    error: Some(e.into()),
                };
            }
        }
    }

    ReadBody {
        bytes: buf.freeze(),
        error: None,
    }
}
