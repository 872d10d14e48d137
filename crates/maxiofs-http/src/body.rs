//! Response body type shared by all listeners.
//!
//! Small responses (XML documents, JSON, errors) are buffered; object
//! payloads stream straight from the engine's reader in 32 KiB frames so a
//! large GET never materializes in memory.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use http_body::{Body, Frame, SizeHint};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

/// Frame size for streamed payloads.
const STREAM_CHUNK: usize = 32 * 1024;

pin_project! {
    /// A response body: buffered bytes or a streamed reader.
    #[project = ResponseBodyProj]
    pub enum ResponseBody {
        /// A fully buffered body (possibly empty).
        Full { data: Option<Bytes> },
        /// A streamed payload with a known remaining length.
        Stream {
            #[pin]
            reader: Box<dyn AsyncRead + Send + Unpin>,
            remaining: u64,
        },
    }
}

impl ResponseBody {
    /// An empty body.
    #[must_use]
    pub fn empty() -> Self {
        Self::Full { data: None }
    }

    /// A buffered body.
    #[must_use]
    pub fn full(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        if data.is_empty() {
            Self::empty()
        } else {
            Self::Full { data: Some(data) }
        }
    }

    /// A streamed body of exactly `length` bytes from `reader`.
    #[must_use]
    pub fn stream(reader: Box<dyn AsyncRead + Send + Unpin>, length: u64) -> Self {
        Self::Stream {
            reader,
            remaining: length,
        }
    }
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full { data } => f
                .debug_struct("Full")
                .field("len", &data.as_ref().map_or(0, Bytes::len))
                .finish(),
            Self::Stream { remaining, .. } => f
                .debug_struct("Stream")
                .field("remaining", remaining)
                .finish(),
        }
    }
}

impl Body for ResponseBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.project() {
            ResponseBodyProj::Full { data } => Poll::Ready(data.take().map(|b| Ok(Frame::data(b)))),
            ResponseBodyProj::Stream { reader, remaining } => {
                if *remaining == 0 {
                    return Poll::Ready(None);
                }
                let want = usize::try_from((*remaining).min(STREAM_CHUNK as u64))
                    .unwrap_or(STREAM_CHUNK);
                let mut buf = BytesMut::zeroed(want);
                let mut read_buf = ReadBuf::new(&mut buf);

                match Pin::new(reader.get_mut()).poll_read(cx, &mut read_buf) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready(Err(e)) => Poll::Ready(Some(Err(e))),
                    Poll::Ready(Ok(())) => {
                        let filled = read_buf.filled().len();
                        if filled == 0 {
                            // Early EOF: surface as an error rather than
                            // silently truncating the response.
                            *remaining = 0;
                            return Poll::Ready(Some(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "payload ended early",
                            ))));
                        }
                        *remaining -= filled as u64;
                        buf.truncate(filled);
                        Poll::Ready(Some(Ok(Frame::data(buf.freeze()))))
                    }
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            Self::Full { data } => data.is_none(),
            Self::Stream { remaining, .. } => *remaining == 0,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            Self::Full { data } => SizeHint::with_exact(data.as_ref().map_or(0, Bytes::len) as u64),
            Self::Stream { remaining, .. } => SizeHint::with_exact(*remaining),
        }
    }
}
