use std::pin::Pin;

use bytes::Bytes;
use futures::stream;

use crate::errors::TransportError;
use crate::parser::Framing;
use crate::request::GenerationRequest;

/// Incremental response body: raw byte chunks in delivery order.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<Bytes, TransportError>> + Send + 'static>>;

/// An opened generation stream.
pub struct TransportHandle {
    pub body: ByteStream,
    /// How frames are delimited inside `body`.
    pub framing: Framing,
}

impl TransportHandle {
    pub fn new(body: ByteStream, framing: Framing) -> Self {
        Self { body, framing }
    }
}

/// Opens incremental generation streams.
///
/// Implementations own credentials and headers; the session only sees bytes.
/// Dropping the returned handle must abort the underlying connection.
#[async_trait::async_trait]
pub trait TransportFactory: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Opens a stream for `request`. Errors here fail the session immediately.
    async fn open(&self, request: &GenerationRequest) -> Result<TransportHandle, TransportError>;
}

/// Serves a prerecorded body, one chunk per poll.
///
/// Used to replay captured backend output without a network.
#[derive(Clone, Debug)]
pub struct ReplayTransport {
    chunks: Vec<Bytes>,
    framing: Framing,
}

impl ReplayTransport {
    pub fn new(chunks: Vec<Bytes>, framing: Framing) -> Self {
        Self { chunks, framing }
    }

    /// Splits `body` into one chunk per line so frames arrive incrementally.
    pub fn from_body(body: impl Into<Bytes>, framing: Framing) -> Self {
        let body: Bytes = body.into();
        let mut chunks = Vec::new();
        let mut start = 0;
        for (idx, byte) in body.iter().enumerate() {
            if *byte == b'\n' {
                chunks.push(body.slice(start..=idx));
                start = idx + 1;
            }
        }
        if start < body.len() {
            chunks.push(body.slice(start..));
        }
        Self { chunks, framing }
    }
}

#[async_trait::async_trait]
impl TransportFactory for ReplayTransport {
    fn name(&self) -> &str {
        "replay"
    }

    async fn open(&self, _request: &GenerationRequest) -> Result<TransportHandle, TransportError> {
        let chunks = self.chunks.clone().into_iter().map(Ok);
        Ok(TransportHandle::new(
            Box::pin(stream::iter(chunks)),
            self.framing,
        ))
    }
}
