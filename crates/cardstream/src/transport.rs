use std::pin::Pin;
use std::time::Duration;

use crate::errors::TransportError;
use crate::session::SessionId;
use crate::turn::AbortSignal;

/// One delivery unit from the transport.
#[derive(Clone, Debug, PartialEq)]
pub enum RawChunk {
    /// Text as produced by the backend; may contain inline event markers.
    Text(String),
    /// A chunk the transport already decoded as JSON.
    Json(serde_json::Value),
}

impl From<&str> for RawChunk {
    fn from(value: &str) -> Self {
        RawChunk::Text(value.to_string())
    }
}

impl From<String> for RawChunk {
    fn from(value: String) -> Self {
        RawChunk::Text(value)
    }
}

/// Response metadata available once the backend has answered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseMeta {
    /// HTTP status code when the transport is HTTP based.
    pub status: Option<u16>,
    /// Conversation correlation id read from the response headers.
    pub session_id: Option<SessionId>,
}

/// Stream of raw chunks for one request.
pub type ChunkStream =
    Pin<Box<dyn futures::Stream<Item = Result<RawChunk, TransportError>> + Send + 'static>>;

/// Opened response: metadata plus the chunk stream.
///
/// End of stream is signalled by the stream returning `None`; a stream error
/// is a distinct terminal item.
pub struct TransportStream {
    pub meta: ResponseMeta,
    pub chunks: ChunkStream,
}

/// Request handed to a transport.
#[derive(Clone, Debug)]
pub struct TransportRequest {
    /// Correlates logs across the controller and the transport.
    pub turn_id: uuid::Uuid,
    pub method: reqwest::Method,
    /// Path relative to the transport's base URL.
    pub path: String,
    pub body: serde_json::Value,
    /// Checked by the transport between chunk deliveries.
    pub abort: AbortSignal,
    pub timeout: Option<Duration>,
}

/// Opens streaming requests against the backend.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Sends the request and returns once response metadata is available.
    async fn open(&self, request: TransportRequest) -> Result<TransportStream, TransportError>;
}
