//! HTTP transport for the prompt endpoint.
//!
//! Posts the JSON request body and streams the response either as raw UTF-8
//! text or as server-sent events.
mod config;
mod decode;

pub use config::{DEFAULT_SESSION_HEADER, HttpTransportConfig, StreamEncoding};

use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;
use tracing::debug;

use crate::errors::{CardStreamError, TransportError};
use crate::session::SessionId;
use crate::transport::{RawChunk, ResponseMeta, Transport, TransportRequest, TransportStream};
use crate::turn::AbortSignal;

use decode::{SseDecoder, Utf8Decoder, frame_to_chunk};

type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static>>;

/// Streaming transport over reqwest.
pub struct HttpTransport {
    client: reqwest::Client,
    config: HttpTransportConfig,
}

impl HttpTransport {
    /// Creates a transport from explicit configuration.
    pub fn new(config: HttpTransportConfig) -> Result<Self, CardStreamError> {
        if config.base_url.trim().is_empty() {
            return Err(CardStreamError::Config(
                "http transport base_url must not be empty".into(),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| CardStreamError::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a transport from `CARDSTREAM_*` environment variables.
    pub fn from_env() -> Result<Self, CardStreamError> {
        Self::new(HttpTransportConfig::from_env()?)
    }

    pub fn config(&self) -> &HttpTransportConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn open(&self, request: TransportRequest) -> Result<TransportStream, TransportError> {
        let url = self.config.url(&request.path);
        debug!(turn_id = %request.turn_id, %url, encoding = ?self.config.encoding, "opening prompt stream");

        let accept = match self.config.encoding {
            StreamEncoding::Text => "text/plain, application/json",
            StreamEncoding::Sse => "text/event-stream",
        };
        let mut http_req = self
            .client
            .request(request.method.clone(), url.as_str())
            .header(reqwest::header::ACCEPT, accept)
            .json(&request.body);
        if let Some(timeout) = request.timeout {
            http_req = http_req.timeout(timeout);
        }

        let response = http_req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::io(format!("prompt request timed out: {e}"))
            } else {
                TransportError::io(format!("prompt request failed: {e}"))
            }
        })?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(TransportError::http(
                status.as_u16(),
                format!("prompt request failed with status {status}: {body}"),
            ));
        }

        let session_id = response
            .headers()
            .get(self.config.session_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(SessionId::new);
        let meta = ResponseMeta {
            status: Some(status.as_u16()),
            session_id,
        };

        let bytes_stream: ByteStream = Box::pin(response.bytes_stream());
        let chunks = chunk_stream(self.config.encoding, bytes_stream, request.abort);
        Ok(TransportStream {
            meta,
            chunks: Box::pin(chunks),
        })
    }
}

enum Decoder {
    Text(Utf8Decoder),
    Sse(SseDecoder),
}

impl Decoder {
    fn push(&mut self, bytes: &[u8], out: &mut VecDeque<RawChunk>) {
        match self {
            Self::Text(decoder) => {
                let text = decoder.push_chunk(bytes);
                if !text.is_empty() {
                    out.push_back(RawChunk::Text(text));
                }
            }
            Self::Sse(decoder) => {
                out.extend(decoder.push_chunk(bytes).into_iter().filter_map(frame_to_chunk));
            }
        }
    }

    fn finish(&mut self, out: &mut VecDeque<RawChunk>) {
        match self {
            Self::Text(decoder) => {
                let text = decoder.finish();
                if !text.is_empty() {
                    out.push_back(RawChunk::Text(text));
                }
            }
            Self::Sse(decoder) => out.extend(decoder.finish().and_then(frame_to_chunk)),
        }
    }
}

fn chunk_stream(
    encoding: StreamEncoding,
    bytes_stream: ByteStream,
    abort: AbortSignal,
) -> impl futures::Stream<Item = Result<RawChunk, TransportError>> + Send {
    struct State {
        bytes_stream: ByteStream,
        decoder: Decoder,
        abort: AbortSignal,
        pending: VecDeque<RawChunk>,
        done: bool,
    }

    let decoder = match encoding {
        StreamEncoding::Text => Decoder::Text(Utf8Decoder::default()),
        StreamEncoding::Sse => Decoder::Sse(SseDecoder::default()),
    };
    stream::try_unfold(
        State {
            bytes_stream,
            decoder,
            abort,
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if state.abort.is_aborted() {
                    debug!("prompt stream closed by abort");
                    return Ok(None);
                }
                if let Some(chunk) = state.pending.pop_front() {
                    return Ok(Some((chunk, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.bytes_stream.next().await {
                    Some(Ok(bytes)) => state.decoder.push(&bytes, &mut state.pending),
                    Some(Err(e)) => {
                        return Err(TransportError::io(format!("prompt stream read failed: {e}")));
                    }
                    None => {
                        state.decoder.finish(&mut state.pending);
                        state.done = true;
                    }
                }
            }
        },
    )
}
