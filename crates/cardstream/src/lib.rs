//! Incremental aggregation of streamed structured model output.
//!
//! A backend streams a JSON array of cards as plain text, interleaved with
//! inline `[EVENT]...[/EVENT]` telemetry. This crate separates the two,
//! re-parses the growing buffer into cards as it arrives, accumulates token
//! usage, and keeps one conversation surface consistent across turns that
//! can be aborted or superseded at any time.
//!
//! The synchronous core is [`SessionController`]; [`Client`] and
//! [`Conversation`] drive it from an async [`Transport`].
//!
//! # Builder-first usage
//!
//! ```no_run
//! use cardstream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), CardStreamError> {
//! let client = Client::from_env()?;
//! let mut conversation = client.conversation(ConversationConfig::named("demo"));
//!
//! let mut stream = conversation
//!     .first_turn("retail banking", "cards-ideas")
//!     .start_stream()
//!     .await?;
//! while let Some(event) = stream.next_event().await {
//!     if let StreamEvent::EntitiesUpdated { entities, .. } = event {
//!         println!("{} cards so far", entities.len());
//!     }
//! }
//! let outcome = stream.finish().await?;
//! println!("{} tokens", outcome.usage.total());
//! # Ok(())
//! # }
//! ```

/// Entry point and builder.
pub mod client;
/// Synchronous per-surface turn state machine.
pub mod controller;
/// Splits inline events out of the content stream.
pub mod demux;
/// Structured output items.
pub mod entity;
/// Public error types.
pub mod errors;
/// HTTP transport over reqwest.
pub mod http;
/// How a turn's entities combine with the existing ones.
pub mod merge;
/// Process-wide logging setup.
pub mod observability;
/// Per-turn options.
pub mod options;
/// Parser for truncated JSON arrays of objects.
pub mod parser;
/// Pinned snippets.
pub mod pinboard;
/// Common imports for typical usage.
pub mod prelude;
/// Request bodies for the prompt endpoint.
pub mod request;
/// Conversation handle and session id.
pub mod session;
/// Events emitted while a turn is processed.
pub mod stream;
/// Transport contract.
pub mod transport;
/// Turn builder, streaming handle, and cancellation handle.
pub mod turn;
/// Token usage accounting.
pub mod usage;

pub use client::{Client, ClientBuilder};
pub use controller::{SessionController, TurnSpec, TurnTicket, UPSTREAM_ERROR_MARKER};
pub use demux::{Demuxed, EventFraming, InlineEvent, JsonChunk, demultiplex};
pub use entity::Entity;
pub use errors::{CardStreamError, REPHRASE_MESSAGE, Severity, StreamFailure, TransportError};
pub use http::{HttpTransport, HttpTransportConfig, StreamEncoding};
pub use merge::{MergeMode, merge};
pub use observability::init_observability;
pub use options::{ResponseFormat, TurnOptions};
pub use parser::{ParseError, ParseOutcome, TolerantParser, parse_entities};
pub use pinboard::{FilePinboard, MemoryPinboard, PinKey, Pinboard, PinboardError};
pub use request::{ContextSelection, ConversationRequest};
pub use session::{Conversation, ConversationConfig, SessionId};
pub use stream::{Notice, StreamEvent, TurnOutcome, TurnState};
pub use transport::{ChunkStream, RawChunk, ResponseMeta, Transport, TransportRequest, TransportStream};
pub use turn::{AbortHandle, AbortSignal, TurnBuilder, TurnStream};
pub use usage::{TokenUsage, UsageDelta};
