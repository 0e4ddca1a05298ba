//! Common imports for typical usage.
pub use crate::{
    AbortHandle, CardStreamError, Client, ClientBuilder, ContextSelection, Conversation,
    ConversationConfig, ConversationRequest, Entity, MergeMode, ResponseFormat, SessionId,
    Severity, StreamEvent, StreamFailure, TokenUsage, TurnOutcome, TurnStream,
};
