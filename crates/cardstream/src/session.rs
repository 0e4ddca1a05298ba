use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::client::ClientInner;
use crate::controller::SessionController;
use crate::entity::Entity;
use crate::merge::MergeMode;
use crate::options::ResponseFormat;
use crate::request::ConversationRequest;
use crate::stream::{StreamEvent, TurnState};
use crate::turn::TurnBuilder;
use crate::usage::TokenUsage;

/// Conversation correlation id assigned by the backend.
///
/// Opaque: it is stored and echoed back, never interpreted.
#[derive(Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Configuration used to create a `Conversation`.
#[derive(Clone, Debug)]
pub struct ConversationConfig {
    /// Human-readable name, used in logs.
    pub name: String,
}

impl ConversationConfig {
    /// Creates a named conversation config.
    pub fn named(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// One conversation surface: the displayed cards, token totals, citations
/// and the backend conversation id, plus at most one streaming turn.
///
/// Turns borrow the conversation mutably, so a second turn can only start
/// once the previous [`TurnStream`](crate::TurnStream) is finished or
/// dropped (dropping aborts it).
pub struct Conversation {
    pub(crate) client: Arc<ClientInner>,
    pub(crate) config: ConversationConfig,
    pub(crate) controller: SessionController,
}

impl Conversation {
    pub(crate) fn new(client: Arc<ClientInner>, config: ConversationConfig) -> Self {
        let controller = SessionController::new().with_framing(client.framing.clone());
        Self {
            client,
            config,
            controller,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    pub fn entities(&self) -> &[Entity] {
        self.controller.entities()
    }

    pub fn usage(&self) -> TokenUsage {
        self.controller.usage()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.controller.session_id()
    }

    pub fn citations(&self) -> &[Value] {
        self.controller.citations()
    }

    pub fn state(&self) -> TurnState {
        self.controller.state()
    }

    /// Forgets cards, totals, citations and the conversation id.
    pub fn reset(&mut self) -> Vec<StreamEvent> {
        tracing::info!(conversation = %self.config.name, "conversation reset");
        self.controller.reset()
    }

    /// Starts building a turn for an arbitrary request.
    pub fn turn(&mut self, request: ConversationRequest) -> TurnBuilder<'_> {
        TurnBuilder::new(self, request)
    }

    /// First card turn: replaces the cards and starts a new backend
    /// conversation.
    pub fn first_turn(
        &mut self,
        userinput: impl Into<String>,
        prompt_id: impl Into<String>,
    ) -> TurnBuilder<'_> {
        self.turn(ConversationRequest::first_turn(userinput, prompt_id))
            .mode(MergeMode::Replace)
            .new_conversation(true)
    }

    /// Asks for more cards in the same format and appends them.
    pub fn generate_more(&mut self) -> TurnBuilder<'_> {
        self.turn(ConversationRequest::generate_more())
            .mode(MergeMode::Append)
    }

    /// Follow-up prompt over the current cards, answered as text on the
    /// follow-up endpoint. Cards flagged `exclude: true` are not sent.
    pub fn follow_up(
        &mut self,
        first_input: &str,
        query: &str,
        follow_up_id: impl Into<String>,
        previous_prompt_id: impl Into<String>,
    ) -> TurnBuilder<'_> {
        let request = ConversationRequest::follow_up(
            first_input,
            query,
            follow_up_id,
            previous_prompt_id,
            self.entities(),
        );
        let path = self.client.follow_up_path.clone();
        self.turn(request)
            .format(ResponseFormat::Text)
            .path(path)
    }

    /// Text continuation of the current conversation.
    pub fn chat(&mut self, userinput: impl Into<String>) -> TurnBuilder<'_> {
        self.turn(ConversationRequest::chat(userinput))
            .format(ResponseFormat::Text)
    }
}
