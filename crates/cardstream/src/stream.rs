use crate::entity::Entity;
use crate::errors::{Severity, StreamFailure};
use crate::merge::MergeMode;
use crate::options::ResponseFormat;
use crate::session::SessionId;
use crate::usage::TokenUsage;

/// Lifecycle state of the most recent turn on a conversation surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnState {
    #[default]
    Idle,
    Streaming,
    Completed,
    Aborted,
    Failed,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::Failed)
    }
}

/// Non-fatal message attached to a completed turn.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
}

/// Result of a completed turn.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TurnOutcome {
    pub turn_id: uuid::Uuid,
    pub generation: u64,
    /// Entity list after the turn (the full displayed list).
    pub entities: Vec<Entity>,
    /// Entities this turn contributed.
    pub added: usize,
    /// Accumulated content text of the turn.
    pub text: String,
    /// Conversation-wide token totals after the turn.
    pub usage: TokenUsage,
    pub session_id: Option<SessionId>,
    pub notice: Option<Notice>,
}

/// Events produced while a turn is processed.
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// First event of every turn.
    TurnStarted {
        turn_id: uuid::Uuid,
        generation: u64,
        mode: MergeMode,
        format: ResponseFormat,
    },
    /// The backend assigned (or changed) the conversation id.
    SessionAssigned {
        generation: u64,
        session_id: SessionId,
    },
    /// New content text, events already removed.
    ContentDelta {
        generation: u64,
        seq: u64,
        text: String,
    },
    /// The displayed entity list changed.
    EntitiesUpdated {
        generation: u64,
        entities: Vec<Entity>,
    },
    /// Token totals changed.
    UsageUpdated { generation: u64, totals: TokenUsage },
    /// Citation metadata arrived.
    CitationsUpdated {
        generation: u64,
        citations: Vec<serde_json::Value>,
    },
    /// Terminal success.
    Completed { generation: u64, outcome: TurnOutcome },
    /// Terminal cancellation.
    Aborted { generation: u64 },
    /// Terminal failure.
    Failed {
        generation: u64,
        failure: StreamFailure,
    },
}

impl StreamEvent {
    pub fn generation(&self) -> u64 {
        match self {
            Self::TurnStarted { generation, .. }
            | Self::SessionAssigned { generation, .. }
            | Self::ContentDelta { generation, .. }
            | Self::EntitiesUpdated { generation, .. }
            | Self::UsageUpdated { generation, .. }
            | Self::CitationsUpdated { generation, .. }
            | Self::Completed { generation, .. }
            | Self::Aborted { generation }
            | Self::Failed { generation, .. } => *generation,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Aborted { .. } | Self::Failed { .. }
        )
    }
}
