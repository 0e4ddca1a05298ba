//! Per-surface turn state machine.
//!
//! [`SessionController`] is synchronous and event driven: the caller feeds it
//! transport notifications (metadata, chunks, end, error, abort) tagged with
//! the generation returned by [`SessionController::begin`], and it answers
//! with the [`StreamEvent`]s to render. Notifications carrying any other
//! generation are dropped, which closes the race between an abort and chunks
//! that were already in flight.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::demux::{EventFraming, InlineEvent, JsonChunk, classify_json_chunk};
use crate::entity::Entity;
use crate::errors::{REPHRASE_MESSAGE, Severity, StreamFailure, TransportError};
use crate::merge::{MergeMode, merge};
use crate::options::ResponseFormat;
use crate::parser::{ParseOutcome, TolerantParser};
use crate::session::SessionId;
use crate::stream::{Notice, StreamEvent, TurnOutcome, TurnState};
use crate::transport::{RawChunk, ResponseMeta};
use crate::usage::TokenUsage;

/// Signature the backend uses when it forwards a model error as content.
pub const UPSTREAM_ERROR_MARKER: &str = "Error code:";

const PREVIEW_CHARS: usize = 200;

/// Returns whether `text` carries a backend error signature.
pub fn has_upstream_error(text: &str) -> bool {
    text.contains(UPSTREAM_ERROR_MARKER)
}

/// What kind of turn to start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TurnSpec {
    pub mode: MergeMode,
    pub format: ResponseFormat,
    /// Drop the current session id so the backend opens a new conversation.
    pub new_conversation: bool,
}

impl TurnSpec {
    pub fn cards(mode: MergeMode) -> Self {
        Self {
            mode,
            format: ResponseFormat::Cards,
            new_conversation: false,
        }
    }

    pub fn text() -> Self {
        Self {
            mode: MergeMode::Replace,
            format: ResponseFormat::Text,
            new_conversation: false,
        }
    }

    pub fn new_conversation(mut self) -> Self {
        self.new_conversation = true;
        self
    }
}

/// Identifies a started turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TurnTicket {
    pub turn_id: uuid::Uuid,
    pub generation: u64,
}

/// State restored when a turn does not complete.
#[derive(Debug)]
struct Rollback {
    entities: Vec<Entity>,
    citations: Vec<Value>,
    session_id: Option<SessionId>,
}

#[derive(Debug)]
struct ActiveTurn {
    turn_id: uuid::Uuid,
    generation: u64,
    mode: MergeMode,
    format: ResponseFormat,
    /// Entities preserved in front of this turn's output.
    head: Vec<Entity>,
    rollback: Rollback,
    /// Content-only text received so far. Only grows.
    buffer: String,
    /// Tail of the last text chunk that may still become an inline event.
    carry: String,
    seq: u64,
}

/// Owns the displayed state of one conversation surface.
#[derive(Debug, Default)]
pub struct SessionController {
    framing: EventFraming,
    parser: TolerantParser,
    session_id: Option<SessionId>,
    entities: Vec<Entity>,
    usage: TokenUsage,
    citations: Vec<Value>,
    generation: u64,
    state: TurnState,
    active: Option<ActiveTurn>,
}

impl SessionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses a custom inline event framing.
    pub fn with_framing(mut self, framing: EventFraming) -> Self {
        self.framing = framing;
        self
    }

    /// Uses a custom parser configuration.
    pub fn with_parser(mut self, parser: TolerantParser) -> Self {
        self.parser = parser;
        self
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn usage(&self) -> TokenUsage {
        self.usage
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    pub fn citations(&self) -> &[Value] {
        &self.citations
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Generation of the streaming turn, if any.
    pub fn active_generation(&self) -> Option<u64> {
        self.active.as_ref().map(|turn| turn.generation)
    }

    /// Content accumulated by the streaming turn.
    pub fn buffer(&self) -> Option<&str> {
        self.active.as_ref().map(|turn| turn.buffer.as_str())
    }

    /// Clears everything: entities, usage totals, citations and session.
    ///
    /// Aborts a streaming turn first.
    pub fn reset(&mut self) -> Vec<StreamEvent> {
        let events = self.abort_active();
        self.entities.clear();
        self.citations.clear();
        self.session_id = None;
        self.usage = TokenUsage::default();
        self.state = TurnState::Idle;
        events
    }

    /// Starts a new turn, aborting the streaming one if there is one.
    pub fn begin(&mut self, spec: TurnSpec) -> (TurnTicket, Vec<StreamEvent>) {
        let mut events = self.abort_active();
        self.generation += 1;
        let turn_id = uuid::Uuid::new_v4();
        let generation = self.generation;

        let rollback = Rollback {
            entities: self.entities.clone(),
            citations: self.citations.clone(),
            session_id: self.session_id.clone(),
        };
        if spec.new_conversation {
            self.session_id = None;
            self.citations.clear();
        }
        let head = match spec.mode {
            MergeMode::Append => self.entities.clone(),
            MergeMode::Replace => Vec::new(),
        };

        info!(%turn_id, generation, mode = ?spec.mode, format = ?spec.format, new_conversation = spec.new_conversation, "turn started");
        self.active = Some(ActiveTurn {
            turn_id,
            generation,
            mode: spec.mode,
            format: spec.format,
            head,
            rollback,
            buffer: String::new(),
            carry: String::new(),
            seq: 0,
        });
        self.state = TurnState::Streaming;
        events.push(StreamEvent::TurnStarted {
            turn_id,
            generation,
            mode: spec.mode,
            format: spec.format,
        });
        (
            TurnTicket {
                turn_id,
                generation,
            },
            events,
        )
    }

    /// Records response metadata (the session id) for a turn.
    pub fn apply_meta(&mut self, generation: u64, meta: &ResponseMeta) -> Vec<StreamEvent> {
        if !self.is_current(generation) {
            debug!(generation, "ignoring metadata for inactive turn");
            return Vec::new();
        }
        let Some(session_id) = meta.session_id.clone() else {
            return Vec::new();
        };
        if self.session_id.as_ref() == Some(&session_id) {
            return Vec::new();
        }
        if let Some(previous) = &self.session_id {
            warn!(%previous, %session_id, "backend switched conversation id");
        } else {
            debug!(%session_id, "conversation id assigned");
        }
        self.session_id = Some(session_id.clone());
        vec![StreamEvent::SessionAssigned {
            generation,
            session_id,
        }]
    }

    /// Processes one chunk of the turn identified by `generation`.
    pub fn apply_chunk(&mut self, generation: u64, chunk: RawChunk) -> Vec<StreamEvent> {
        let Some(turn) = self.active.as_mut().filter(|t| t.generation == generation) else {
            debug!(generation, "ignoring chunk for inactive turn");
            return Vec::new();
        };

        let mut events = Vec::new();
        let mut inline = Vec::new();
        let text = match chunk {
            RawChunk::Text(text) => Some(text),
            RawChunk::Json(value) => match classify_json_chunk(&value) {
                JsonChunk::Content(text) => Some(text),
                JsonChunk::Event(event) => {
                    inline.push(event);
                    None
                }
                JsonChunk::Citations(citations) => {
                    self.citations = citations.clone();
                    events.push(StreamEvent::CitationsUpdated {
                        generation,
                        citations,
                    });
                    None
                }
                JsonChunk::Ignored => {
                    debug!(generation, "ignoring unrecognized json chunk");
                    None
                }
            },
        };

        let mut content = String::new();
        if let Some(text) = text {
            let mut input = std::mem::take(&mut turn.carry);
            input.push_str(&text);
            let demuxed = self.framing.demultiplex(&input);
            turn.carry = demuxed.remainder;
            content = demuxed.content;
            inline.extend(demuxed.events);
        }

        let before = self.usage;
        for event in inline {
            match event {
                InlineEvent::TokenUsage(delta) => self.usage = self.usage.aggregate(delta),
                InlineEvent::Other { kind, .. } => debug!(generation, %kind, "ignoring inline event"),
            }
        }
        if self.usage != before {
            events.push(StreamEvent::UsageUpdated {
                generation,
                totals: self.usage,
            });
        }

        if !content.is_empty() {
            turn.buffer.push_str(&content);
            events.push(StreamEvent::ContentDelta {
                generation,
                seq: turn.seq,
                text: content,
            });
            turn.seq = turn.seq.saturating_add(1);
            if turn.format == ResponseFormat::Cards
                && let Some(event) = reparse(&self.parser, turn, &mut self.entities)
            {
                events.push(event);
            }
        }
        events
    }

    /// Handles end of stream and classifies the outcome.
    pub fn finish(&mut self, generation: u64) -> Vec<StreamEvent> {
        let Some(mut turn) = self.take_turn(generation) else {
            debug!(generation, "ignoring end of stream for inactive turn");
            return Vec::new();
        };
        let mut events = Vec::new();

        if !turn.carry.is_empty() {
            let carry = std::mem::take(&mut turn.carry);
            turn.buffer.push_str(&carry);
            events.push(StreamEvent::ContentDelta {
                generation,
                seq: turn.seq,
                text: carry,
            });
        }

        if turn.buffer.trim().is_empty() {
            events.extend(self.fail_turn(turn, StreamFailure::EmptyOutput));
            return events;
        }

        let (added, notice) = match turn.format {
            ResponseFormat::Text => (0, None),
            ResponseFormat::Cards => match self.parser.parse(&turn.buffer) {
                ParseOutcome::Entities { entities, complete } if !entities.is_empty() => {
                    if !complete {
                        warn!(generation, "stream ended inside the card list");
                    }
                    let added = entities.len();
                    let merged = merge(&turn.head, entities, turn.mode);
                    if merged != self.entities {
                        self.entities = merged;
                        events.push(StreamEvent::EntitiesUpdated {
                            generation,
                            entities: self.entities.clone(),
                        });
                    }
                    (added, None)
                }
                ParseOutcome::Entities { .. } => {
                    let severity = if has_upstream_error(&turn.buffer) {
                        Severity::Error
                    } else {
                        Severity::Warning
                    };
                    let message = match severity {
                        Severity::Error => turn.buffer.trim().to_string(),
                        Severity::Warning => REPHRASE_MESSAGE.to_string(),
                    };
                    (0, Some(Notice { severity, message }))
                }
                ParseOutcome::NotYetParseable | ParseOutcome::Invalid(_) => {
                    let failure = if has_upstream_error(&turn.buffer) {
                        StreamFailure::Upstream {
                            message: turn.buffer.trim().to_string(),
                        }
                    } else {
                        StreamFailure::Unparseable {
                            preview: preview(&turn.buffer),
                        }
                    };
                    events.extend(self.fail_turn(turn, failure));
                    return events;
                }
            },
        };

        info!(turn_id = %turn.turn_id, generation, added, bytes = turn.buffer.len(), "turn completed");
        self.state = TurnState::Completed;
        let outcome = TurnOutcome {
            turn_id: turn.turn_id,
            generation,
            entities: self.entities.clone(),
            added,
            text: turn.buffer,
            usage: self.usage,
            session_id: self.session_id.clone(),
            notice,
        };
        events.push(StreamEvent::Completed {
            generation,
            outcome,
        });
        events
    }

    /// Handles a transport error for a turn.
    pub fn fail(&mut self, generation: u64, err: &TransportError) -> Vec<StreamEvent> {
        let Some(turn) = self.take_turn(generation) else {
            debug!(generation, error = %err, "ignoring transport error for inactive turn");
            return Vec::new();
        };
        self.fail_turn(turn, StreamFailure::from(err))
    }

    /// Cancels the turn identified by `generation`.
    pub fn abort(&mut self, generation: u64) -> Vec<StreamEvent> {
        let Some(turn) = self.take_turn(generation) else {
            return Vec::new();
        };
        info!(turn_id = %turn.turn_id, generation, "turn aborted");
        self.session_id = turn.rollback.session_id.clone();
        let mut events = self.roll_back(turn);
        self.state = TurnState::Aborted;
        events.push(StreamEvent::Aborted { generation });
        events
    }

    /// Cancels whatever turn is streaming.
    pub fn abort_active(&mut self) -> Vec<StreamEvent> {
        match self.active_generation() {
            Some(generation) => self.abort(generation),
            None => Vec::new(),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.active_generation() == Some(generation)
    }

    fn take_turn(&mut self, generation: u64) -> Option<ActiveTurn> {
        if self.is_current(generation) {
            self.active.take()
        } else {
            None
        }
    }

    fn fail_turn(&mut self, turn: ActiveTurn, failure: StreamFailure) -> Vec<StreamEvent> {
        let generation = turn.generation;
        warn!(turn_id = %turn.turn_id, generation, error = %failure, "turn failed");
        let mut events = self.roll_back(turn);
        self.state = TurnState::Failed;
        events.push(StreamEvent::Failed {
            generation,
            failure,
        });
        events
    }

    /// Restores cards and citations. A session id the backend assigned
    /// during the turn is kept unless the turn was aborted.
    fn roll_back(&mut self, turn: ActiveTurn) -> Vec<StreamEvent> {
        let Rollback {
            entities,
            citations,
            ..
        } = turn.rollback;
        self.citations = citations;
        if entities == self.entities {
            return Vec::new();
        }
        self.entities = entities;
        vec![StreamEvent::EntitiesUpdated {
            generation: turn.generation,
            entities: self.entities.clone(),
        }]
    }
}

/// Re-parses the turn buffer and updates the displayed entities when the
/// parse produced something new.
fn reparse(
    parser: &TolerantParser,
    turn: &ActiveTurn,
    entities: &mut Vec<Entity>,
) -> Option<StreamEvent> {
    match parser.parse(&turn.buffer) {
        ParseOutcome::Entities { entities: parsed, .. } if !parsed.is_empty() => {
            let merged = merge(&turn.head, parsed, turn.mode);
            if merged == *entities {
                return None;
            }
            *entities = merged;
            Some(StreamEvent::EntitiesUpdated {
                generation: turn.generation,
                entities: entities.clone(),
            })
        }
        ParseOutcome::Entities { .. } | ParseOutcome::NotYetParseable => None,
        ParseOutcome::Invalid(err) => {
            debug!(generation = turn.generation, error = %err, "buffer not parseable yet");
            None
        }
    }
}

fn preview(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(PREVIEW_CHARS) {
        Some((idx, _)) => format!("{}…", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
