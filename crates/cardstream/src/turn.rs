use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::controller::{TurnSpec, TurnTicket};
use crate::errors::{CardStreamError, TransportError};
use crate::merge::MergeMode;
use crate::options::{ResponseFormat, TurnOptions};
use crate::request::ConversationRequest;
use crate::session::Conversation;
use crate::stream::{StreamEvent, TurnOutcome};
use crate::transport::{RawChunk, ResponseMeta, Transport, TransportRequest};

/// Handle used to request cancellation of a streaming turn.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    fn new() -> (Self, AbortSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, AbortSignal { rx })
    }

    /// Requests cancellation.
    ///
    /// Becomes visible as a terminal `StreamEvent::Aborted`.
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Receiving side of an [`AbortHandle`].
#[derive(Clone, Debug)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        AbortHandle::new().1
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if every
    /// handle was dropped without aborting.
    pub async fn aborted(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                futures::future::pending::<()>().await;
            }
        }
    }
}

/// Builder for configuring and starting one turn.
pub struct TurnBuilder<'a> {
    conversation: &'a mut Conversation,
    request: ConversationRequest,
    spec: TurnSpec,
    options: TurnOptions,
    path: Option<String>,
}

impl<'a> TurnBuilder<'a> {
    pub(crate) fn new(conversation: &'a mut Conversation, request: ConversationRequest) -> Self {
        let options = conversation.client.default_options.clone();
        Self {
            conversation,
            request,
            spec: TurnSpec::default(),
            options,
            path: None,
        }
    }

    /// Sends the turn to another endpoint than the client's prompt path.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// How parsed cards combine with the existing ones.
    pub fn mode(mut self, mode: MergeMode) -> Self {
        self.spec.mode = mode;
        self
    }

    pub fn format(mut self, format: ResponseFormat) -> Self {
        self.spec.format = format;
        self
    }

    /// Drops the conversation id so the backend starts a new conversation.
    pub fn new_conversation(mut self, yes: bool) -> Self {
        self.spec.new_conversation = yes;
        self
    }

    /// Sets an optional per-turn timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    /// Sets the bounded buffer size between the transport task and the
    /// consumer.
    pub fn stream_buffer_capacity(mut self, capacity: usize) -> Self {
        self.options.stream_buffer_capacity = capacity;
        self
    }

    /// Validates the builder state and starts streaming.
    ///
    /// The returned `TurnStream` yields `TurnStarted`, incremental events and
    /// exactly one terminal `Completed`/`Aborted`/`Failed` event.
    pub async fn start_stream(self) -> Result<TurnStream<'a>, CardStreamError> {
        let Self {
            conversation,
            mut request,
            spec,
            options,
            path,
        } = self;

        if options.stream_buffer_capacity == 0 {
            return Err(CardStreamError::Validation(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        if let Some(path) = &path
            && !path.starts_with('/')
        {
            return Err(CardStreamError::Validation(format!(
                "path must start with '/': {path}"
            )));
        }
        if request.userinput.trim().is_empty() {
            return Err(CardStreamError::Validation(
                "userinput must not be empty".into(),
            ));
        }

        let (ticket, events) = conversation.controller.begin(spec);
        request.chat_session_id = if spec.new_conversation {
            None
        } else {
            conversation.controller.session_id().cloned()
        };
        let body = match serde_json::to_value(&request) {
            Ok(body) => body,
            Err(err) => {
                conversation.controller.abort(ticket.generation);
                return Err(CardStreamError::protocol_msg(format!(
                    "request body is not serializable: {err}"
                )));
            }
        };

        let (abort_handle, signal) = AbortHandle::new();
        let (tx, rx) = mpsc::channel(options.stream_buffer_capacity);
        let transport_request = TransportRequest {
            turn_id: ticket.turn_id,
            method: reqwest::Method::POST,
            path: path.unwrap_or_else(|| conversation.client.prompt_path.clone()),
            body,
            abort: signal.clone(),
            timeout: options.timeout,
        };
        debug!(
            conversation = %conversation.config.name,
            turn_id = %ticket.turn_id,
            generation = ticket.generation,
            transport = conversation.client.transport.name(),
            "dispatching turn"
        );
        tokio::spawn(pump_task(
            conversation.client.transport.clone(),
            transport_request,
            ticket.generation,
            tx,
            signal.clone(),
        ));

        Ok(TurnStream {
            conversation,
            ticket,
            rx,
            abort_handle,
            signal,
            pending: events.into(),
            terminal: None,
            done: false,
        })
    }

    /// Runs the turn to completion and returns its outcome.
    pub async fn collect(self) -> Result<TurnOutcome, CardStreamError> {
        self.start_stream().await?.finish().await
    }
}

/// Item forwarded from the transport task, tagged with its turn generation.
#[derive(Debug)]
struct Pumped {
    generation: u64,
    item: PumpItem,
}

#[derive(Debug)]
enum PumpItem {
    Opened(ResponseMeta),
    Chunk(RawChunk),
    Ended,
    Failed(TransportError),
}

enum Step {
    Abort,
    Item(Option<Pumped>),
}

/// Streaming handle returned by `TurnBuilder::start_stream`.
///
/// Transport items are applied to the conversation as they are consumed, so
/// state only advances while the stream is polled. Dropping an unfinished
/// stream aborts the turn.
pub struct TurnStream<'a> {
    conversation: &'a mut Conversation,
    ticket: TurnTicket,
    rx: mpsc::Receiver<Pumped>,
    abort_handle: AbortHandle,
    signal: AbortSignal,
    pending: VecDeque<StreamEvent>,
    terminal: Option<Result<TurnOutcome, CardStreamError>>,
    done: bool,
}

impl TurnStream<'_> {
    pub fn turn_id(&self) -> uuid::Uuid {
        self.ticket.turn_id
    }

    pub fn generation(&self) -> u64 {
        self.ticket.generation
    }

    /// Returns a handle that can cancel the turn.
    pub fn abort_handle(&self) -> AbortHandle {
        self.abort_handle.clone()
    }

    /// Read access to the conversation while the turn streams.
    pub fn conversation(&self) -> &Conversation {
        &*self.conversation
    }

    /// Waits for and returns the next event.
    ///
    /// Returns `None` once the terminal event has been yielded.
    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                if event.is_terminal() {
                    self.done = true;
                    self.pending.clear();
                    self.terminal = terminal_result(&event);
                }
                return Some(event);
            }
            if self.done {
                return None;
            }

            let step = tokio::select! {
                biased;
                _ = self.signal.aborted() => Step::Abort,
                item = self.rx.recv() => Step::Item(item),
            };
            let generation = self.ticket.generation;
            let controller = &mut self.conversation.controller;
            let events = match step {
                Step::Abort => controller.abort(generation),
                Step::Item(Some(Pumped { generation, item })) => match item {
                    PumpItem::Opened(meta) => controller.apply_meta(generation, &meta),
                    PumpItem::Chunk(chunk) => controller.apply_chunk(generation, chunk),
                    PumpItem::Ended => controller.finish(generation),
                    PumpItem::Failed(err) => controller.fail(generation, &err),
                },
                Step::Item(None) => controller.fail(
                    generation,
                    &TransportError::protocol("transport task ended without end of stream"),
                ),
            };
            if events.is_empty() && controller.active_generation() != Some(generation) {
                self.done = true;
            }
            self.pending.extend(events);
        }
    }

    /// Drains the stream (if needed) and returns the terminal outcome.
    ///
    /// Safe to call after consuming events with `next_event()`.
    pub async fn finish(mut self) -> Result<TurnOutcome, CardStreamError> {
        while self.next_event().await.is_some() {}
        match self.terminal.take() {
            Some(result) => result,
            None => Err(CardStreamError::protocol_msg(format!(
                "turn {} ended without a terminal event",
                self.ticket.turn_id
            ))),
        }
    }
}

fn terminal_result(event: &StreamEvent) -> Option<Result<TurnOutcome, CardStreamError>> {
    match event {
        StreamEvent::Completed { outcome, .. } => Some(Ok(outcome.clone())),
        StreamEvent::Failed { failure, .. } => Some(Err(CardStreamError::Failed(failure.clone()))),
        StreamEvent::Aborted { .. } => Some(Err(CardStreamError::Aborted)),
        _ => None,
    }
}

impl Drop for TurnStream<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.abort_handle.abort();
        let events = self.conversation.controller.abort(self.ticket.generation);
        if !events.is_empty() {
            debug!(turn_id = %self.ticket.turn_id, "unfinished turn dropped");
        }
    }
}

async fn pump_task(
    transport: Arc<dyn Transport>,
    request: TransportRequest,
    generation: u64,
    tx: mpsc::Sender<Pumped>,
    mut signal: AbortSignal,
) {
    let turn_id = request.turn_id;
    let timeout = request.timeout;
    let work = forward_chunks(transport, request, generation, &tx);
    let result = tokio::select! {
        _ = signal.aborted() => {
            debug!(%turn_id, generation, "transport task stopped by abort");
            return;
        }
        result = with_timeout(timeout, work) => result,
    };
    if let Err(err) = result {
        warn!(%turn_id, generation, error = %err, "transport failed");
        let _ = tx
            .send(Pumped {
                generation,
                item: PumpItem::Failed(err),
            })
            .await;
    }
}

async fn with_timeout<F>(limit: Option<Duration>, work: F) -> Result<(), TransportError>
where
    F: Future<Output = Result<(), TransportError>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, work).await.unwrap_or_else(|_| {
            Err(TransportError::io(format!(
                "turn timed out after {} ms",
                limit.as_millis()
            )))
        }),
        None => work.await,
    }
}

/// Opens the transport and forwards everything it yields. Returns `Ok` when
/// the receiver is gone.
async fn forward_chunks(
    transport: Arc<dyn Transport>,
    request: TransportRequest,
    generation: u64,
    tx: &mpsc::Sender<Pumped>,
) -> Result<(), TransportError> {
    let turn_id = request.turn_id;
    let opened = transport.open(request).await?;
    if !send(tx, generation, PumpItem::Opened(opened.meta)).await {
        return Ok(());
    }
    let mut chunks = opened.chunks;
    let mut count = 0_u64;
    while let Some(chunk) = chunks.next().await {
        let chunk = chunk?;
        count += 1;
        if !send(tx, generation, PumpItem::Chunk(chunk)).await {
            return Ok(());
        }
    }
    debug!(%turn_id, generation, chunks = count, "transport stream ended");
    send(tx, generation, PumpItem::Ended).await;
    Ok(())
}

async fn send(tx: &mpsc::Sender<Pumped>, generation: u64, item: PumpItem) -> bool {
    tx.send(Pumped { generation, item }).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Client;
    use crate::entity::Entity;
    use crate::errors::StreamFailure;
    use crate::session::{ConversationConfig, SessionId};
    use crate::stream::TurnState;
    use crate::transport::TransportStream;
    use crate::usage::TokenUsage;
    use futures::stream;
    use std::sync::Mutex;

    enum Script {
        Chunks(Vec<Result<RawChunk, TransportError>>),
        OpenError(TransportError),
        Pending,
    }

    struct FakeTransport {
        session_id: Option<&'static str>,
        scripts: Mutex<VecDeque<Script>>,
        bodies: Mutex<Vec<serde_json::Value>>,
        paths: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn new(session_id: Option<&'static str>, scripts: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                session_id,
                scripts: Mutex::new(scripts.into()),
                bodies: Mutex::new(Vec::new()),
                paths: Mutex::new(Vec::new()),
            })
        }

        fn bodies(&self) -> Vec<serde_json::Value> {
            self.bodies.lock().expect("lock").clone()
        }

        fn paths(&self) -> Vec<String> {
            self.paths.lock().expect("lock").clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        fn name(&self) -> &str {
            "fake"
        }

        async fn open(&self, request: TransportRequest) -> Result<TransportStream, TransportError> {
            self.paths.lock().expect("lock").push(request.path);
            self.bodies.lock().expect("lock").push(request.body);
            let script = self
                .scripts
                .lock()
                .expect("lock")
                .pop_front()
                .unwrap_or(Script::Chunks(Vec::new()));
            let chunks: crate::transport::ChunkStream = match script {
                Script::OpenError(err) => return Err(err),
                Script::Chunks(chunks) => Box::pin(stream::iter(chunks)),
                Script::Pending => Box::pin(stream::pending()),
            };
            Ok(TransportStream {
                meta: ResponseMeta {
                    status: Some(200),
                    session_id: self.session_id.map(SessionId::new),
                },
                chunks,
            })
        }
    }

    fn text(s: &str) -> Result<RawChunk, TransportError> {
        Ok(RawChunk::from(s))
    }

    fn conversation(transport: Arc<FakeTransport>) -> Conversation {
        Client::builder()
            .transport(transport)
            .build()
            .expect("build client")
            .conversation(ConversationConfig::named("test"))
    }

    fn titles(entities: &[Entity]) -> Vec<&str> {
        entities.iter().filter_map(Entity::title).collect()
    }

    #[tokio::test]
    async fn streams_cards_and_completes() {
        let transport = FakeTransport::new(
            Some("chat-1"),
            vec![Script::Chunks(vec![
                text("[{\"title\":\"A\"},"),
                text("[EVENT]{\"type\":\"token_usage\",\"data\":{\"input_tokens\":10,\"output_tokens\":5}}[/EVENT]"),
                text("{\"title\":\"B\"}]"),
            ])],
        );
        let mut conversation = conversation(transport.clone());
        let mut stream = conversation
            .first_turn("banking", "cards")
            .start_stream()
            .await
            .expect("start");

        let mut updates = Vec::new();
        let mut saw_session = false;
        let first = stream.next_event().await.expect("first event");
        assert!(matches!(first, StreamEvent::TurnStarted { .. }));
        while let Some(event) = stream.next_event().await {
            match event {
                StreamEvent::EntitiesUpdated { entities, .. } => updates.push(entities.len()),
                StreamEvent::SessionAssigned { .. } => saw_session = true,
                _ => {}
            }
        }
        assert_eq!(updates, vec![1, 2]);
        assert!(saw_session);
        let outcome = stream.finish().await.expect("finish");
        assert_eq!(outcome.added, 2);
        assert_eq!(outcome.usage, TokenUsage::new(10, 5));
        assert_eq!(titles(conversation.entities()), vec!["A", "B"]);
        assert_eq!(conversation.session_id().map(SessionId::as_str), Some("chat-1"));
        assert_eq!(conversation.state(), TurnState::Completed);
    }

    #[tokio::test]
    async fn later_turns_carry_the_session_id() {
        let transport = FakeTransport::new(
            Some("chat-1"),
            vec![
                Script::Chunks(vec![text("[{\"title\":\"A\"}]")]),
                Script::Chunks(vec![text("[{\"title\":\"B\"}]")]),
            ],
        );
        let mut conversation = conversation(transport.clone());
        conversation.first_turn("banking", "cards").collect().await.expect("first");
        let outcome = conversation.generate_more().collect().await.expect("more");
        assert_eq!(titles(&outcome.entities), vec!["A", "B"]);

        let bodies = transport.bodies();
        assert!(bodies[0].get("chatSessionId").is_none());
        assert_eq!(bodies[1]["chatSessionId"], serde_json::json!("chat-1"));
        assert_eq!(bodies[1]["json"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn finish_after_draining_returns_the_outcome() {
        let transport = FakeTransport::new(None, vec![Script::Chunks(vec![text("[{\"title\":\"A\"}]")])]);
        let mut conversation = conversation(transport);
        let mut stream = conversation
            .first_turn("banking", "cards")
            .start_stream()
            .await
            .expect("start");
        let mut terminal = None;
        while let Some(event) = stream.next_event().await {
            if event.is_terminal() {
                terminal = Some(event);
            }
        }
        assert!(matches!(terminal, Some(StreamEvent::Completed { .. })));
        let outcome = stream.finish().await.expect("finish");
        assert_eq!(titles(&outcome.entities), vec!["A"]);
    }

    #[tokio::test]
    async fn finish_after_draining_a_failed_turn_returns_the_failure() {
        let transport = FakeTransport::new(None, vec![Script::Chunks(vec![text("I cannot help")])]);
        let mut conversation = conversation(transport);
        let mut stream = conversation
            .first_turn("banking", "cards")
            .start_stream()
            .await
            .expect("start");
        while stream.next_event().await.is_some() {}
        let result = stream.finish().await;
        assert!(matches!(result, Err(CardStreamError::Failed(StreamFailure::Unparseable { .. }))));
    }

    #[tokio::test]
    async fn follow_up_goes_to_the_follow_up_endpoint() {
        let transport = FakeTransport::new(
            Some("chat-1"),
            vec![
                Script::Chunks(vec![text(
                    "[{\"title\":\"A\",\"summary\":\"first\"},{\"title\":\"B\",\"summary\":\"second\",\"exclude\":true}]",
                )]),
                Script::Chunks(vec![text("Both carry "), text("low risk.")]),
            ],
        );
        let mut conversation = conversation(transport.clone());
        conversation.first_turn("banking", "cards").collect().await.expect("first");
        let outcome = conversation
            .follow_up("banking", "what risks?", "risks", "cards")
            .collect()
            .await
            .expect("follow-up");

        assert_eq!(outcome.text, "Both carry low risk.");
        assert_eq!(titles(conversation.entities()), vec!["A", "B"]);
        assert_eq!(transport.paths(), vec!["/api/prompt", "/api/prompt/follow-up"]);
        let body = &transport.bodies()[1];
        assert_eq!(body["userinput"], serde_json::json!("banking what risks?"));
        assert_eq!(body["promptid"], serde_json::json!("risks"));
        assert_eq!(body["previous_promptid"], serde_json::json!("cards"));
        assert_eq!(body["chatSessionId"], serde_json::json!("chat-1"));
        assert_eq!(
            body["scenarios"],
            serde_json::json!([{"title": "A", "content": "first"}])
        );
    }

    #[tokio::test]
    async fn abort_restores_previous_cards() {
        let transport = FakeTransport::new(
            None,
            vec![
                Script::Chunks(vec![text("[{\"title\":\"A\"}]")]),
                Script::Chunks(vec![text("[{\"title\":\"B\"},")]),
            ],
        );
        let mut conversation = conversation(transport);
        conversation.first_turn("banking", "cards").collect().await.expect("first");

        let mut stream = conversation
            .turn(ConversationRequest::new("again"))
            .start_stream()
            .await
            .expect("start");
        let abort = stream.abort_handle();
        loop {
            match stream.next_event().await.expect("event") {
                StreamEvent::EntitiesUpdated { entities, .. } if titles(&entities) == vec!["B"] => break,
                event => assert!(!event.is_terminal(), "unexpected {event:?}"),
            }
        }
        abort.abort();
        let result = stream.finish().await;
        assert!(matches!(result, Err(CardStreamError::Aborted)));
        assert_eq!(titles(conversation.entities()), vec!["A"]);
        assert_eq!(conversation.state(), TurnState::Aborted);
    }

    #[tokio::test]
    async fn dropping_an_unfinished_stream_aborts_it() {
        let transport = FakeTransport::new(None, vec![Script::Pending]);
        let mut conversation = conversation(transport);
        let stream = conversation
            .first_turn("banking", "cards")
            .start_stream()
            .await
            .expect("start");
        drop(stream);
        assert_eq!(conversation.state(), TurnState::Aborted);
        assert!(conversation.controller().active_generation().is_none());
    }

    #[tokio::test]
    async fn transport_errors_are_terminal_failures() {
        let transport = FakeTransport::new(
            None,
            vec![
                Script::OpenError(TransportError::http(503, "unavailable")),
                Script::Chunks(vec![text("[{\"title\":\"A\"}"), Err(TransportError::io("reset"))]),
            ],
        );
        let mut conversation = conversation(transport);
        let first = conversation.first_turn("banking", "cards").collect().await;
        assert!(matches!(
            first,
            Err(CardStreamError::Failed(StreamFailure::Transport { message })) if message.contains("503")
        ));
        let second = conversation.first_turn("banking", "cards").collect().await;
        assert!(matches!(second, Err(CardStreamError::Failed(StreamFailure::Transport { .. }))));
        assert!(conversation.entities().is_empty());
    }

    #[tokio::test]
    async fn timeout_fails_the_turn() {
        let transport = FakeTransport::new(None, vec![Script::Pending]);
        let mut conversation = conversation(transport);
        let result = conversation
            .first_turn("banking", "cards")
            .timeout(Duration::from_millis(20))
            .collect()
            .await;
        assert!(matches!(result, Err(CardStreamError::Failed(StreamFailure::Transport { message })) if message.contains("timed out")));
    }

    #[tokio::test]
    async fn validation_rejects_bad_turns() {
        let transport = FakeTransport::new(None, vec![]);
        let mut conversation = conversation(transport);
        {
            let empty = conversation.turn(ConversationRequest::new("   ")).start_stream().await;
            assert!(matches!(empty, Err(CardStreamError::Validation(msg)) if msg.contains("userinput")));
        }
        {
            let zero = conversation
                .chat("hello")
                .stream_buffer_capacity(0)
                .start_stream()
                .await;
            assert!(matches!(zero, Err(CardStreamError::Validation(msg)) if msg.contains("stream_buffer_capacity")));
        }
        assert_eq!(conversation.state(), TurnState::Idle);
    }

    #[tokio::test]
    async fn empty_response_is_a_warning_failure() {
        let transport = FakeTransport::new(None, vec![Script::Chunks(vec![])]);
        let mut conversation = conversation(transport);
        let result = conversation.chat("hello").collect().await;
        match result {
            Err(CardStreamError::Failed(failure)) => {
                assert_eq!(failure, StreamFailure::EmptyOutput);
                assert_eq!(failure.severity(), crate::errors::Severity::Warning);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn abort_signal_reflects_handle() {
        let (handle, signal) = AbortHandle::new();
        assert!(!signal.is_aborted());
        handle.abort();
        assert!(signal.is_aborted());
        assert!(handle.is_aborted());
        assert!(!AbortSignal::never().is_aborted());
    }
}
