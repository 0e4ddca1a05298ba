use std::sync::Arc;

use crate::demux::EventFraming;
use crate::errors::CardStreamError;
use crate::http::{HttpTransport, HttpTransportConfig};
use crate::options::{DEFAULT_PROMPT_PATH, FOLLOW_UP_SUFFIX, TurnOptions};
use crate::session::{Conversation, ConversationConfig};
use crate::transport::Transport;

pub(crate) struct ClientInner {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) prompt_path: String,
    pub(crate) follow_up_path: String,
    pub(crate) default_options: TurnOptions,
    pub(crate) framing: EventFraming,
}

/// Entry point for creating conversations against one backend.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

impl Client {
    /// Starts a builder for configuring a `Client`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Builds a client over [`HttpTransport`] configured from `CARDSTREAM_*`
    /// environment variables.
    pub fn from_env() -> Result<Self, CardStreamError> {
        let config = HttpTransportConfig::from_env()?;
        let prompt_path = config.prompt_path.clone();
        Self::builder()
            .transport(Arc::new(HttpTransport::new(config)?))
            .prompt_path(prompt_path)
            .build()
    }

    /// Creates a conversation surface with empty state.
    pub fn conversation(&self, config: ConversationConfig) -> Conversation {
        Conversation::new(self.inner.clone(), config)
    }

    pub fn transport_name(&self) -> &str {
        self.inner.transport.name()
    }
}

/// Builder used to configure a transport and defaults before creating a
/// `Client`.
#[derive(Default)]
pub struct ClientBuilder {
    transport: Option<Arc<dyn Transport>>,
    prompt_path: Option<String>,
    follow_up_path: Option<String>,
    default_options: TurnOptions,
    framing: EventFraming,
}

impl ClientBuilder {
    /// Sets the transport used for every turn.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Overrides the prompt endpoint path (defaults to `/api/prompt`).
    pub fn prompt_path(mut self, path: impl Into<String>) -> Self {
        self.prompt_path = Some(path.into());
        self
    }

    /// Overrides the follow-up endpoint path (defaults to the prompt path
    /// followed by `/follow-up`).
    pub fn follow_up_path(mut self, path: impl Into<String>) -> Self {
        self.follow_up_path = Some(path.into());
        self
    }

    /// Options applied to every turn unless the turn overrides them.
    pub fn default_options(mut self, options: TurnOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Uses custom inline event markers.
    pub fn framing(mut self, framing: EventFraming) -> Self {
        self.framing = framing;
        self
    }

    /// Builds the client and validates its configuration.
    pub fn build(self) -> Result<Client, CardStreamError> {
        let transport = self
            .transport
            .ok_or_else(|| CardStreamError::Config("a transport is required".into()))?;
        let prompt_path = self
            .prompt_path
            .unwrap_or_else(|| DEFAULT_PROMPT_PATH.to_string());
        let follow_up_path = self
            .follow_up_path
            .unwrap_or_else(|| format!("{}{FOLLOW_UP_SUFFIX}", prompt_path.trim_end_matches('/')));
        for path in [&prompt_path, &follow_up_path] {
            if !path.starts_with('/') {
                return Err(CardStreamError::Config(format!(
                    "prompt path must start with '/': {path}"
                )));
            }
        }
        if self.default_options.stream_buffer_capacity == 0 {
            return Err(CardStreamError::Config(
                "stream_buffer_capacity must be greater than 0".into(),
            ));
        }
        Ok(Client {
            inner: Arc::new(ClientInner {
                transport,
                prompt_path,
                follow_up_path,
                default_options: self.default_options,
                framing: self.framing,
            }),
        })
    }
}
