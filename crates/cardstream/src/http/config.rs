use std::time::Duration;

use crate::errors::CardStreamError;
use crate::options::DEFAULT_PROMPT_PATH;

/// Response header carrying the conversation id.
pub const DEFAULT_SESSION_HEADER: &str = "X-Chat-ID";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// How the response body is framed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamEncoding {
    /// Raw UTF-8 text; every network read becomes one text chunk.
    #[default]
    Text,
    /// Server-sent events; every `data` payload becomes one chunk.
    Sse,
}

impl std::str::FromStr for StreamEncoding {
    type Err = CardStreamError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "sse" => Ok(Self::Sse),
            other => Err(CardStreamError::Config(format!(
                "unknown stream encoding: {other} (expected text or sse)"
            ))),
        }
    }
}

/// Configuration for [`HttpTransport`](super::HttpTransport).
#[derive(Clone, Debug)]
pub struct HttpTransportConfig {
    /// Base URL of the backend, without the prompt path.
    pub base_url: String,
    /// Path of the prompt endpoint.
    pub prompt_path: String,
    /// Header the conversation id is read from.
    pub session_header: String,
    /// Limit for establishing the connection. Reading the streamed body is
    /// bounded only by the per-turn timeout.
    pub connect_timeout: Duration,
    pub encoding: StreamEncoding,
}

impl HttpTransportConfig {
    /// Creates a config with defaults for the given backend.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            prompt_path: DEFAULT_PROMPT_PATH.to_string(),
            session_header: DEFAULT_SESSION_HEADER.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            encoding: StreamEncoding::default(),
        }
    }

    /// Builds a config from `CARDSTREAM_*` environment variables.
    ///
    /// `CARDSTREAM_BASE_URL` is required. `CARDSTREAM_PROMPT_PATH`,
    /// `CARDSTREAM_SESSION_HEADER`, `CARDSTREAM_CONNECT_TIMEOUT_SECS` and
    /// `CARDSTREAM_STREAM_ENCODING` are optional.
    pub fn from_env() -> Result<Self, CardStreamError> {
        let base_url = std::env::var("CARDSTREAM_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(CardStreamError::Config(
                "missing CARDSTREAM_BASE_URL for the http transport".into(),
            ));
        }
        let mut config = Self::new(base_url.trim());
        if let Some(path) = non_empty_env("CARDSTREAM_PROMPT_PATH") {
            config = config.prompt_path(path);
        }
        if let Some(header) = non_empty_env("CARDSTREAM_SESSION_HEADER") {
            config = config.session_header(header);
        }
        if let Some(secs) = non_empty_env("CARDSTREAM_CONNECT_TIMEOUT_SECS") {
            let secs = secs.parse::<u64>().map_err(|e| {
                CardStreamError::Config(format!(
                    "invalid CARDSTREAM_CONNECT_TIMEOUT_SECS '{secs}': {e}"
                ))
            })?;
            config = config.connect_timeout(Duration::from_secs(secs));
        }
        if let Some(encoding) = non_empty_env("CARDSTREAM_STREAM_ENCODING") {
            config = config.encoding(encoding.parse()?);
        }
        Ok(config)
    }

    /// Overrides the backend base URL (for proxies or test servers).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn prompt_path(mut self, path: impl Into<String>) -> Self {
        self.prompt_path = path.into();
        self
    }

    pub fn session_header(mut self, header: impl Into<String>) -> Self {
        self.session_header = header.into();
        self
    }

    /// Overrides the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn encoding(mut self, encoding: StreamEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
