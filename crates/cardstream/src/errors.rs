/// Errors raised by a transport implementation before they are normalized
/// into a terminal turn outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Backend answered with a non-success HTTP status.
    #[error("http error ({status}): {message}")]
    Http { status: u16, message: String },
    /// Connection or stream I/O failed.
    #[error("io error: {message}")]
    Io { message: String },
    /// Response framing could not be decoded.
    #[error("protocol error: {message}")]
    Protocol { message: String },
}

impl TransportError {
    /// Creates an HTTP status error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Creates an I/O error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Creates a framing/protocol error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Returns the human-readable message for this error.
    pub fn message(&self) -> &str {
        match self {
            Self::Http { message, .. } | Self::Io { message } | Self::Protocol { message } => {
                message
            }
        }
    }
}

/// How loudly a failure should be surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Recoverable by rephrasing the input.
    Warning,
    /// The backend or the network reported a failure.
    Error,
}

/// Message shown when the model output cannot be turned into cards.
pub const REPHRASE_MESSAGE: &str =
    "Model failed to respond rightly, please rewrite your message and try again";

/// Terminal failure of one turn, surfaced once the stream has ended.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamFailure {
    /// The stream ended without any content.
    #[error("model produced no output")]
    EmptyOutput,
    /// The content never resolved to a list of cards.
    #[error("response is not parseable into a list: {preview}")]
    Unparseable { preview: String },
    /// The content carries an upstream error signature.
    #[error("upstream error: {message}")]
    Upstream { message: String },
    /// The transport failed before the stream completed.
    #[error("transport failure: {message}")]
    Transport { message: String },
}

impl StreamFailure {
    /// Returns whether this failure is a warning or an error.
    pub fn severity(&self) -> Severity {
        match self {
            Self::EmptyOutput | Self::Unparseable { .. } => Severity::Warning,
            Self::Upstream { .. } | Self::Transport { .. } => Severity::Error,
        }
    }

    /// Text suitable for a toast/notification line.
    pub fn user_message(&self) -> String {
        match self {
            Self::EmptyOutput | Self::Unparseable { .. } => REPHRASE_MESSAGE.to_string(),
            Self::Upstream { message } | Self::Transport { message } => message.clone(),
        }
    }
}

impl From<&TransportError> for StreamFailure {
    fn from(err: &TransportError) -> Self {
        Self::Transport {
            message: err.to_string(),
        }
    }
}

/// Top-level error type for the public API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CardStreamError {
    /// Invalid client or transport configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid input to a builder.
    #[error("validation error: {0}")]
    Validation(String),
    /// Transport failed before a stream was established.
    #[error(transparent)]
    Transport(TransportError),
    /// A started turn ended in a terminal failure.
    #[error(transparent)]
    Failed(StreamFailure),
    /// The turn was cancelled.
    #[error("aborted")]
    Aborted,
    /// Internal misuse or invariant violation.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl CardStreamError {
    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}

impl From<StreamFailure> for CardStreamError {
    fn from(value: StreamFailure) -> Self {
        CardStreamError::Failed(value)
    }
}

impl From<TransportError> for CardStreamError {
    fn from(value: TransportError) -> Self {
        CardStreamError::Transport(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_splits_warnings_from_errors() {
        assert_eq!(StreamFailure::EmptyOutput.severity(), Severity::Warning);
        assert_eq!(
            StreamFailure::Unparseable {
                preview: "hm".into()
            }
            .severity(),
            Severity::Warning
        );
        assert_eq!(
            StreamFailure::Upstream {
                message: "Error code: 429".into()
            }
            .severity(),
            Severity::Error
        );
    }

    #[test]
    fn transport_error_maps_to_transport_failure() {
        let failure = StreamFailure::from(&TransportError::http(502, "bad gateway"));
        assert!(
            matches!(failure, StreamFailure::Transport { ref message } if message.contains("502"))
        );
        assert_eq!(failure.severity(), Severity::Error);
    }

    #[test]
    fn warnings_use_rephrase_message() {
        assert_eq!(StreamFailure::EmptyOutput.user_message(), REPHRASE_MESSAGE);
        let upstream = StreamFailure::Upstream {
            message: "Error code: 500".into(),
        };
        assert_eq!(upstream.user_message(), "Error code: 500");
    }
}
