use std::time::Duration;

/// Path of the prompt endpoint on the backend.
pub const DEFAULT_PROMPT_PATH: &str = "/api/prompt";

/// Suffix appended to the prompt path for follow-up prompts.
pub const FOLLOW_UP_SUFFIX: &str = "/follow-up";

/// How the content of a turn is rendered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    /// A JSON array of cards, parsed incrementally.
    #[default]
    Cards,
    /// Free text (chat turns, follow-ups); rendered as-is.
    Text,
}

/// Per-turn behavior options.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct TurnOptions {
    /// Optional timeout covering the whole turn.
    pub timeout: Option<Duration>,
    /// Bounded buffer between the transport task and the consumer.
    pub stream_buffer_capacity: usize,
}

impl Default for TurnOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            stream_buffer_capacity: 128,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn turn_options_default_buffer_capacity() {
        assert_eq!(TurnOptions::default().stream_buffer_capacity, 128);
        assert_eq!(ResponseFormat::default(), ResponseFormat::Cards);
    }
}
