//! Splits raw chunks into renderable content and inline out-of-band events.
//!
//! Events travel inside the text stream, bracketed by marker strings:
//!
//! ```text
//! ...some content[EVENT]{"type":"token_usage","data":{"input_tokens":10}}[/EVENT]more content...
//! ```
//!
//! The marker syntax lives in [`EventFraming`] so callers never match on it
//! directly.

use serde_json::Value;

use crate::usage::UsageDelta;

/// Default opening marker.
pub const EVENT_OPEN: &str = "[EVENT]";
/// Default closing marker.
pub const EVENT_CLOSE: &str = "[/EVENT]";

const DEFAULT_MAX_PENDING: usize = 16 * 1024;

/// Out-of-band signal extracted from the stream.
#[derive(Clone, Debug, PartialEq)]
pub enum InlineEvent {
    /// Token counters for the current turn.
    TokenUsage(UsageDelta),
    /// A well-formed event of a kind this crate does not interpret.
    Other { kind: String, data: Value },
}

/// Result of demultiplexing one chunk.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Demuxed {
    /// Text outside recognized events, in original order.
    pub content: String,
    /// Events found in the chunk, in order of appearance.
    pub events: Vec<InlineEvent>,
    /// Trailing text that may still turn into an event once more input
    /// arrives. Prepend it to the next chunk, or treat it as content when
    /// the stream ends.
    pub remainder: String,
}

/// Interpretation of a chunk the transport already decoded as JSON.
#[derive(Clone, Debug, PartialEq)]
pub enum JsonChunk {
    Event(InlineEvent),
    Content(String),
    Citations(Vec<Value>),
    Ignored,
}

/// Marker convention used to frame inline events.
#[derive(Clone, Debug)]
pub struct EventFraming {
    open: String,
    close: String,
    max_pending: usize,
}

impl Default for EventFraming {
    fn default() -> Self {
        Self::new(EVENT_OPEN, EVENT_CLOSE)
    }
}

impl EventFraming {
    /// Creates a framing with custom markers.
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
            max_pending: DEFAULT_MAX_PENDING,
        }
    }

    /// Caps how much text may be held back waiting for a closing marker.
    ///
    /// Past the cap the held text is released as content.
    pub fn max_pending(mut self, bytes: usize) -> Self {
        self.max_pending = bytes;
        self
    }

    /// Splits `chunk` into content and events. Has no side effects.
    pub fn demultiplex(&self, chunk: &str) -> Demuxed {
        let mut out = Demuxed::default();
        if self.open.is_empty() || self.close.is_empty() {
            out.content.push_str(chunk);
            return out;
        }

        let mut rest = chunk;
        loop {
            let Some(start) = rest.find(&self.open) else {
                let keep = self.partial_open_suffix(rest);
                let split = rest.len() - keep;
                out.content.push_str(&rest[..split]);
                out.remainder.push_str(&rest[split..]);
                break;
            };

            out.content.push_str(&rest[..start]);
            let body_start = start + self.open.len();
            let Some(body_len) = rest[body_start..].find(&self.close) else {
                let pending = &rest[start..];
                if pending.len() > self.max_pending {
                    out.content.push_str(pending);
                } else {
                    out.remainder.push_str(pending);
                }
                break;
            };

            let span_end = body_start + body_len + self.close.len();
            match decode_event(&rest[body_start..body_start + body_len]) {
                Some(event) => out.events.push(event),
                None => out.content.push_str(&rest[start..span_end]),
            }
            rest = &rest[span_end..];
        }
        out
    }

    /// Length of the longest suffix of `text` that is a proper prefix of the
    /// opening marker.
    fn partial_open_suffix(&self, text: &str) -> usize {
        (1..self.open.len())
            .rev()
            .filter(|&k| self.open.is_char_boundary(k))
            .find(|&k| text.ends_with(&self.open[..k]))
            .unwrap_or(0)
    }
}

/// Demultiplexes with the default `[EVENT]`/`[/EVENT]` framing.
pub fn demultiplex(chunk: &str) -> Demuxed {
    EventFraming::default().demultiplex(chunk)
}

/// Classifies a structured chunk.
pub fn classify_json_chunk(value: &Value) -> JsonChunk {
    if value.get("type").is_some() {
        return match event_from_value(value) {
            Some(event) => JsonChunk::Event(event),
            None => JsonChunk::Ignored,
        };
    }
    if let Some(text) = value.get("data").and_then(Value::as_str) {
        return JsonChunk::Content(text.to_string());
    }
    if let Some(citations) = value
        .get("metadata")
        .and_then(|m| m.get("citations"))
        .and_then(Value::as_array)
    {
        return JsonChunk::Citations(citations.clone());
    }
    JsonChunk::Ignored
}

fn decode_event(payload: &str) -> Option<InlineEvent> {
    let value: Value = serde_json::from_str(payload.trim()).ok()?;
    event_from_value(&value)
}

fn event_from_value(value: &Value) -> Option<InlineEvent> {
    let kind = value.get("type")?.as_str()?;
    let data = value.get("data").cloned().unwrap_or(Value::Null);
    Some(match kind {
        "token_usage" => InlineEvent::TokenUsage(UsageDelta::from_payload(&data)),
        other => InlineEvent::Other {
            kind: other.to_string(),
            data,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_text_passes_through_unchanged() {
        let out = demultiplex("  [{\"title\": \"a\"},\n ");
        assert_eq!(out.content, "  [{\"title\": \"a\"},\n ");
        assert!(out.events.is_empty());
        assert!(out.remainder.is_empty());
    }

    #[test]
    fn usage_event_is_removed_from_content() {
        let out = demultiplex(
            "before [EVENT]{\"type\":\"token_usage\",\"data\":{\"input_tokens\":10,\"output_tokens\":5}}[/EVENT] after",
        );
        assert_eq!(out.content, "before  after");
        assert_eq!(
            out.events,
            vec![InlineEvent::TokenUsage(UsageDelta::new(10, 5))]
        );
    }

    #[test]
    fn several_events_keep_order() {
        let out = demultiplex(
            "[EVENT]{\"type\":\"token_usage\",\"data\":{\"input_tokens\":1}}[/EVENT]x[EVENT]{\"type\":\"progress\",\"data\":3}[/EVENT]y",
        );
        assert_eq!(out.content, "xy");
        assert_eq!(out.events.len(), 2);
        assert_eq!(
            out.events[1],
            InlineEvent::Other {
                kind: "progress".into(),
                data: json!(3)
            }
        );
    }

    #[test]
    fn malformed_payload_stays_content() {
        let chunk = "a[EVENT]{not json}[/EVENT]b[EVENT]{\"no_type\":1}[/EVENT]c";
        let out = demultiplex(chunk);
        assert_eq!(out.content, chunk);
        assert!(out.events.is_empty());
    }

    #[test]
    fn unclosed_event_is_held_back() {
        let out = demultiplex("text[EVENT]{\"type\":\"token_us");
        assert_eq!(out.content, "text");
        assert_eq!(out.remainder, "[EVENT]{\"type\":\"token_us");
    }

    #[test]
    fn partial_open_marker_is_held_back() {
        let out = demultiplex("abc[EVE");
        assert_eq!(out.content, "abc");
        assert_eq!(out.remainder, "[EVE");

        let out = demultiplex("[{\"a\":1}]");
        assert_eq!(out.content, "[{\"a\":1}]");
        assert!(out.remainder.is_empty());
    }

    #[test]
    fn split_event_reassembles_with_remainder() {
        let first = demultiplex("x[EVENT]{\"type\":\"token_usage\",");
        let joined = format!(
            "{}\"data\":{{\"output_tokens\":4}}}}[/EVENT]y",
            first.remainder
        );
        let second = demultiplex(&joined);
        assert_eq!(format!("{}{}", first.content, second.content), "xy");
        assert_eq!(
            second.events,
            vec![InlineEvent::TokenUsage(UsageDelta {
                input_tokens: None,
                output_tokens: Some(4),
            })]
        );
    }

    #[test]
    fn oversized_pending_is_released() {
        let framing = EventFraming::default().max_pending(8);
        let out = framing.demultiplex("[EVENT] a long unterminated tail");
        assert_eq!(out.content, "[EVENT] a long unterminated tail");
        assert!(out.remainder.is_empty());
    }

    #[test]
    fn demultiplex_is_repeatable() {
        let chunk = "a[EVENT]{\"type\":\"token_usage\",\"data\":{}}[/EVENT]b[EV";
        assert_eq!(demultiplex(chunk), demultiplex(chunk));
    }

    #[test]
    fn custom_framing() {
        let framing = EventFraming::new("<<", ">>");
        let out = framing.demultiplex("a<<{\"type\":\"token_usage\",\"data\":{\"input_tokens\":2}}>>b");
        assert_eq!(out.content, "ab");
        assert_eq!(out.events.len(), 1);
    }

    #[test]
    fn classifies_json_chunks() {
        assert_eq!(
            classify_json_chunk(&json!({"type":"token_usage","data":{"input_tokens":3,"output_tokens":1}})),
            JsonChunk::Event(InlineEvent::TokenUsage(UsageDelta::new(3, 1)))
        );
        assert_eq!(
            classify_json_chunk(&json!({"data":"[{"})),
            JsonChunk::Content("[{".into())
        );
        assert_eq!(
            classify_json_chunk(&json!({"metadata":{"citations":[{"url":"u"}]}})),
            JsonChunk::Citations(vec![json!({"url":"u"})])
        );
        assert_eq!(classify_json_chunk(&json!({"other":1})), JsonChunk::Ignored);
    }
}
