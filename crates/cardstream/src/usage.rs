//! Token usage accounting across chunks and turns.

use serde_json::Value;

/// Running token totals for a conversation surface.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One usage report as carried by an inline event. Absent fields count as zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UsageDelta {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl UsageDelta {
    /// Creates a delta with both counters present.
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens: Some(input_tokens),
            output_tokens: Some(output_tokens),
        }
    }

    /// Reads a `token_usage` payload.
    ///
    /// Accepts `input_tokens`/`output_tokens` and the `prompt_tokens`/
    /// `completion_tokens` aliases. Values that are not non-negative integers
    /// are treated as absent.
    pub fn from_payload(data: &Value) -> Self {
        let read = |keys: &[&str]| keys.iter().find_map(|k| data.get(*k).and_then(Value::as_u64));
        Self {
            input_tokens: read(&["input_tokens", "prompt_tokens"]),
            output_tokens: read(&["output_tokens", "completion_tokens"]),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.unwrap_or(0) == 0 && self.output_tokens.unwrap_or(0) == 0
    }
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    /// Adds `incoming` to `self` and returns the new totals.
    ///
    /// Pure and order-independent; counters saturate instead of wrapping.
    pub fn aggregate(self, incoming: UsageDelta) -> Self {
        Self {
            input_tokens: self
                .input_tokens
                .saturating_add(incoming.input_tokens.unwrap_or(0)),
            output_tokens: self
                .output_tokens
                .saturating_add(incoming.output_tokens.unwrap_or(0)),
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn two_events_aggregate_field_wise() {
        let totals = TokenUsage::default()
            .aggregate(UsageDelta::new(10, 5))
            .aggregate(UsageDelta::new(3, 2));
        assert_eq!(totals, TokenUsage::new(13, 7));
    }

    #[test]
    fn aggregation_is_order_independent() {
        let a = UsageDelta::new(4, 1);
        let b = UsageDelta::new(7, 9);
        let start = TokenUsage::new(1, 1);
        assert_eq!(start.aggregate(a).aggregate(b), start.aggregate(b).aggregate(a));
    }

    #[test]
    fn missing_fields_contribute_zero() {
        let delta = UsageDelta::from_payload(&json!({"input_tokens": 12}));
        assert_eq!(delta.output_tokens, None);
        assert_eq!(TokenUsage::default().aggregate(delta), TokenUsage::new(12, 0));
    }

    #[test]
    fn payload_aliases_and_bad_values() {
        let delta = UsageDelta::from_payload(&json!({
            "prompt_tokens": 8,
            "completion_tokens": -3,
        }));
        assert_eq!(delta.input_tokens, Some(8));
        assert_eq!(delta.output_tokens, None);

        let delta = UsageDelta::from_payload(&json!({"input_tokens": "many"}));
        assert!(delta.is_empty());
    }

    #[test]
    fn counters_saturate() {
        let totals = TokenUsage::new(u64::MAX - 1, 0).aggregate(UsageDelta::new(5, 0));
        assert_eq!(totals.input_tokens, u64::MAX);
    }
}
