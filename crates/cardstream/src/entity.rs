use serde_json::{Map, Value};

/// One structured output item (a card or scenario).
///
/// Fields keep the order in which the model emitted them.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Entity {
    fields: Map<String, Value>,
}

impl Entity {
    /// Creates an entity from an ordered field map.
    pub fn from_fields(fields: Map<String, Value>) -> Self {
        Self { fields }
    }

    /// Builder-style field insertion.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    pub fn title(&self) -> Option<&str> {
        self.field("title").and_then(Value::as_str)
    }

    pub fn summary(&self) -> Option<&str> {
        self.field("summary").and_then(Value::as_str)
    }

    /// Caller-assigned stable identifier, if any.
    pub fn id(&self) -> Option<&Value> {
        self.field("id")
    }

    /// Whether the user excluded this card from follow-up prompts.
    pub fn is_excluded(&self) -> bool {
        self.field("exclude").and_then(Value::as_bool) == Some(true)
    }

    /// Renders the card as plain text for copying or pinning.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        if let Some(title) = self.title() {
            out.push_str("## ");
            out.push_str(title);
            out.push_str("\n\n");
        }
        if let Some(summary) = self.summary() {
            out.push_str(summary);
            out.push_str("\n\n");
        }
        for (name, value) in &self.fields {
            if matches!(name.as_str(), "title" | "summary" | "id" | "exclude") {
                continue;
            }
            let rendered = match value {
                Value::String(s) => s.clone(),
                Value::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Value::String(s) => format!("- {s}"),
                        other => format!("- {other}"),
                    })
                    .collect::<Vec<_>>()
                    .join("\n"),
                Value::Null => continue,
                other => other.to_string(),
            };
            out.push_str(&format!("**{name}**: {rendered}\n"));
        }
        out.trim_end().to_string()
    }

    /// Shape sent back to the backend in follow-up requests:
    /// `{title, content}` plus nested `scenarios`.
    pub fn to_scenario_json(&self) -> Value {
        let mut out = Map::new();
        out.insert(
            "title".into(),
            Value::String(self.title().unwrap_or_default().to_string()),
        );
        out.insert(
            "content".into(),
            Value::String(self.summary().unwrap_or_default().to_string()),
        );
        if let Some(nested) = self.field("scenarios").and_then(Value::as_array) {
            let nested = nested
                .iter()
                .filter_map(|v| Entity::try_from(v.clone()).ok())
                .map(|e| e.to_scenario_json())
                .collect();
            out.insert("scenarios".into(), Value::Array(nested));
        }
        Value::Object(out)
    }
}

impl TryFrom<Value> for Entity {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(other),
        }
    }
}
