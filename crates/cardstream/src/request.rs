//! Request bodies sent to the prompt endpoint.

use serde_json::Value;

use crate::entity::Entity;
use crate::session::SessionId;

/// Instruction sent by a "generate more" turn.
pub const GENERATE_MORE_PROMPT: &str = "Give me some additional ones, in the same JSON format. Do not repeat any of the ones you already told me about, come up with new ideas.\n\n\n\nOnly return JSON, nothing else.\n";

/// Context the user attached to a turn.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContextSelection {
    /// Named context resolved by the backend.
    KnowledgePack(String),
    /// Context written by the user; only its summary is sent.
    UserDefined { title: String, summary: String },
}

/// Body of a prompt request. Absent fields are omitted from the JSON.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConversationRequest {
    pub userinput: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promptid: Option<String>,
    #[serde(rename = "chatSessionId", skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<SessionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub contexts: Vec<String>,
    #[serde(rename = "userContext", skip_serializing_if = "Option::is_none")]
    pub user_context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenarios: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_promptid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<bool>,
}

impl ConversationRequest {
    /// Plain request carrying only the user input.
    pub fn new(userinput: impl Into<String>) -> Self {
        Self {
            userinput: userinput.into(),
            ..Self::default()
        }
    }

    /// First card-building turn for a prompt.
    pub fn first_turn(userinput: impl Into<String>, prompt_id: impl Into<String>) -> Self {
        Self::new(userinput).prompt_id(prompt_id)
    }

    /// Chat continuation. The conversation id is attached when the turn
    /// starts.
    pub fn chat(userinput: impl Into<String>) -> Self {
        Self::new(userinput)
    }

    /// Asks for more items in the format of the previous answer.
    pub fn generate_more() -> Self {
        Self {
            json: Some(true),
            ..Self::new(GENERATE_MORE_PROMPT)
        }
    }

    /// Follow-up prompt run over the current cards.
    ///
    /// Cards flagged `exclude: true` are left out.
    pub fn follow_up(
        first_input: &str,
        query: &str,
        follow_up_id: impl Into<String>,
        previous_prompt_id: impl Into<String>,
        entities: &[Entity],
    ) -> Self {
        let scenarios = entities
            .iter()
            .filter(|entity| !entity.is_excluded())
            .map(Entity::to_scenario_json)
            .collect();
        Self {
            scenarios: Some(scenarios),
            previous_promptid: Some(previous_prompt_id.into()),
            ..Self::new(format!("{first_input} {query}")).prompt_id(follow_up_id)
        }
    }

    pub fn prompt_id(mut self, prompt_id: impl Into<String>) -> Self {
        self.promptid = Some(prompt_id.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn document(mut self, document: impl Into<String>) -> Self {
        self.document = Some(document.into());
        self
    }

    /// Attaches selected contexts.
    ///
    /// User-defined summaries are joined with a blank line into
    /// `userContext`; knowledge-pack names go to `contexts`.
    pub fn with_contexts(mut self, selections: &[ContextSelection]) -> Self {
        let summaries: Vec<&str> = selections
            .iter()
            .filter_map(|selection| match selection {
                ContextSelection::UserDefined { summary, .. } => Some(summary.as_str()),
                ContextSelection::KnowledgePack(_) => None,
            })
            .collect();
        if !summaries.is_empty() {
            self.user_context = Some(summaries.join("\n\n"));
        }
        self.contexts.extend(selections.iter().filter_map(|selection| match selection {
            ContextSelection::KnowledgePack(name) => Some(name.clone()),
            ContextSelection::UserDefined { .. } => None,
        }));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_turn_omits_absent_fields() {
        let body = serde_json::to_value(ConversationRequest::first_turn("retail banking", "cards-1"))
            .expect("serialize");
        assert_eq!(body, json!({"userinput": "retail banking", "promptid": "cards-1"}));
    }

    #[test]
    fn generate_more_requests_json() {
        let mut request = ConversationRequest::generate_more();
        request.chat_session_id = Some(SessionId::new("chat-7"));
        let body = serde_json::to_value(&request).expect("serialize");
        assert_eq!(body["json"], json!(true));
        assert_eq!(body["chatSessionId"], json!("chat-7"));
        assert!(body.get("promptid").is_none());
        assert!(body["userinput"].as_str().is_some_and(|s| s.ends_with("Only return JSON, nothing else.\n")));
    }

    #[test]
    fn follow_up_skips_excluded_cards() {
        let entities = vec![
            Entity::default().with("title", "A").with("summary", "first"),
            Entity::default().with("title", "B").with("exclude", true),
        ];
        let request = ConversationRequest::follow_up("banking", "what risks?", "risks", "cards-1", &entities);
        let body = serde_json::to_value(&request).expect("serialize");
        assert_eq!(body["userinput"], json!("banking what risks?"));
        assert_eq!(body["promptid"], json!("risks"));
        assert_eq!(body["previous_promptid"], json!("cards-1"));
        assert_eq!(body["scenarios"], json!([{"title": "A", "content": "first"}]));
    }

    #[test]
    fn contexts_are_split_by_kind() {
        let request = ConversationRequest::new("q").with_contexts(&[
            ContextSelection::UserDefined {
                title: "one".into(),
                summary: "alpha".into(),
            },
            ContextSelection::KnowledgePack("architecture".into()),
            ContextSelection::UserDefined {
                title: "two".into(),
                summary: "beta".into(),
            },
        ]);
        let body = serde_json::to_value(&request).expect("serialize");
        assert_eq!(body["userContext"], json!("alpha\n\nbeta"));
        assert_eq!(body["contexts"], json!(["architecture"]));
    }
}
