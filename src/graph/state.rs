//! Typed agent-graph state and partial updates.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::actors::few_shot_actor::FewShotExample;
use crate::context::ContextOutput;
use crate::multi_turn::ConversationTurn;
use crate::retrieval::RetrievalResult;

/// Result of a validation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub details: Option<String>,
    pub error: Option<String>,
}

/// A lightweight table hint produced before full retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaHint {
    pub tables: Vec<SchemaHintTable>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaHintTable {
    pub name: String,
    pub score: f32,
    pub chinese_name: Option<String>,
    pub description: Option<String>,
}

/// The running state of one agent-graph execution. Serializable so a
/// suspension can checkpoint it verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentState {
    pub raw_query: String,
    pub clarified_query: Option<String>,
    pub clarification_questions: Option<Vec<String>>,
    /// Injected by resume; consumed by the clarify node.
    pub clarification_answer: Option<String>,
    pub schema_hint: Option<SchemaHint>,
    pub retrieval_result: Option<RetrievalResult>,
    pub context_output: Option<ContextOutput>,
    pub generated_sql: Option<String>,
    pub validation_result: Option<ValidationResult>,
    pub validation_passed: bool,
    pub retry_count: usize,
    pub error: Option<String>,
    pub db_name: Option<String>,
    pub conversation_history: Vec<ConversationTurn>,
    pub cached_context: Option<ContextOutput>,
    pub cached_retrieval: Option<RetrievalResult>,
    pub current_message_id: Option<String>,
    pub parent_message_id: Option<String>,
    pub needs_new_retrieval: bool,
    pub shift_reason: Option<String>,
    pub few_shot_examples: Vec<FewShotExample>,
}

impl AgentState {
    pub fn for_query(raw_query: impl Into<String>, db_name: Option<String>) -> Self {
        Self {
            raw_query: raw_query.into(),
            db_name,
            needs_new_retrieval: true,
            ..Default::default()
        }
    }

    /// The query actually used downstream of clarification.
    pub fn effective_query(&self) -> &str {
        self.clarified_query.as_deref().unwrap_or(&self.raw_query)
    }
}

/// A node's partial state update. Outer `None` keeps the field, inner
/// `None` clears it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateUpdate {
    pub clarified_query: Option<Option<String>>,
    pub clarification_questions: Option<Option<Vec<String>>>,
    pub clarification_answer: Option<Option<String>>,
    pub schema_hint: Option<Option<SchemaHint>>,
    pub retrieval_result: Option<Option<RetrievalResult>>,
    pub context_output: Option<Option<ContextOutput>>,
    pub generated_sql: Option<Option<String>>,
    pub validation_result: Option<Option<ValidationResult>>,
    pub validation_passed: Option<bool>,
    pub retry_count: Option<usize>,
    pub error: Option<Option<String>>,
    pub conversation_history: Option<Vec<ConversationTurn>>,
    pub cached_context: Option<Option<ContextOutput>>,
    pub cached_retrieval: Option<Option<RetrievalResult>>,
    pub current_message_id: Option<Option<String>>,
    pub needs_new_retrieval: Option<bool>,
    pub shift_reason: Option<Option<String>>,
    pub few_shot_examples: Option<Vec<FewShotExample>>,
}

impl StateUpdate {
    /// Merge this update into the running state.
    pub fn apply(self, state: &mut AgentState) {
        macro_rules! merge {
            ($field:ident) => {
                if let Some(value) = self.$field {
                    state.$field = value;
                }
            };
        }

        merge!(clarified_query);
        merge!(clarification_questions);
        merge!(clarification_answer);
        merge!(schema_hint);
        merge!(retrieval_result);
        merge!(context_output);
        merge!(generated_sql);
        merge!(validation_result);
        merge!(validation_passed);
        merge!(retry_count);
        merge!(error);
        merge!(conversation_history);
        merge!(cached_context);
        merge!(cached_retrieval);
        merge!(current_message_id);
        merge!(needs_new_retrieval);
        merge!(shift_reason);
        merge!(few_shot_examples);
    }
}

/// Whitelisted view of the state for streaming consumers. Retrieval and
/// context payloads collapse to summaries.
pub fn sanitize(state: &AgentState) -> Value {
    let mut out = serde_json::Map::new();

    if let Some(sql) = &state.generated_sql {
        out.insert("generated_sql".to_string(), json!(sql));
    }
    out.insert(
        "validation_passed".to_string(),
        json!(state.validation_passed),
    );
    if let Some(clarified) = &state.clarified_query {
        out.insert("clarified_query".to_string(), json!(clarified));
    }
    if let Some(questions) = &state.clarification_questions {
        out.insert("clarification_questions".to_string(), json!(questions));
    }
    if let Some(error) = &state.error {
        out.insert("error".to_string(), json!(error));
    }
    if let Some(reason) = &state.shift_reason {
        out.insert("shift_reason".to_string(), json!(reason));
    }

    if let Some(result) = &state.retrieval_result {
        out.insert(
            "retrieval_summary".to_string(),
            json!({
                "tables_count": result.tables.len(),
                "tables": result.tables.iter().take(10).collect::<Vec<_>>(),
            }),
        );
    }

    if let Some(context) = &state.context_output {
        out.insert(
            "context_summary".to_string(),
            json!({
                "total_tokens": context.total_tokens,
                "has_system_prompt": !context.system_prompt.is_empty(),
                "has_user_prompt": !context.user_prompt.is_empty(),
            }),
        );
    }

    Value::Object(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_merges_and_clears() {
        let mut state = AgentState::for_query("q", None);
        state.clarification_questions = Some(vec!["which?".to_string()]);

        let update = StateUpdate {
            clarified_query: Some(Some("q clarified".to_string())),
            clarification_questions: Some(None),
            validation_passed: Some(true),
            ..Default::default()
        };
        update.apply(&mut state);

        assert_eq!(state.clarified_query.as_deref(), Some("q clarified"));
        assert!(state.clarification_questions.is_none());
        assert!(state.validation_passed);
        // Untouched fields survive.
        assert_eq!(state.raw_query, "q");
    }

    #[test]
    fn test_effective_query_prefers_clarified() {
        let mut state = AgentState::for_query("raw", None);
        assert_eq!(state.effective_query(), "raw");
        state.clarified_query = Some("clarified".to_string());
        assert_eq!(state.effective_query(), "clarified");
    }

    #[test]
    fn test_sanitize_hides_prompts() {
        let mut state = AgentState::for_query("q", None);
        state.generated_sql = Some("SELECT 1".to_string());
        state.retrieval_result = Some(RetrievalResult {
            tables: vec!["patient".to_string()],
            ..Default::default()
        });
        state.context_output = Some(ContextOutput {
            system_prompt: "secret schema dump".to_string(),
            user_prompt: "user prompt".to_string(),
            total_tokens: 42,
            metadata: json!({}),
        });

        let sanitized = sanitize(&state);
        assert_eq!(sanitized["generated_sql"], "SELECT 1");
        assert_eq!(sanitized["retrieval_summary"]["tables_count"], 1);
        assert_eq!(sanitized["context_summary"]["total_tokens"], 42);
        assert!(sanitized.get("context_output").is_none());
        assert!(!sanitized.to_string().contains("secret schema dump"));
    }

    #[test]
    fn test_state_roundtrips_through_json() {
        let mut state = AgentState::for_query("q", Some("medical".to_string()));
        state.retry_count = 2;
        state.validation_passed = true;

        let json = serde_json::to_value(&state).unwrap();
        let restored: AgentState = serde_json::from_value(json).unwrap();
        assert_eq!(restored.raw_query, "q");
        assert_eq!(restored.retry_count, 2);
        assert!(restored.validation_passed);
    }
}
