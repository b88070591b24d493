//! Shared wire types: chat messages, tool calls, streaming event payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============ Chat Messages ============

/// Role of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in an LLM conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    /// Tool calls the assistant issued (assistant messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ParsedToolCall>>,
    /// Id of the tool call this message responds to (tool messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        calls: Vec<ParsedToolCall>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls: Some(calls),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

// ============ Tool Calling ============

/// Specification of a tool offered to the model (OpenAI function shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object.
    pub parameters: Value,
}

/// A tool call reassembled from the model response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParsedToolCall {
    pub name: String,
    pub arguments: Value,
    /// Native tool call id used to match results with their calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

// ============ Streaming Events ============

/// Server-sent events emitted while a query runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    Start { session_id: String },
    /// Sanitized partial state after a node finished.
    StateUpdate(Value),
    Token { iteration: usize, content: String },
    AgentProgress(AgentProgressEvent),
    Complete(Value),
    Error { error: String },
}

/// What the SQL agent is doing inside its inner loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProgressEvent {
    pub iteration: usize,
    pub action: AgentAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_preview: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_preview: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentAction {
    Thinking,
    ToolStart,
    ToolEnd,
    ThoughtComplete,
    ForceValidation,
}

// ============ Clarification ============

/// Payload carried by the clarify node's cooperative suspend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub question: String,
    pub raw_query: String,
}

impl ClarificationPayload {
    pub fn new(questions: &[String], raw_query: &str) -> Self {
        let question_text = questions
            .iter()
            .map(|q| format!("- {}", q))
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            kind: "clarification".to_string(),
            question: format!(
                "To generate accurate SQL, please confirm the following:\n{}",
                question_text
            ),
            raw_query: raw_query.to_string(),
        }
    }
}

// ============ Execute API ============

/// Standalone SQL execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub sql: String,
    pub db_name: String,
    #[serde(default)]
    pub allow_mutation: bool,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_limit() -> usize {
    100
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecuteStatus {
    Success,
    Failed,
    Forbidden,
    Timeout,
}

/// Standalone SQL execution response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResponse {
    pub status: ExecuteStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Vec<Value>>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affected_rows: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecuteResponse {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecuteStatus::Failed,
            columns: None,
            rows: None,
            row_count: None,
            affected_rows: None,
            execution_time_ms: None,
            truncated: None,
            error: Some(error.into()),
        }
    }

    pub fn forbidden(error: impl Into<String>) -> Self {
        Self {
            status: ExecuteStatus::Forbidden,
            ..Self::failed(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_message_roles_serialize_lowercase() {
        let msg = ChatMessage::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("tool_calls").is_none());
    }

    #[test]
    fn test_stream_event_tagged_shape() {
        let event = StreamEvent::Token {
            iteration: 2,
            content: "SELECT".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "token");
        assert_eq!(json["data"]["iteration"], 2);
    }

    #[test]
    fn test_clarification_payload_renders_questions() {
        let payload = ClarificationPayload::new(
            &[
                "Which time column: create_time or visit_date?".to_string(),
                "Limit to active patients?".to_string(),
            ],
            "show recent visits",
        );
        assert_eq!(payload.kind, "clarification");
        assert!(payload.question.contains("visit_date"));
        assert!(payload.question.contains("- Limit to active patients?"));
        assert_eq!(payload.raw_query, "show recent visits");
    }

    #[test]
    fn test_execute_request_defaults() {
        let req: ExecuteRequest =
            serde_json::from_value(json!({"sql": "SELECT 1", "db_name": "medical"})).unwrap();
        assert!(!req.allow_mutation);
        assert_eq!(req.limit, 100);
        assert_eq!(req.timeout, 30);
    }
}
