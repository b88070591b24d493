//! Request building for the LLM gateway.
//!
//! Every supported provider is addressed through its OpenAI-compatible
//! chat-completions endpoint, so one request shape serves all of them.
//! Provider selection follows availability priority:
//! Google > Anthropic > OpenAI-compatible > Ollama.

use serde_json::{json, Value};

use crate::protocol::{ChatMessage, Role, ToolSpec};
use crate::settings::LlmSettings;

const GOOGLE_OPENAI_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
const ANTHROPIC_OPENAI_BASE: &str = "https://api.anthropic.com/v1";
const OPENAI_BASE: &str = "https://api.openai.com/v1";
const OLLAMA_DEFAULT_BASE: &str = "http://localhost:11434/v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Google,
    Anthropic,
    OpenAiCompatible,
    Ollama,
}

impl Provider {
    pub fn name(&self) -> &'static str {
        match self {
            Provider::Google => "google",
            Provider::Anthropic => "anthropic",
            Provider::OpenAiCompatible => "openai",
            Provider::Ollama => "ollama",
        }
    }
}

/// A resolved provider endpoint.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub provider: Provider,
    pub base_url: String,
    pub api_key: Option<String>,
}

impl ResolvedEndpoint {
    pub fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Pick the provider by credential availability.
pub fn select_endpoint(llm: &LlmSettings) -> Result<ResolvedEndpoint, String> {
    if let Some(key) = non_empty(&llm.google_api_key) {
        return Ok(ResolvedEndpoint {
            provider: Provider::Google,
            base_url: GOOGLE_OPENAI_BASE.to_string(),
            api_key: Some(key),
        });
    }
    if let Some(key) = non_empty(&llm.anthropic_api_key) {
        return Ok(ResolvedEndpoint {
            provider: Provider::Anthropic,
            base_url: ANTHROPIC_OPENAI_BASE.to_string(),
            api_key: Some(key),
        });
    }
    if let Some(key) = non_empty(&llm.openai_api_key) {
        return Ok(ResolvedEndpoint {
            provider: Provider::OpenAiCompatible,
            base_url: llm
                .openai_api_base
                .clone()
                .filter(|b| !b.trim().is_empty())
                .unwrap_or_else(|| OPENAI_BASE.to_string()),
            api_key: Some(key),
        });
    }
    if let Some(base) = non_empty(&llm.ollama_base_url) {
        return Ok(ResolvedEndpoint {
            provider: Provider::Ollama,
            base_url: base,
            api_key: None,
        });
    }
    // A bare localhost Ollama is the last resort.
    Ok(ResolvedEndpoint {
        provider: Provider::Ollama,
        base_url: OLLAMA_DEFAULT_BASE.to_string(),
        api_key: None,
    })
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.trim().is_empty())
}

/// Pick the model name by purpose. Planning uses a distinct model only when
/// one is configured.
pub fn model_for_purpose(llm: &LlmSettings, planning: bool) -> String {
    if planning {
        if let Some(model) = non_empty(&llm.model_planning) {
            return model;
        }
    }
    llm.model.clone()
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn message_to_json(message: &ChatMessage) -> Value {
    let mut obj = json!({
        "role": role_str(message.role),
        "content": message.content,
    });

    if let Some(calls) = &message.tool_calls {
        let rendered: Vec<Value> = calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id.clone().unwrap_or_else(|| "call_0".to_string()),
                    "type": "function",
                    "function": {
                        "name": call.name,
                        "arguments": serde_json::to_string(&call.arguments)
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                })
            })
            .collect();
        obj["tool_calls"] = Value::Array(rendered);
    }

    if let Some(id) = &message.tool_call_id {
        obj["tool_call_id"] = Value::String(id.clone());
    }

    obj
}

/// Build a chat-completions request body.
pub fn build_request_body(
    model: &str,
    messages: &[ChatMessage],
    tools: Option<&[ToolSpec]>,
    response_schema: Option<&Value>,
    temperature: f32,
    stream: bool,
) -> Value {
    let mut body = json!({
        "model": model,
        "messages": messages.iter().map(message_to_json).collect::<Vec<_>>(),
        "temperature": temperature,
        "stream": stream,
    });

    if let Some(tools) = tools {
        if !tools.is_empty() {
            let rendered: Vec<Value> = tools
                .iter()
                .map(|tool| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                        },
                    })
                })
                .collect();
            body["tools"] = Value::Array(rendered);
        }
    }

    if let Some(schema) = response_schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": "structured_output",
                "schema": schema,
            },
        });
    }

    body
}
