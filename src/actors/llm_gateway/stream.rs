//! Stream handling for chat-completions responses.
//!
//! This module handles:
//! - Accumulating OpenAI-style streaming tool calls
//! - Extracting text deltas from streaming chunks, normalizing list-shaped
//!   content parts to concatenated text

use serde_json::Value;
use std::collections::HashMap;

use crate::protocol::ParsedToolCall;

/// Accumulator for OpenAI-style streaming tool calls.
///
/// Tool calls arrive incrementally: the first chunk carries `id` and
/// `function.name`, later chunks carry `function.arguments` fragments.
/// Multiple calls are indexed by their `index` field.
#[derive(Default)]
pub struct StreamingToolCalls {
    /// Map of index -> (id, name, accumulated_arguments)
    calls: HashMap<usize, (String, String, String)>,
}

impl StreamingToolCalls {
    /// Process a `delta.tool_calls` array from a streaming chunk.
    pub fn process_delta(&mut self, tool_calls: &[Value]) {
        for tc in tool_calls {
            let index = tc["index"].as_u64().unwrap_or(0) as usize;
            let entry = self
                .calls
                .entry(index)
                .or_insert_with(|| (String::new(), String::new(), String::new()));

            if let Some(id) = tc["id"].as_str() {
                entry.0 = id.to_string();
            }
            if let Some(name) = tc["function"]["name"].as_str() {
                entry.1 = name.to_string();
            }
            if let Some(args) = tc["function"]["arguments"].as_str() {
                entry.2.push_str(args);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Convert accumulated tool calls to `ParsedToolCall`s in index order.
    pub fn into_parsed_calls(self) -> Vec<ParsedToolCall> {
        let mut indexed: Vec<_> = self.calls.into_iter().collect();
        indexed.sort_by_key(|(idx, _)| *idx);

        let mut result = Vec::new();
        for (idx, (id, name, arguments_str)) in indexed {
            if name.is_empty() {
                continue;
            }

            let arguments = if arguments_str.is_empty() {
                Value::Object(serde_json::Map::new())
            } else {
                serde_json::from_str(&arguments_str).unwrap_or_else(|e| {
                    println!(
                        "[StreamingToolCalls] Failed to parse arguments for {}: {}",
                        name, e
                    );
                    // A bare SQL string is the common malformation.
                    serde_json::json!({ "sql": arguments_str })
                })
            };

            result.push(ParsedToolCall {
                name,
                arguments,
                id: if id.is_empty() {
                    Some(format!("call_{}", idx))
                } else {
                    Some(id)
                },
            });
        }

        result
    }
}

/// Extract streamed text from a chat-completions chunk.
///
/// `delta.content` may be a plain string or a provider-specific list of
/// parts; lists are normalized to concatenated text.
pub fn extract_stream_text(json: &Value) -> Option<String> {
    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("delta"))
        .and_then(|d| d.get("content"))?;

    if let Some(text) = content.as_str() {
        if !text.is_empty() {
            return Some(text.to_string());
        }
        return None;
    }

    if let Some(parts) = content.as_array() {
        let mut buf = String::new();
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                buf.push_str(text);
            } else if let Some(text) = part.as_str() {
                buf.push_str(text);
            }
        }
        if !buf.is_empty() {
            return Some(buf);
        }
    }

    None
}

/// Normalize a non-streaming message `content` value to plain text.
pub fn normalize_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| {
                part.get("text")
                    .and_then(|t| t.as_str())
                    .map(|s| s.to_string())
                    .or_else(|| part.as_str().map(|s| s.to_string()))
                    .unwrap_or_default()
            })
            .collect(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_text_string_delta() {
        let payload = json!({"choices":[{"delta":{"content":"hello"}}]});
        assert_eq!(extract_stream_text(&payload).as_deref(), Some("hello"));
    }

    #[test]
    fn test_extract_text_list_delta_normalized() {
        let payload =
            json!({"choices":[{"delta":{"content":[{"text":"SEL"},{"text":"ECT"}]}}]});
        assert_eq!(extract_stream_text(&payload).as_deref(), Some("SELECT"));
    }

    #[test]
    fn test_extract_text_empty_is_none() {
        let payload = json!({"choices":[{"delta":{"content":""}}]});
        assert!(extract_stream_text(&payload).is_none());
    }

    #[test]
    fn test_tool_call_accumulation_across_chunks() {
        let mut acc = StreamingToolCalls::default();
        acc.process_delta(&[
            json!({"index": 0, "id": "call_abc", "function": {"name": "validate_sql", "arguments": "{\"sql\": \"SEL"}}),
        ]);
        acc.process_delta(&[
            json!({"index": 0, "function": {"arguments": "ECT 1\"}"}}),
        ]);

        let calls = acc.into_parsed_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "validate_sql");
        assert_eq!(calls[0].arguments["sql"], "SELECT 1");
        assert_eq!(calls[0].id.as_deref(), Some("call_abc"));
    }

    #[test]
    fn test_multiple_tool_calls_ordered_by_index() {
        let mut acc = StreamingToolCalls::default();
        acc.process_delta(&[
            json!({"index": 1, "id": "b", "function": {"name": "second", "arguments": "{}"}}),
            json!({"index": 0, "id": "a", "function": {"name": "first", "arguments": "{}"}}),
        ]);

        let calls = acc.into_parsed_calls();
        assert_eq!(calls[0].name, "first");
        assert_eq!(calls[1].name, "second");
    }

    #[test]
    fn test_malformed_arguments_fall_back_to_sql_wrapper() {
        let mut acc = StreamingToolCalls::default();
        acc.process_delta(&[
            json!({"index": 0, "id": "c", "function": {"name": "validate_sql", "arguments": "SELECT 1"}}),
        ]);

        let calls = acc.into_parsed_calls();
        assert_eq!(calls[0].arguments["sql"], "SELECT 1");
    }
}
