//! LLM Gateway Actor - provider-agnostic chat.
//!
//! This actor handles:
//! - Chat requests with optional tools and structured-output schemas
//! - SSE streaming with per-token forwarding and cooperative cancellation
//! - Native tool-call delta reassembly
//!
//! Purpose selects the model: `Planning` uses a distinct model only when one
//! is configured, otherwise the generation model serves both. Retries are
//! the caller's responsibility; the gateway only reassembles argument
//! chunks.

use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};

use super::llm_gateway::{
    build_request_body, extract_stream_text, model_for_purpose, normalize_content,
    select_endpoint, StreamingToolCalls,
};
use crate::protocol::{ChatMessage, ParsedToolCall, ToolSpec};
use crate::settings::LlmSettings;

/// What the call is for; selects model and timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelPurpose {
    Generation,
    Planning,
}

/// The gateway's answer to one chat request.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub content: String,
    pub tool_calls: Vec<ParsedToolCall>,
    /// Parsed structured value when a response schema was supplied.
    pub structured: Option<Value>,
}

/// A canned reply for the scripted backend.
#[derive(Debug, Clone, Default)]
pub struct ScriptedReply {
    pub content: String,
    pub tool_calls: Vec<ParsedToolCall>,
    pub structured: Option<Value>,
    /// When set, the scripted call fails with this error instead.
    pub error: Option<String>,
}

/// Messages for the LLM Gateway Actor.
pub enum LlmMsg {
    Chat {
        purpose: ModelPurpose,
        messages: Vec<ChatMessage>,
        tools: Option<Vec<ToolSpec>>,
        response_schema: Option<Value>,
        /// Streaming sink; tokens are forwarded one at a time.
        token_tx: Option<mpsc::UnboundedSender<String>>,
        cancel_rx: Option<watch::Receiver<bool>>,
        respond_to: oneshot::Sender<Result<LlmResponse, String>>,
    },
}

impl std::fmt::Debug for LlmMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LlmMsg::Chat { purpose, messages, .. } => f
                .debug_struct("Chat")
                .field("purpose", purpose)
                .field("messages", &messages.len())
                .finish(),
        }
    }
}

/// Which implementation answers chat requests.
#[derive(Clone)]
pub enum LlmBackend {
    Http,
    /// Replies served in order from a shared queue (tests, dry runs).
    Scripted(Arc<Mutex<VecDeque<ScriptedReply>>>),
}

/// LLM Gateway Actor.
pub struct LlmGatewayActor {
    rx: mpsc::Receiver<LlmMsg>,
    settings: LlmSettings,
    backend: LlmBackend,
    http_client: reqwest::Client,
}

impl LlmGatewayActor {
    pub fn new(rx: mpsc::Receiver<LlmMsg>, settings: LlmSettings, backend: LlmBackend) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("http client");
        Self {
            rx,
            settings,
            backend,
            http_client,
        }
    }

    /// Run the actor's message loop. Each chat is served on its own task so
    /// concurrent sessions do not serialize behind one slow provider call.
    pub async fn run(mut self) {
        println!("[LlmGateway] Started");

        while let Some(msg) = self.rx.recv().await {
            let settings = self.settings.clone();
            let backend = self.backend.clone();
            let client = self.http_client.clone();

            tokio::spawn(async move {
                match msg {
                    LlmMsg::Chat {
                        purpose,
                        messages,
                        tools,
                        response_schema,
                        token_tx,
                        cancel_rx,
                        respond_to,
                    } => {
                        let result = match &backend {
                            LlmBackend::Scripted(queue) => {
                                scripted_chat(queue, &response_schema, &token_tx)
                            }
                            LlmBackend::Http => {
                                http_chat(
                                    &client,
                                    &settings,
                                    purpose,
                                    &messages,
                                    tools.as_deref(),
                                    response_schema.as_ref(),
                                    &token_tx,
                                    cancel_rx,
                                )
                                .await
                            }
                        };
                        let _ = respond_to.send(result);
                    }
                }
            });
        }

        println!("[LlmGateway] Stopped");
    }
}

// ============ Scripted Backend ============

fn scripted_chat(
    queue: &Arc<Mutex<VecDeque<ScriptedReply>>>,
    response_schema: &Option<Value>,
    token_tx: &Option<mpsc::UnboundedSender<String>>,
) -> Result<LlmResponse, String> {
    let reply = {
        let mut guard = queue.lock().expect("scripted queue poisoned");
        guard.pop_front()
    }
    .ok_or_else(|| "Scripted LLM has no more replies".to_string())?;

    if let Some(error) = reply.error {
        return Err(error);
    }

    if let Some(tx) = token_tx {
        // Word-level chunks exercise the streaming consumers.
        for chunk in reply.content.split_inclusive(' ') {
            let _ = tx.send(chunk.to_string());
        }
    }

    let structured = if response_schema.is_some() {
        reply
            .structured
            .clone()
            .or_else(|| parse_structured_content(&reply.content))
    } else {
        None
    };

    Ok(LlmResponse {
        content: reply.content,
        tool_calls: reply.tool_calls,
        structured,
    })
}

// ============ HTTP Backend ============

#[allow(clippy::too_many_arguments)]
async fn http_chat(
    client: &reqwest::Client,
    settings: &LlmSettings,
    purpose: ModelPurpose,
    messages: &[ChatMessage],
    tools: Option<&[ToolSpec]>,
    response_schema: Option<&Value>,
    token_tx: &Option<mpsc::UnboundedSender<String>>,
    cancel_rx: Option<watch::Receiver<bool>>,
) -> Result<LlmResponse, String> {
    let endpoint = select_endpoint(settings)?;
    let model = model_for_purpose(settings, purpose == ModelPurpose::Planning);
    let timeout = match purpose {
        ModelPurpose::Generation => settings.request_timeout_secs,
        ModelPurpose::Planning => settings.planning_timeout_secs,
    };

    let streaming = token_tx.is_some();
    let body = build_request_body(
        &model,
        messages,
        tools,
        response_schema,
        settings.temperature,
        streaming,
    );

    println!(
        "[LlmGateway] {} request: provider={}, model={}, streaming={}",
        match purpose {
            ModelPurpose::Generation => "generation",
            ModelPurpose::Planning => "planning",
        },
        endpoint.provider.name(),
        model,
        streaming
    );

    let mut request = client
        .post(endpoint.chat_url())
        .timeout(Duration::from_secs(timeout))
        .json(&body);
    if let Some(key) = &endpoint.api_key {
        request = request.bearer_auth(key);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            format!("{} timed out after {}s", endpoint.provider.name(), timeout)
        } else {
            format!("{} unreachable: {}", endpoint.provider.name(), e)
        }
    })?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(format!(
            "{} HTTP {}: {}",
            endpoint.provider.name(),
            status,
            text
        ));
    }

    let mut result = if streaming {
        stream_response(response, token_tx.as_ref().expect("streaming sink"), cancel_rx).await?
    } else {
        parse_complete_response(response).await?
    };

    if let Some(schema) = response_schema {
        let structured = parse_structured_content(&result.content).ok_or_else(|| {
            format!(
                "structured output did not match schema {}: {}",
                schema
                    .get("title")
                    .and_then(|t| t.as_str())
                    .unwrap_or("object"),
                truncate(&result.content, 200)
            )
        })?;
        result.structured = Some(structured);
    }

    Ok(result)
}

async fn parse_complete_response(response: reqwest::Response) -> Result<LlmResponse, String> {
    let payload: Value = response
        .json()
        .await
        .map_err(|e| format!("Invalid provider JSON: {}", e))?;

    let message = &payload["choices"][0]["message"];
    let content = normalize_content(&message["content"]);

    let mut tool_calls = Vec::new();
    if let Some(calls) = message["tool_calls"].as_array() {
        for call in calls {
            let name = call["function"]["name"].as_str().unwrap_or_default();
            if name.is_empty() {
                continue;
            }
            let args_raw = call["function"]["arguments"].as_str().unwrap_or("{}");
            let arguments: Value = serde_json::from_str(args_raw)
                .unwrap_or_else(|_| serde_json::json!({ "sql": args_raw }));
            tool_calls.push(ParsedToolCall {
                name: name.to_string(),
                arguments,
                id: call["id"].as_str().map(|s| s.to_string()),
            });
        }
    }

    Ok(LlmResponse {
        content,
        tool_calls,
        structured: None,
    })
}

async fn stream_response(
    mut response: reqwest::Response,
    token_tx: &mpsc::UnboundedSender<String>,
    cancel_rx: Option<watch::Receiver<bool>>,
) -> Result<LlmResponse, String> {
    enum Step {
        Chunk(Option<Vec<u8>>),
        StreamErr(String),
        Cancelled,
        CancelClosed,
    }

    fn chunk_step(chunk: Result<Option<impl AsRef<[u8]>>, reqwest::Error>) -> Step {
        match chunk {
            Ok(Some(bytes)) => Step::Chunk(Some(bytes.as_ref().to_vec())),
            Ok(None) => Step::Chunk(None),
            Err(e) if e.is_timeout() => Step::StreamErr("stream timed out".to_string()),
            Err(e) => Step::StreamErr(format!("stream error: {}", e)),
        }
    }

    let mut buffer = String::new();
    let mut content = String::new();
    let mut streaming_tool_calls = StreamingToolCalls::default();
    let mut cancel_rx = cancel_rx;

    'stream_loop: loop {
        let step = if let Some(cancel) = cancel_rx.as_mut() {
            tokio::select! {
                biased;

                changed = cancel.changed() => {
                    match changed {
                        Ok(()) if *cancel.borrow() => Step::Cancelled,
                        Ok(()) => continue 'stream_loop,
                        Err(_) => Step::CancelClosed,
                    }
                }
                chunk = response.chunk() => chunk_step(chunk),
            }
        } else {
            chunk_step(response.chunk().await)
        };

        let chunk = match step {
            Step::Chunk(chunk) => chunk,
            Step::StreamErr(error) => return Err(error),
            Step::Cancelled => {
                println!("[LlmGateway] Stream cancelled by consumer");
                return Err("cancelled".to_string());
            }
            Step::CancelClosed => {
                // Sender dropped without cancelling; stop watching.
                cancel_rx = None;
                continue 'stream_loop;
            }
        };

        let chunk = match chunk {
            Some(chunk) => chunk,
            None => break 'stream_loop,
        };

        if let Ok(s) = String::from_utf8(chunk) {
            buffer.push_str(&s);

            while let Some(idx) = buffer.find('\n') {
                let line = buffer[..idx].to_string();
                buffer = buffer[idx + 1..].to_string();

                let trimmed = line.trim();
                if !trimmed.starts_with("data: ") {
                    continue;
                }
                let data = &trimmed["data: ".len()..];
                if data == "[DONE]" {
                    break 'stream_loop;
                }
                if let Ok(json) = serde_json::from_str::<Value>(data) {
                    if let Some(text) = extract_stream_text(&json) {
                        content.push_str(&text);
                        let _ = token_tx.send(text);
                    }
                    if let Some(tool_calls) =
                        json["choices"][0]["delta"]["tool_calls"].as_array()
                    {
                        streaming_tool_calls.process_delta(tool_calls);
                    }
                }
            }
        }
    }

    Ok(LlmResponse {
        content,
        tool_calls: streaming_tool_calls.into_parsed_calls(),
        structured: None,
    })
}

/// Parse a structured value out of model text: direct JSON, a fenced block,
/// or the first braced span.
pub fn parse_structured_content(content: &str) -> Option<Value> {
    let trimmed = content.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }

    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            if let Ok(value) = serde_json::from_str::<Value>(after[..end].trim()) {
                return Some(value);
            }
        }
    }

    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        serde_json::from_str::<Value>(&trimmed[start..=end]).ok()
    } else {
        None
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let prefix: String = text.chars().take(max_len).collect();
        format!("{}...", prefix)
    }
}

/// Convenience for tests and dry runs: a gateway channel answered by a
/// scripted actor.
pub fn spawn_scripted_gateway(replies: Vec<ScriptedReply>) -> mpsc::Sender<LlmMsg> {
    let (tx, rx) = mpsc::channel(32);
    let queue = Arc::new(Mutex::new(VecDeque::from(replies)));
    let actor = LlmGatewayActor::new(rx, LlmSettings::default(), LlmBackend::Scripted(queue));
    tokio::spawn(actor.run());
    tx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structured_direct_json() {
        let value = parse_structured_content(r#"{"needs_new_tables": true}"#).unwrap();
        assert_eq!(value["needs_new_tables"], true);
    }

    #[test]
    fn test_parse_structured_fenced_json() {
        let content = "Here is the plan:\n```json\n{\"suitable\": true}\n```\nDone.";
        let value = parse_structured_content(content).unwrap();
        assert_eq!(value["suitable"], true);
    }

    #[test]
    fn test_parse_structured_embedded_braces() {
        let content = "I think {\"is_clear\": false, \"reasoning\": \"two time columns\"} fits";
        let value = parse_structured_content(content).unwrap();
        assert_eq!(value["is_clear"], false);
    }

    #[test]
    fn test_parse_structured_rejects_prose() {
        assert!(parse_structured_content("no json here").is_none());
    }

    #[tokio::test]
    async fn test_scripted_gateway_streams_and_replies() {
        let tx = spawn_scripted_gateway(vec![ScriptedReply {
            content: "SELECT 1".to_string(),
            ..Default::default()
        }]);

        let (token_tx, mut token_rx) = mpsc::unbounded_channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(LlmMsg::Chat {
            purpose: ModelPurpose::Generation,
            messages: vec![ChatMessage::user("q")],
            tools: None,
            response_schema: None,
            token_tx: Some(token_tx),
            cancel_rx: None,
            respond_to: reply_tx,
        })
        .await
        .unwrap();

        let response = reply_rx.await.unwrap().unwrap();
        assert_eq!(response.content, "SELECT 1");

        let mut streamed = String::new();
        while let Ok(chunk) = token_rx.try_recv() {
            streamed.push_str(&chunk);
        }
        assert_eq!(streamed, "SELECT 1");
    }

    #[tokio::test]
    async fn test_scripted_gateway_exhaustion_errors() {
        let tx = spawn_scripted_gateway(vec![]);
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(LlmMsg::Chat {
            purpose: ModelPurpose::Planning,
            messages: vec![],
            tools: None,
            response_schema: None,
            token_tx: None,
            cancel_rx: None,
            respond_to: reply_tx,
        })
        .await
        .unwrap();

        assert!(reply_rx.await.unwrap().is_err());
    }
}
