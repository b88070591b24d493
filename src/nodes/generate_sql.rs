//! Generate-SQL node: one-shot structured SQL generation from the built
//! context (the naive path; agent mode replaces this with the tool loop).

use serde_json::json;

use super::{call_llm, extract_sql};
use crate::actors::llm_gateway_actor::ModelPurpose;
use crate::graph::state::{AgentState, StateUpdate};
use crate::graph::{NodeContext, NodeOutcome};
use crate::multi_turn::token_manager::TokenManager;
use crate::protocol::ChatMessage;

pub async fn run(state: &AgentState, ctx: &NodeContext) -> Result<NodeOutcome, String> {
    let context = state
        .context_output
        .as_ref()
        .ok_or_else(|| "No context available for generation".to_string())?;

    let mut messages = vec![ChatMessage::system(context.system_prompt.clone())];

    if !state.conversation_history.is_empty() {
        let manager = TokenManager::default();
        let (summary, recent) = manager
            .prepare_history(
                &state.conversation_history,
                context.total_tokens,
                Some(&ctx.llm_tx),
            )
            .await;
        messages.extend(TokenManager::build_history_messages(
            summary.as_deref(),
            &recent,
        ));
    }

    messages.push(ChatMessage::user(context.user_prompt.clone()));

    let schema = json!({
        "type": "object",
        "title": "SqlResponse",
        "properties": {
            "sql": { "type": "string" }
        },
        "required": ["sql"]
    });

    let response = call_llm(
        ctx,
        ModelPurpose::Generation,
        messages,
        None,
        Some(schema),
        None,
    )
    .await;

    let update = match response {
        Ok(response) => {
            let sql = response
                .structured
                .as_ref()
                .and_then(|v| v.get("sql"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .or_else(|| extract_sql(&response.content));

            match sql {
                Some(sql) => StateUpdate {
                    generated_sql: Some(Some(sql)),
                    validation_passed: Some(false),
                    validation_result: Some(None),
                    ..Default::default()
                },
                None => StateUpdate {
                    error: Some(Some("Model produced no SQL".to_string())),
                    generated_sql: Some(None),
                    ..Default::default()
                },
            }
        }
        Err(e) => StateUpdate {
            error: Some(Some(e)),
            generated_sql: Some(None),
            ..Default::default()
        },
    };

    Ok(NodeOutcome::Update(update))
}
