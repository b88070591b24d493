//! Shift-detect node: does a follow-up question need new schema retrieval,
//! or can the cached context serve it?
//!
//! Decision order: missing cache wins, then the LLM's judgment, and any
//! detection failure conservatively forces a new retrieval.

use serde_json::json;

use super::call_llm;
use crate::actors::llm_gateway_actor::ModelPurpose;
use crate::graph::state::{AgentState, StateUpdate};
use crate::graph::{NodeContext, NodeOutcome};
use crate::multi_turn::ConversationTurn;
use crate::protocol::ChatMessage;

fn format_history(history: &[ConversationTurn]) -> String {
    if history.is_empty() {
        return "(no prior turns)".to_string();
    }

    history
        .iter()
        .rev()
        .take(3)
        .rev()
        .map(|turn| {
            let sql = turn.sql.as_deref().unwrap_or("N/A");
            let sql_preview: String = sql.chars().take(100).collect();
            format!(
                "Q: {}\nTables: {}\nSQL: {}...",
                turn.question,
                turn.tables_used.join(", "),
                sql_preview
            )
        })
        .collect::<Vec<_>>()
        .join("\n---\n")
}

pub async fn run(state: &AgentState, ctx: &NodeContext) -> Result<NodeOutcome, String> {
    let cached = match &state.cached_retrieval {
        Some(cached) => cached,
        None => {
            println!("[ShiftDetect] No cached context, full retrieval required");
            return Ok(NodeOutcome::Update(StateUpdate {
                needs_new_retrieval: Some(true),
                shift_reason: Some(Some("no_cached_context".to_string())),
                ..Default::default()
            }));
        }
    };

    if cached.tables.is_empty() {
        println!("[ShiftDetect] Cached context has no tables, full retrieval required");
        return Ok(NodeOutcome::Update(StateUpdate {
            needs_new_retrieval: Some(true),
            shift_reason: Some(Some("no_tables_in_cache".to_string())),
            ..Default::default()
        }));
    }

    let prompt = format!(
        "Decide whether the follow-up question goes beyond the database tables already retrieved.\n\n\
         Retrieved tables: {}\n\nConversation so far:\n{}\n\nFollow-up question: {}\n\n\
         A follow-up that only changes sorting, grouping or filter values of the prior result\n\
         does NOT need new tables.\n\n\
         Reply with JSON: {{\"needs_new_tables\": true/false, \"reason\": \"...\", \"suggested_tables\": [\"...\"]}}",
        cached.tables.join(", "),
        format_history(&state.conversation_history),
        state.raw_query
    );

    let schema = json!({
        "type": "object",
        "title": "ShiftDetectResult",
        "properties": {
            "needs_new_tables": { "type": "boolean" },
            "reason": { "type": "string" },
            "suggested_tables": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["needs_new_tables", "reason"]
    });

    let update = match call_llm(
        ctx,
        ModelPurpose::Generation,
        vec![
            ChatMessage::system(
                "You judge whether a follow-up question requires retrieving new database tables.",
            ),
            ChatMessage::user(prompt),
        ],
        None,
        Some(schema),
        None,
    )
    .await
    {
        Ok(response) => {
            let parsed = response.structured.unwrap_or(json!({}));
            let needs_new = parsed["needs_new_tables"].as_bool().unwrap_or(true);
            let reason = parsed["reason"]
                .as_str()
                .unwrap_or("unspecified")
                .to_string();
            println!(
                "[ShiftDetect] needs_new={}, reason={}",
                needs_new, reason
            );
            StateUpdate {
                needs_new_retrieval: Some(needs_new),
                shift_reason: Some(Some(reason)),
                ..Default::default()
            }
        }
        Err(e) => {
            // Detection failure never reuses a possibly-wrong cache.
            println!("[ShiftDetect] Detection failed: {}", e);
            StateUpdate {
                needs_new_retrieval: Some(true),
                shift_reason: Some(Some(format!("detection_error: {}", e))),
                ..Default::default()
            }
        }
    };

    Ok(NodeOutcome::Update(update))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_history_keeps_last_three() {
        let history: Vec<ConversationTurn> = (0..5)
            .map(|i| ConversationTurn {
                message_id: format!("m{}", i),
                question: format!("q{}", i),
                sql: Some(format!("SELECT {}", i)),
                tables_used: vec!["patient".to_string()],
                token_count: 5,
            })
            .collect();

        let text = format_history(&history);
        assert!(!text.contains("q1"));
        assert!(text.contains("q2"));
        assert!(text.contains("q4"));
    }
}
