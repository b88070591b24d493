//! Repair-SQL node: error-informed rewrite of a failed statement.
//!
//! retry_count increments on every attempt, successful or not, so the
//! validate/repair cycle always terminates.

use super::{call_llm, extract_sql};
use crate::actors::llm_gateway_actor::ModelPurpose;
use crate::graph::state::{AgentState, StateUpdate};
use crate::graph::{NodeContext, NodeOutcome};
use crate::protocol::ChatMessage;

const REPAIR_SYSTEM: &str =
    "You are a SQL expert. The user's SQL failed validation; fix it using the error message. Output only the corrected SQL.";

pub async fn run(state: &AgentState, ctx: &NodeContext) -> Result<NodeOutcome, String> {
    let (error, original_sql) = match (&state.error, &state.generated_sql) {
        (Some(error), Some(sql)) => (error.clone(), sql.clone()),
        _ => return Ok(NodeOutcome::Update(StateUpdate::default())),
    };

    let system_prompt = state
        .context_output
        .as_ref()
        .map(|c| c.system_prompt.clone())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| REPAIR_SYSTEM.to_string());

    let repair_prompt = format!(
        "The SQL below failed. Fix it.\n\nError:\n{}\n\nOriginal SQL:\n```sql\n{}\n```\n\n\
         Output only the corrected SQL.",
        error, original_sql
    );

    let next_retry = state.retry_count + 1;

    let update = match call_llm(
        ctx,
        ModelPurpose::Generation,
        vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user(repair_prompt),
        ],
        None,
        None,
        None,
    )
    .await
    {
        Ok(response) => match extract_sql(&response.content) {
            Some(sql) => {
                println!("[RepairSql] Attempt {} produced new SQL", next_retry);
                StateUpdate {
                    generated_sql: Some(Some(sql)),
                    error: Some(None),
                    retry_count: Some(next_retry),
                    ..Default::default()
                }
            }
            None => StateUpdate {
                error: Some(Some("Repair produced no SQL".to_string())),
                retry_count: Some(next_retry),
                ..Default::default()
            },
        },
        Err(e) => StateUpdate {
            error: Some(Some(format!("Repair failed: {}", e))),
            retry_count: Some(next_retry),
            ..Default::default()
        },
    };

    Ok(NodeOutcome::Update(update))
}
