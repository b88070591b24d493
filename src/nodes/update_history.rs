//! Update-history node: append the finished turn to conversation memory.

use uuid::Uuid;

use crate::graph::state::{AgentState, StateUpdate};
use crate::graph::{NodeContext, NodeOutcome};
use crate::multi_turn::token_manager::TokenManager;
use crate::multi_turn::ConversationTurn;

pub async fn run(state: &AgentState, _ctx: &NodeContext) -> Result<NodeOutcome, String> {
    if state.raw_query.is_empty()
        || (state.generated_sql.is_none() && state.error.is_none())
    {
        return Ok(NodeOutcome::Update(StateUpdate::default()));
    }

    let mut history = state.conversation_history.clone();
    let tables_used = state
        .retrieval_result
        .as_ref()
        .map(|r| r.tables.clone())
        .unwrap_or_default();

    history.push(ConversationTurn {
        message_id: state
            .current_message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        question: state.raw_query.clone(),
        sql: state.generated_sql.clone(),
        tables_used,
        token_count: TokenManager::estimate_turn_tokens(
            &state.raw_query,
            state.generated_sql.as_deref(),
        ),
    });

    Ok(NodeOutcome::Update(StateUpdate {
        conversation_history: Some(history),
        ..Default::default()
    }))
}
