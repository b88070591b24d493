//! Retrieve node: schema retrieval, with cache reuse on follow-ups.
//!
//! When shift detection judged the cached context sufficient, the cached
//! retrieval result is reused verbatim. Otherwise the full pipeline runs
//! and, on follow-ups, its result is merged with the cache so previously
//! scoped tables stay available.

use crate::graph::state::{AgentState, StateUpdate};
use crate::graph::{NodeContext, NodeOutcome};
use crate::multi_turn::context_merger;
use crate::retrieval::{InitialTable, SchemaRetrievalService};

pub async fn run(state: &AgentState, ctx: &NodeContext) -> Result<NodeOutcome, String> {
    // Follow-up with a valid cache and no semantic shift: reuse.
    if !state.needs_new_retrieval {
        if let Some(cached) = &state.cached_retrieval {
            println!(
                "[Retrieve] Reusing cached context ({} tables)",
                cached.tables.len()
            );
            return Ok(NodeOutcome::Update(StateUpdate {
                retrieval_result: Some(Some(cached.clone())),
                ..Default::default()
            }));
        }
    }

    let service = SchemaRetrievalService::new(
        ctx.graph_tx.clone(),
        ctx.vector_tx.clone(),
        Some(ctx.llm_tx.clone()),
        ctx.embeddings.clone(),
        ctx.settings.retrieval.clone(),
    );

    // The hint stage's scores stand in for the kNN search, but only when
    // clarification did not rewrite the question.
    let initial_tables: Option<Vec<InitialTable>> = match (&state.schema_hint, &state.clarified_query)
    {
        (Some(hint), clarified)
            if clarified.as_deref() == Some(state.raw_query.as_str())
                || clarified.is_none() =>
        {
            Some(
                hint.tables
                    .iter()
                    .map(|t| InitialTable {
                        name: t.name.clone(),
                        score: t.score,
                        chinese_name: t.chinese_name.clone(),
                        description: t.description.clone(),
                    })
                    .collect(),
            )
        }
        _ => None,
    };

    let fresh = service
        .retrieve(
            state.effective_query(),
            state.db_name.as_deref(),
            initial_tables,
        )
        .await?;

    // Merge with the cache on follow-ups so earlier tables survive.
    let result = match &state.cached_retrieval {
        Some(cached) if !state.conversation_history.is_empty() => {
            context_merger::merge_results(cached, &fresh)
        }
        _ => fresh,
    };

    Ok(NodeOutcome::Update(StateUpdate {
        retrieval_result: Some(Some(result)),
        ..Default::default()
    }))
}
