//! Build-context node: render the retrieval result into prompts and cache
//! the typed context for the next turn.
//!
//! Code-context snippets are fetched here (best-effort) since they depend
//! on the final table set.

use tokio::sync::oneshot;

use crate::actors::code_vector_actor::{CodeChunkHit, CodeVectorMsg};
use crate::context::{ContextBuilder, ContextInput};
use crate::graph::state::{AgentState, StateUpdate};
use crate::graph::{NodeContext, NodeOutcome};

async fn fetch_code_context(state: &AgentState, ctx: &NodeContext) -> Vec<CodeChunkHit> {
    let code_tx = match &ctx.code_tx {
        Some(tx) => tx,
        None => return Vec::new(),
    };

    let tables = state
        .retrieval_result
        .as_ref()
        .map(|r| r.tables.join(" "))
        .unwrap_or_default();
    // Table names hint the embedding toward the right business logic.
    let query = format!("{} {}", state.effective_query(), tables);

    let embedding = match ctx.embeddings.encode(&query).await {
        Ok(embedding) => embedding,
        Err(_) => return Vec::new(),
    };

    let (tx, rx) = oneshot::channel();
    if code_tx
        .send(CodeVectorMsg::SearchChunks {
            query_embedding: embedding,
            top_k: ctx.settings.retrieval.code_top_k,
            score_threshold: ctx.settings.retrieval.code_score_threshold,
            respond_to: tx,
        })
        .await
        .is_err()
    {
        return Vec::new();
    }

    match rx.await {
        Ok(Ok(chunks)) => chunks,
        _ => Vec::new(),
    }
}

pub async fn run(state: &AgentState, ctx: &NodeContext) -> Result<NodeOutcome, String> {
    let retrieval_result = state
        .retrieval_result
        .clone()
        .ok_or_else(|| "No retrieval result available for context building".to_string())?;

    let code_context = fetch_code_context(state, ctx).await;
    let dialect = state
        .db_name
        .as_deref()
        .and_then(|db| ctx.settings.dialect_for(db));

    let input = ContextInput {
        question: state.effective_query().to_string(),
        retrieval_result: retrieval_result.clone(),
        db_name: state.db_name.clone(),
        dialect,
        few_shot_examples: state.few_shot_examples.clone(),
        code_context,
    };

    let output = ContextBuilder::full().build(&input);
    println!(
        "[BuildContext] {} sections, ~{} tokens",
        output.metadata["section_count"], output.total_tokens
    );

    Ok(NodeOutcome::Update(StateUpdate {
        context_output: Some(Some(output.clone())),
        // The typed cache feeds the next turn's shift detection and merge.
        cached_context: Some(Some(output)),
        cached_retrieval: Some(Some(retrieval_result)),
        ..Default::default()
    }))
}
