//! Retrieve-few-shot node: fetch validated Q&A examples similar to the
//! question. Best-effort; the run proceeds without examples on any
//! failure.

use tokio::sync::oneshot;

use crate::actors::few_shot_actor::FewShotMsg;
use crate::graph::state::{AgentState, StateUpdate};
use crate::graph::{NodeContext, NodeOutcome};

pub async fn run(state: &AgentState, ctx: &NodeContext) -> Result<NodeOutcome, String> {
    let few_shot_tx = match &ctx.few_shot_tx {
        Some(tx) => tx,
        None => return Ok(NodeOutcome::Update(StateUpdate::default())),
    };

    let db_name = match &state.db_name {
        Some(db) => db.clone(),
        None => return Ok(NodeOutcome::Update(StateUpdate::default())),
    };

    let embedding = match ctx.embeddings.encode(state.effective_query()).await {
        Ok(embedding) => embedding,
        Err(e) => {
            println!("[RetrieveFewShot] Embedding failed: {}", e);
            return Ok(NodeOutcome::Update(StateUpdate::default()));
        }
    };

    let (tx, rx) = oneshot::channel();
    let sent = few_shot_tx
        .send(FewShotMsg::SearchSimilar {
            query_embedding: embedding,
            db_name,
            top_k: ctx.settings.retrieval.few_shot_top_k,
            min_score: ctx.settings.retrieval.few_shot_min_score,
            respond_to: tx,
        })
        .await;

    if sent.is_err() {
        return Ok(NodeOutcome::Update(StateUpdate::default()));
    }

    let examples = match rx.await {
        Ok(Ok(examples)) => examples,
        Ok(Err(e)) => {
            println!("[RetrieveFewShot] Search failed: {}", e);
            Vec::new()
        }
        Err(_) => Vec::new(),
    };

    if !examples.is_empty() {
        println!("[RetrieveFewShot] {} example(s) retrieved", examples.len());
    }

    Ok(NodeOutcome::Update(StateUpdate {
        few_shot_examples: Some(examples),
        ..Default::default()
    }))
}
