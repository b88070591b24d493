//! Clarify node: cooperative suspension awaiting a user answer.
//!
//! Without an injected answer the node interrupts; the runtime persists a
//! checkpoint and surfaces the questions. On resume the answer is folded
//! into a clarified query via the LLM before retrieval proceeds.

use super::call_llm;
use crate::actors::llm_gateway_actor::ModelPurpose;
use crate::graph::state::{AgentState, StateUpdate};
use crate::graph::{NodeContext, NodeOutcome};
use crate::protocol::{ChatMessage, ClarificationPayload};

pub async fn run(state: &AgentState, ctx: &NodeContext) -> Result<NodeOutcome, String> {
    let questions = state.clarification_questions.clone().unwrap_or_default();

    if questions.is_empty() {
        // Routing should not have sent us here; pass through unchanged.
        return Ok(NodeOutcome::Update(StateUpdate {
            clarified_query: Some(Some(state.raw_query.clone())),
            ..Default::default()
        }));
    }

    let answer = match &state.clarification_answer {
        Some(answer) => answer.clone(),
        None => {
            println!(
                "[Clarify] Suspending with {} question(s)",
                questions.len()
            );
            return Ok(NodeOutcome::Interrupt(ClarificationPayload::new(
                &questions,
                &state.raw_query,
            )));
        }
    };

    // Fold the answer into a self-contained question.
    let question_text = questions
        .iter()
        .map(|q| format!("- {}", q))
        .collect::<Vec<_>>()
        .join("\n");

    let rewrite_prompt = format!(
        "Refine the question using the user's clarification.\n\n\
         Original question: {}\n\nPoints needing clarification:\n{}\n\n\
         User answer: {}\n\n\
         Output the complete refined question (question text only):",
        state.raw_query, question_text, answer
    );

    let clarified = match call_llm(
        ctx,
        ModelPurpose::Planning,
        vec![ChatMessage::user(rewrite_prompt)],
        None,
        None,
        None,
    )
    .await
    {
        Ok(response) if !response.content.trim().is_empty() => {
            response.content.trim().to_string()
        }
        _ => {
            // The raw query plus the literal answer is still usable.
            format!("{} ({})", state.raw_query, answer)
        }
    };

    println!("[Clarify] Clarified query: {}", clarified);

    Ok(NodeOutcome::Update(StateUpdate {
        clarified_query: Some(Some(clarified)),
        clarification_questions: Some(None),
        clarification_answer: Some(None),
        ..Default::default()
    }))
}
