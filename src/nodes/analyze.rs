//! Analyze node: decide whether the question needs clarification before
//! SQL generation, using a light schema hint for grounding.
//!
//! The bias is to NOT ask: only genuine ambiguity (several candidate time
//! columns, several similar tables, an unmappable question) produces
//! questions, at most two, referencing real table and column names.

use serde_json::json;
use tokio::sync::oneshot;

use super::call_llm;
use crate::actors::llm_gateway_actor::ModelPurpose;
use crate::actors::schema_vector_actor::SchemaVectorMsg;
use crate::graph::state::{AgentState, SchemaHint, SchemaHintTable, StateUpdate};
use crate::graph::{NodeContext, NodeOutcome};
use crate::protocol::ChatMessage;

const HINT_TOP_K: usize = 5;

const ANALYZE_SYSTEM: &str = r#"You are a SQL data analyst deciding whether a question is clear enough to generate SQL.

Principle: avoid asking. Clarify ONLY when truly ambiguous.

Do NOT ask when:
1. The time range is explicit ("today", "this month", "last 30 days", "2024").
2. Only one primary table is involved with no similar-table ambiguity.
3. The aggregation is explicit ("total", "average", "max", "list").
4. A reasonable default resolves the question.

DO ask when:
1. Several time columns exist (e.g. create_time vs visit_date) and none was named.
2. Several similarly-named tables or columns make the intent undecidable.
3. The question cannot be mapped to any table at all.

When asking: at most 1-2 questions, each referencing actual table and column
names, phrased as a choice rather than open-ended."#;

/// Fetch a lightweight table hint for schema-aware clarification. Failure
/// degrades to no hint.
async fn fetch_schema_hint(state: &AgentState, ctx: &NodeContext) -> Option<SchemaHint> {
    let embedding = ctx.embeddings.encode(&state.raw_query).await.ok()?;
    let (tx, rx) = oneshot::channel();
    ctx.vector_tx
        .send(SchemaVectorMsg::SearchTables {
            query_embedding: embedding,
            db_name: state.db_name.clone(),
            limit: HINT_TOP_K,
            respond_to: tx,
        })
        .await
        .ok()?;
    let hits = rx.await.ok()?.ok()?;
    if hits.is_empty() {
        return None;
    }

    Some(SchemaHint {
        tables: hits
            .into_iter()
            .map(|h| SchemaHintTable {
                name: h.table_name,
                score: h.score,
                chinese_name: h.chinese_name,
                description: h.description,
            })
            .collect(),
    })
}

fn format_hint(hint: &SchemaHint) -> String {
    hint.tables
        .iter()
        .map(|t| {
            let mut line = format!("- {}", t.name);
            if let Some(cn) = &t.chinese_name {
                line.push_str(&format!(" ({})", cn));
            }
            if let Some(desc) = &t.description {
                line.push_str(&format!(": {}", desc));
            }
            line.push_str(&format!(" [relevance {:.2}]", t.score));
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub async fn run(state: &AgentState, ctx: &NodeContext) -> Result<NodeOutcome, String> {
    // Fast mode skips the whole clarification machinery.
    if ctx.settings.llm.query_mode == "fast" {
        return Ok(NodeOutcome::Update(StateUpdate {
            clarified_query: Some(Some(state.raw_query.clone())),
            clarification_questions: Some(None),
            ..Default::default()
        }));
    }

    let hint = fetch_schema_hint(state, ctx).await;

    let user_prompt = match &hint {
        Some(hint) => format!(
            "Question: {}\n\nPossibly relevant tables:\n{}\n\n\
             Is there GENUINE ambiguity requiring user clarification?\n\
             Remember: explicit time ranges and reasonable defaults mean NO.\n\
             If clarification is needed, ground the 1-2 questions in the tables above.",
            state.raw_query,
            format_hint(hint)
        ),
        None => format!(
            "Question: {}\n\nIs there GENUINE ambiguity requiring user clarification?\n\
             Only ask when the question is too vague to produce any meaningful SQL.",
            state.raw_query
        ),
    };

    let schema = json!({
        "type": "object",
        "title": "AnalysisResult",
        "properties": {
            "is_clear": { "type": "boolean" },
            "clarification_questions": { "type": "array", "items": { "type": "string" } },
            "reasoning": { "type": "string" }
        },
        "required": ["is_clear"]
    });

    let response = call_llm(
        ctx,
        ModelPurpose::Planning,
        vec![
            ChatMessage::system(ANALYZE_SYSTEM),
            ChatMessage::user(user_prompt),
        ],
        None,
        Some(schema),
        None,
    )
    .await;

    let update = match response {
        Ok(response) => {
            let parsed = response.structured.unwrap_or(json!({}));
            let mut is_clear = parsed["is_clear"].as_bool().unwrap_or(true);
            let questions: Vec<String> = parsed["clarification_questions"]
                .as_array()
                .map(|a| {
                    a.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();

            // Unclear without questions is unusable; treat as clear.
            if !is_clear && questions.is_empty() {
                is_clear = true;
            }

            if is_clear {
                StateUpdate {
                    clarified_query: Some(Some(state.raw_query.clone())),
                    clarification_questions: Some(None),
                    schema_hint: Some(hint),
                    ..Default::default()
                }
            } else {
                println!("[Analyze] Clarification needed: {:?}", questions);
                StateUpdate {
                    clarified_query: Some(None),
                    clarification_questions: Some(Some(questions)),
                    schema_hint: Some(hint),
                    ..Default::default()
                }
            }
        }
        Err(e) => {
            // Analysis is advisory; a failed LLM call never blocks the run.
            println!("[Analyze] LLM failed ({}), proceeding without clarification", e);
            StateUpdate {
                clarified_query: Some(Some(state.raw_query.clone())),
                clarification_questions: Some(None),
                schema_hint: Some(hint),
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
    fn test_format_hint_lines() {
        let hint = SchemaHint {
            tables: vec![SchemaHintTable {
                name: "visit".to_string(),
                score: 0.87,
                chinese_name: Some("就诊".to_string()),
                description: Some("outpatient visits".to_string()),
            }],
        };
        let text = format_hint(&hint);
        assert!(text.contains("- visit (就诊): outpatient visits [relevance 0.87]"));
    }
}
