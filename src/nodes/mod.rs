//! Graph nodes. Each node reads the state, talks to actors through the
//! node context, and returns a partial state update (or an interrupt).

pub mod analyze;
pub mod build_context;
pub mod clarify;
pub mod generate_sql;
pub mod repair_sql;
pub mod retrieve;
pub mod retrieve_few_shot;
pub mod shift_detect;
pub mod sql_agent;
pub mod update_history;
pub mod validate_sql;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::actors::llm_gateway_actor::{LlmMsg, LlmResponse, ModelPurpose};
use crate::graph::NodeContext;
use crate::protocol::{ChatMessage, ToolSpec};

lazy_static! {
    static ref SQL_FENCE: Regex = Regex::new(r"(?s)```sql\s*(.*?)```").unwrap();
    static ref ANY_FENCE: Regex = Regex::new(r"(?s)```\s*(.*?)```").unwrap();
}

/// Pull a SQL statement out of model text: a ```sql fence, any fence whose
/// body looks like SQL, or bare text starting with SELECT/WITH.
pub fn extract_sql(content: &str) -> Option<String> {
    if let Some(cap) = SQL_FENCE.captures(content) {
        let sql = cap[1].trim().to_string();
        if !sql.is_empty() {
            return Some(sql);
        }
    }

    if let Some(cap) = ANY_FENCE.captures(content) {
        let body = cap[1].trim();
        let upper = body.to_uppercase();
        if upper.starts_with("SELECT") || upper.starts_with("WITH") {
            return Some(body.to_string());
        }
    }

    let trimmed = content.trim();
    let upper = trimmed.to_uppercase();
    if upper.starts_with("SELECT") || upper.starts_with("WITH") {
        return Some(trimmed.to_string());
    }

    None
}

/// One chat round-trip through the gateway.
pub(crate) async fn call_llm(
    ctx: &NodeContext,
    purpose: ModelPurpose,
    messages: Vec<ChatMessage>,
    tools: Option<Vec<ToolSpec>>,
    response_schema: Option<Value>,
    token_tx: Option<mpsc::UnboundedSender<String>>,
) -> Result<LlmResponse, String> {
    let (tx, rx) = oneshot::channel();
    ctx.llm_tx
        .send(LlmMsg::Chat {
            purpose,
            messages,
            tools,
            response_schema,
            token_tx,
            cancel_rx: Some(ctx.cancel_rx.clone()),
            respond_to: tx,
        })
        .await
        .map_err(|_| "llm gateway unavailable".to_string())?;
    rx.await.map_err(|_| "llm gateway died".to_string())?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_sql_fenced() {
        let content = "Here you go:\n```sql\nSELECT * FROM patient\n```\nValidated.";
        assert_eq!(extract_sql(content).unwrap(), "SELECT * FROM patient");
    }

    #[test]
    fn test_extract_sql_generic_fence() {
        let content = "```\nSELECT 1\n```";
        assert_eq!(extract_sql(content).unwrap(), "SELECT 1");
    }

    #[test]
    fn test_extract_sql_bare_select() {
        assert_eq!(
            extract_sql("  SELECT name FROM patient  ").unwrap(),
            "SELECT name FROM patient"
        );
        assert_eq!(
            extract_sql("WITH t AS (SELECT 1) SELECT * FROM t").unwrap(),
            "WITH t AS (SELECT 1) SELECT * FROM t"
        );
    }

    #[test]
    fn test_extract_sql_rejects_prose() {
        assert!(extract_sql("I could not find a matching table.").is_none());
        assert!(extract_sql("```\nnot sql at all\n```").is_none());
    }
}
