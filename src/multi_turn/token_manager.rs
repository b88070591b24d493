//! Token budgeting for conversation history.
//!
//! The budget is `MAX_CONTEXT_TOKENS - schema_tokens - RESERVED_RESPONSE`.
//! History is walked newest-backward; turns that fit are kept verbatim,
//! anything older is collapsed into an LLM summary (with a static fallback
//! when the LLM is unavailable). Running the manager over an
//! already-compressed history returns it unchanged.

use tokio::sync::{mpsc, oneshot};

use super::ConversationTurn;
use crate::actors::llm_gateway_actor::{LlmMsg, ModelPurpose};
use crate::context::estimate_tokens;
use crate::protocol::ChatMessage;

pub const MAX_CONTEXT_TOKENS: usize = 12_000;
pub const MAX_HISTORY_TURNS: usize = 10;
pub const RESERVED_RESPONSE_TOKENS: usize = 2_000;

const SUMMARIZE_SYSTEM: &str = "You summarize conversations for a SQL assistant.";

pub struct TokenManager {
    max_tokens: usize,
}

impl Default for TokenManager {
    fn default() -> Self {
        Self {
            max_tokens: MAX_CONTEXT_TOKENS,
        }
    }
}

impl TokenManager {
    pub fn with_budget(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    pub fn estimate_turn_tokens(question: &str, sql: Option<&str>) -> usize {
        estimate_tokens(question) + sql.map(estimate_tokens).unwrap_or(0)
    }

    /// Split history into (optional summary of dropped turns, recent turns
    /// that fit the budget).
    pub async fn prepare_history(
        &self,
        history: &[ConversationTurn],
        schema_context_tokens: usize,
        llm_tx: Option<&mpsc::Sender<LlmMsg>>,
    ) -> (Option<String>, Vec<ConversationTurn>) {
        let available = self
            .max_tokens
            .saturating_sub(schema_context_tokens)
            .saturating_sub(RESERVED_RESPONSE_TOKENS);

        if available == 0 {
            return (None, Vec::new());
        }

        let window_start = history.len().saturating_sub(MAX_HISTORY_TURNS);
        let window = &history[window_start..];

        let mut recent: Vec<ConversationTurn> = Vec::new();
        let mut total = 0usize;
        for turn in window.iter().rev() {
            let turn_tokens = if turn.token_count > 0 {
                turn.token_count
            } else {
                Self::estimate_turn_tokens(&turn.question, turn.sql.as_deref())
            };
            if total + turn_tokens > available {
                break;
            }
            recent.insert(0, turn.clone());
            total += turn_tokens;
        }

        if recent.len() == history.len() {
            // Everything fits; no compression needed. This keeps the
            // operation idempotent on already-compressed input.
            return (None, recent);
        }

        let dropped = &history[..history.len() - recent.len()];
        if dropped.is_empty() {
            return (None, recent);
        }

        let summary = self.summarize(dropped, llm_tx).await;
        (Some(summary), recent)
    }

    async fn summarize(
        &self,
        turns: &[ConversationTurn],
        llm_tx: Option<&mpsc::Sender<LlmMsg>>,
    ) -> String {
        let fallback = format!("[history summary: {} turns]", turns.len());

        let llm_tx = match llm_tx {
            Some(tx) => tx,
            None => return fallback,
        };

        let history_text = turns
            .iter()
            .map(|t| {
                format!(
                    "Q: {}\nSQL: {}",
                    t.question,
                    t.sql.as_deref().unwrap_or("N/A")
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Compress this conversation history into a short summary keeping:\n\
             - the main questions asked\n- the tables involved\n- the core logic of the SQL\n\n\
             History:\n{}\n\nSummary (under 200 words):",
            history_text
        );

        let (tx, rx) = oneshot::channel();
        let sent = llm_tx
            .send(LlmMsg::Chat {
                purpose: ModelPurpose::Generation,
                messages: vec![
                    ChatMessage::system(SUMMARIZE_SYSTEM),
                    ChatMessage::user(prompt),
                ],
                tools: None,
                response_schema: None,
                token_tx: None,
                cancel_rx: None,
                respond_to: tx,
            })
            .await;

        if sent.is_err() {
            return fallback;
        }

        match rx.await {
            Ok(Ok(response)) if !response.content.trim().is_empty() => {
                response.content.trim().to_string()
            }
            _ => fallback,
        }
    }

    /// Turn a prepared history into the LLM message list.
    pub fn build_history_messages(
        summary: Option<&str>,
        recent: &[ConversationTurn],
    ) -> Vec<ChatMessage> {
        let mut messages = Vec::new();

        if let Some(summary) = summary {
            messages.push(ChatMessage::system(format!(
                "Conversation summary:\n{}",
                summary
            )));
        }

        for turn in recent {
            messages.push(ChatMessage::user(turn.question.clone()));
            if let Some(sql) = &turn.sql {
                messages.push(ChatMessage::assistant(format!("```sql\n{}\n```", sql)));
            }
        }

        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(question: &str, tokens: usize) -> ConversationTurn {
        ConversationTurn {
            message_id: format!("m-{}", question),
            question: question.to_string(),
            sql: Some("SELECT 1".to_string()),
            tables_used: vec![],
            token_count: tokens,
        }
    }

    #[tokio::test]
    async fn test_all_turns_fit_no_summary() {
        let manager = TokenManager::default();
        let history = vec![turn("a", 100), turn("b", 100)];

        let (summary, recent) = manager.prepare_history(&history, 1000, None).await;
        assert!(summary.is_none());
        assert_eq!(recent.len(), 2);
    }

    #[tokio::test]
    async fn test_budget_drops_oldest_and_summarizes() {
        let manager = TokenManager::with_budget(3000);
        // available = 3000 - 500 - 2000 = 500; each turn 300 -> only newest fits
        let history = vec![turn("old", 300), turn("new", 300)];

        let (summary, recent) = manager.prepare_history(&history, 500, None).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].question, "new");
        assert_eq!(summary.as_deref(), Some("[history summary: 1 turns]"));
    }

    #[tokio::test]
    async fn test_zero_budget_empty_history() {
        let manager = TokenManager::with_budget(2000);
        let history = vec![turn("a", 10)];
        let (summary, recent) = manager.prepare_history(&history, 100, None).await;
        assert!(summary.is_none());
        assert!(recent.is_empty());
    }

    #[tokio::test]
    async fn test_hard_turn_cap() {
        let manager = TokenManager::default();
        let history: Vec<ConversationTurn> =
            (0..15).map(|i| turn(&format!("q{}", i), 10)).collect();

        let (_, recent) = manager.prepare_history(&history, 0, None).await;
        assert!(recent.len() <= MAX_HISTORY_TURNS);
        // Newest turns win.
        assert_eq!(recent.last().unwrap().question, "q14");
    }

    #[tokio::test]
    async fn test_compression_idempotent() {
        let manager = TokenManager::with_budget(3000);
        let history = vec![turn("old", 300), turn("new", 300)];

        let (_, recent) = manager.prepare_history(&history, 500, None).await;
        let (summary2, recent2) = manager.prepare_history(&recent, 500, None).await;
        assert!(summary2.is_none());
        assert_eq!(recent2.len(), recent.len());
        assert_eq!(recent2[0].question, recent[0].question);
    }

    #[test]
    fn test_emitted_messages_within_budget() {
        let recent = vec![turn("question", 50)];
        let messages = TokenManager::build_history_messages(Some("summary"), &recent);

        assert_eq!(messages.len(), 3);
        let total: usize = messages
            .iter()
            .map(|m| crate::context::estimate_tokens(&m.content))
            .sum();
        assert!(total <= MAX_CONTEXT_TOKENS - RESERVED_RESPONSE_TOKENS);
        assert!(messages[2].content.contains("```sql"));
    }
}
