//! Multi-turn conversation management: token budgeting with history
//! summarization, and typed context merging.

pub mod context_merger;
pub mod token_manager;

use serde::{Deserialize, Serialize};

/// One resolved turn of conversation memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub message_id: String,
    pub question: String,
    pub sql: Option<String>,
    pub tables_used: Vec<String>,
    /// Non-negative token estimate for question + SQL.
    pub token_count: usize,
}
