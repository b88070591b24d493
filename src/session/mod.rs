//! Session model and stores.
//!
//! Sessions own their Turns and Messages. Two equivalent backends exist:
//! in-memory (capacity-capped, least-recently-updated eviction) and
//! PostgreSQL (canonical relational schema, reached through the SQL
//! gateway executor). Agent-graph checkpoints are keyed by thread id.

pub mod memory;
pub mod postgres;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub use memory::MemorySessionStore;
pub use postgres::PgSessionStore;

/// Session lifecycle states. Transitions form a DAG:
/// pending → processing → {awaiting_clarification ↔ processing}
/// → {completed, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Processing,
    AwaitingClarification,
    Completed,
    Failed,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Pending => "pending",
            QueryStatus::Processing => "processing",
            QueryStatus::AwaitingClarification => "awaiting_clarification",
            QueryStatus::Completed => "completed",
            QueryStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "processing" => QueryStatus::Processing,
            "awaiting_clarification" => QueryStatus::AwaitingClarification,
            "completed" => QueryStatus::Completed,
            "failed" => QueryStatus::Failed,
            _ => QueryStatus::Pending,
        }
    }
}

/// One round of questions put to the user. `answer == None` marks the
/// active suspension; a turn has at most one such clarification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clarification {
    pub questions: Vec<String>,
    pub answer: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One user question and its resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub question: String,
    pub status: QueryStatus,
    pub clarifications: Vec<Clarification>,
    pub final_sql: Option<String>,
    pub validation_passed: Option<bool>,
    pub chart_plan: Option<Value>,
    pub chart_reasoning: Option<String>,
    pub error: Option<String>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(turn_id: String, question: String, position: i32) -> Self {
        Self {
            turn_id,
            question,
            status: QueryStatus::Pending,
            clarifications: Vec::new(),
            final_sql: None,
            validation_passed: None,
            chart_plan: None,
            chart_reasoning: None,
            error: None,
            position,
            created_at: Utc::now(),
        }
    }

    /// The clarification currently waiting on the user, if any.
    pub fn pending_clarification(&self) -> Option<&Clarification> {
        self.clarifications.iter().find(|c| c.answer.is_none())
    }
}

/// Message roles in the session's message tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One node of the session's message tree. `parent_id` points within the
/// same session; `thread_id` is constant along an ancestor chain unless a
/// branch operation minted a new one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: String,
    pub session_id: String,
    pub thread_id: String,
    pub parent_id: Option<String>,
    pub role: MessageRole,
    pub content: Option<String>,
    pub generated_sql: Option<String>,
    pub tables_used: Vec<String>,
    pub validation_passed: Option<bool>,
    pub user_answer: Option<String>,
    pub clarification_questions: Option<Vec<String>>,
    pub is_few_shot: bool,
    pub token_count: Option<i64>,
    pub branch_id: Option<String>,
    pub root_message_id: Option<String>,
    pub checkpoint_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A session and everything it owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub db_name: Option<String>,
    pub status: QueryStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub raw_query: Option<String>,
    pub generated_sql: Option<String>,
    pub validation_passed: Option<bool>,
    pub state: Option<Value>,
    pub title: Option<String>,
    pub turns: Vec<Turn>,
    pub messages: HashMap<String, Message>,
    turn_counter: u32,
}

impl Session {
    pub fn new(session_id: String, db_name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            db_name,
            status: QueryStatus::Pending,
            created_at: now,
            updated_at: now,
            raw_query: None,
            generated_sql: None,
            validation_passed: None,
            state: None,
            title: None,
            turns: Vec::new(),
            messages: HashMap::new(),
            turn_counter: 0,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn create_turn(&mut self, question: String) -> &mut Turn {
        self.turn_counter += 1;
        let turn = Turn::new(
            format!("turn-{:03}", self.turn_counter),
            question,
            self.turns.len() as i32,
        );
        self.turns.push(turn);
        self.touch();
        self.turns.last_mut().expect("turn just pushed")
    }

    /// Install turns loaded from a persisted backend, re-syncing the
    /// monotonic turn counter.
    pub fn restore_turns(&mut self, turns: Vec<Turn>) {
        self.turn_counter = turns
            .iter()
            .filter_map(|t| {
                t.turn_id
                    .strip_prefix("turn-")
                    .and_then(|n| n.parse::<u32>().ok())
            })
            .max()
            .unwrap_or(turns.len() as u32);
        self.turns = turns;
    }

    pub fn current_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn current_turn_mut(&mut self) -> Option<&mut Turn> {
        self.turns.last_mut()
    }

    pub fn get_turn(&self, turn_id: &str) -> Option<&Turn> {
        self.turns.iter().find(|t| t.turn_id == turn_id)
    }

    pub fn add_message(&mut self, message: Message) {
        self.messages.insert(message.message_id.clone(), message);
        self.touch();
    }
}

/// The two session store backends behind one dispatching enum.
pub enum SessionStore {
    Memory(MemorySessionStore),
    Postgres(PgSessionStore),
}

impl SessionStore {
    pub async fn create(&self, session_id: &str, db_name: Option<&str>) -> Result<Session, String> {
        match self {
            SessionStore::Memory(store) => store.create(session_id, db_name).await,
            SessionStore::Postgres(store) => store.create(session_id, db_name).await,
        }
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        match self {
            SessionStore::Memory(store) => store.get(session_id).await,
            SessionStore::Postgres(store) => store.get(session_id).await,
        }
    }

    pub async fn update(&self, session: &Session) -> Result<(), String> {
        match self {
            SessionStore::Memory(store) => store.update(session).await,
            SessionStore::Postgres(store) => store.update(session).await,
        }
    }

    pub async fn update_status(&self, session_id: &str, status: QueryStatus) -> Result<(), String> {
        match self {
            SessionStore::Memory(store) => store.update_status(session_id, status).await,
            SessionStore::Postgres(store) => store.update_status(session_id, status).await,
        }
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool, String> {
        match self {
            SessionStore::Memory(store) => store.delete(session_id).await,
            SessionStore::Postgres(store) => store.delete(session_id).await,
        }
    }

    pub async fn list_all(&self, limit: usize, offset: usize) -> Result<Vec<Session>, String> {
        match self {
            SessionStore::Memory(store) => store.list_all(limit, offset).await,
            SessionStore::Postgres(store) => store.list_all(limit, offset).await,
        }
    }

    pub async fn count(&self) -> usize {
        match self {
            SessionStore::Memory(store) => store.count().await,
            SessionStore::Postgres(store) => store.count().await,
        }
    }

    pub async fn get_message(&self, message_id: &str) -> Option<Message> {
        match self {
            SessionStore::Memory(store) => store.get_message(message_id).await,
            SessionStore::Postgres(store) => store.get_message(message_id).await,
        }
    }

    pub async fn mark_as_few_shot(&self, message_id: &str) -> Result<Message, String> {
        match self {
            SessionStore::Memory(store) => store.mark_as_few_shot(message_id).await,
            SessionStore::Postgres(store) => store.mark_as_few_shot(message_id).await,
        }
    }

    /// Persist a graph checkpoint keyed by thread id. Single-writer per
    /// thread is the runtime's contract, not the store's.
    pub async fn save_checkpoint(&self, thread_id: &str, checkpoint: Value) -> Result<(), String> {
        match self {
            SessionStore::Memory(store) => store.save_checkpoint(thread_id, checkpoint).await,
            SessionStore::Postgres(store) => store.save_checkpoint(thread_id, checkpoint).await,
        }
    }

    pub async fn load_checkpoint(&self, thread_id: &str) -> Option<Value> {
        match self {
            SessionStore::Memory(store) => store.load_checkpoint(thread_id).await,
            SessionStore::Postgres(store) => store.load_checkpoint(thread_id).await,
        }
    }

    pub async fn delete_checkpoint(&self, thread_id: &str) {
        match self {
            SessionStore::Memory(store) => store.delete_checkpoint(thread_id).await,
            SessionStore::Postgres(store) => store.delete_checkpoint(thread_id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            QueryStatus::Pending,
            QueryStatus::Processing,
            QueryStatus::AwaitingClarification,
            QueryStatus::Completed,
            QueryStatus::Failed,
        ] {
            assert_eq!(QueryStatus::parse(status.as_str()), status);
        }
    }

    #[test]
    fn test_turn_ids_are_monotonic() {
        let mut session = Session::new("s1".to_string(), None);
        let id1 = session.create_turn("q1".to_string()).turn_id.clone();
        let id2 = session.create_turn("q2".to_string()).turn_id.clone();
        assert_eq!(id1, "turn-001");
        assert_eq!(id2, "turn-002");
        assert_eq!(session.turns[1].position, 1);
        assert!(session.updated_at >= session.created_at);
    }

    #[test]
    fn test_restore_turns_resyncs_counter() {
        let mut session = Session::new("s1".to_string(), None);
        session.restore_turns(vec![
            Turn::new("turn-001".to_string(), "q1".to_string(), 0),
            Turn::new("turn-002".to_string(), "q2".to_string(), 1),
        ]);

        let next = session.create_turn("q3".to_string()).turn_id.clone();
        assert_eq!(next, "turn-003");
    }

    #[test]
    fn test_pending_clarification_detection() {
        let mut turn = Turn::new("turn-001".to_string(), "q".to_string(), 0);
        assert!(turn.pending_clarification().is_none());

        turn.clarifications.push(Clarification {
            questions: vec!["which date column?".to_string()],
            answer: None,
            created_at: Utc::now(),
        });
        assert!(turn.pending_clarification().is_some());

        turn.clarifications[0].answer = Some("visit_date".to_string());
        assert!(turn.pending_clarification().is_none());
    }
}
