//! PostgreSQL session store.
//!
//! Persists sessions, messages, and turns in the canonical relational
//! schema (`easysql_sessions`, `easysql_messages`, `easysql_turns`,
//! `easysql_turn_clarifications`). All statements travel through the SQL
//! gateway executor; messages and turns cascade on session delete.
//!
//! Checkpoints are process-local (thread-id-keyed map), matching the
//! runtime's single-writer-per-thread contract.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use super::{Clarification, Message, MessageRole, QueryStatus, Session, Turn};
use crate::actors::sql_executor_actor::{SqlExecMsg, SqlExecutionResult};

const STORE_TIMEOUT_SECS: u64 = 30;
const STORE_ROW_LIMIT: usize = 10_000;

/// Canonical DDL, applied idempotently at startup.
pub const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS easysql_sessions (
        id UUID PRIMARY KEY,
        db_name VARCHAR(128),
        status VARCHAR(32) NOT NULL DEFAULT 'pending',
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        raw_query TEXT,
        generated_sql TEXT,
        validation_passed BOOLEAN,
        state JSONB,
        title TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS easysql_messages (
        id UUID PRIMARY KEY,
        session_id UUID NOT NULL REFERENCES easysql_sessions(id) ON DELETE CASCADE,
        parent_id UUID REFERENCES easysql_messages(id),
        role VARCHAR(16) NOT NULL CHECK (role IN ('user', 'assistant')),
        content TEXT,
        generated_sql TEXT,
        tables_used TEXT[],
        validation_passed BOOLEAN,
        is_branch_point BOOLEAN NOT NULL DEFAULT FALSE,
        checkpoint_id VARCHAR(128),
        token_count INTEGER,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        is_few_shot BOOLEAN NOT NULL DEFAULT FALSE,
        user_answer TEXT,
        clarification_questions JSONB,
        thread_id VARCHAR(128),
        branch_id UUID,
        root_message_id UUID
    )"#,
    r#"CREATE TABLE IF NOT EXISTS easysql_turns (
        id UUID PRIMARY KEY,
        session_id UUID NOT NULL REFERENCES easysql_sessions(id) ON DELETE CASCADE,
        turn_id VARCHAR(20) NOT NULL,
        question TEXT NOT NULL,
        status VARCHAR(32) NOT NULL DEFAULT 'pending',
        final_sql TEXT,
        validation_passed BOOLEAN,
        error TEXT,
        chart_plan JSONB,
        chart_reasoning TEXT,
        position INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (session_id, turn_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS easysql_turn_clarifications (
        id UUID PRIMARY KEY,
        turn_id UUID NOT NULL REFERENCES easysql_turns(id) ON DELETE CASCADE,
        position INTEGER NOT NULL,
        questions TEXT[] NOT NULL,
        answer TEXT,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_easysql_messages_session ON easysql_messages (session_id)",
    "CREATE INDEX IF NOT EXISTS idx_easysql_messages_parent ON easysql_messages (parent_id)",
    "CREATE INDEX IF NOT EXISTS idx_easysql_turns_session ON easysql_turns (session_id)",
    "CREATE INDEX IF NOT EXISTS idx_easysql_messages_few_shot ON easysql_messages (is_few_shot) WHERE is_few_shot",
];

/// Quote a text literal, doubling embedded quotes.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn quote_opt(value: &Option<String>) -> String {
    match value {
        Some(v) => quote(v),
        None => "NULL".to_string(),
    }
}

fn quote_bool_opt(value: Option<bool>) -> String {
    match value {
        Some(true) => "TRUE".to_string(),
        Some(false) => "FALSE".to_string(),
        None => "NULL".to_string(),
    }
}

fn quote_jsonb_opt(value: &Option<Value>) -> String {
    match value {
        Some(v) => format!("{}::jsonb", quote(&v.to_string())),
        None => "NULL".to_string(),
    }
}

fn quote_text_array(values: &[String]) -> String {
    if values.is_empty() {
        return "'{}'::text[]".to_string();
    }
    let items: Vec<String> = values.iter().map(|v| quote(v)).collect();
    format!("ARRAY[{}]::text[]", items.join(", "))
}

fn quote_timestamp(ts: &DateTime<Utc>) -> String {
    quote(&ts.to_rfc3339())
}

/// Parse a Postgres text[] value as it comes back through the gateway.
fn parse_text_array(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect(),
        Value::String(s) => s
            .trim_start_matches('{')
            .trim_end_matches('}')
            .split(',')
            .map(|p| p.trim().trim_matches('"').to_string())
            .filter(|p| !p.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_timestamp(value: &Value) -> DateTime<Utc> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Read one cell by column name.
fn cell<'a>(result: &'a SqlExecutionResult, row: usize, column: &str) -> &'a Value {
    static NULL: Value = Value::Null;
    result
        .columns
        .iter()
        .position(|c| c == column)
        .and_then(|idx| result.rows.get(row).and_then(|r| r.get(idx)))
        .unwrap_or(&NULL)
}

pub struct PgSessionStore {
    sql_tx: mpsc::Sender<SqlExecMsg>,
    /// Target database name carrying the session tables.
    db_name: String,
    checkpoints: RwLock<HashMap<String, Value>>,
}

impl PgSessionStore {
    /// Build the store and apply the canonical migrations.
    pub async fn new(sql_tx: mpsc::Sender<SqlExecMsg>, db_name: String) -> Result<Self, String> {
        let store = Self {
            sql_tx,
            db_name,
            checkpoints: RwLock::new(HashMap::new()),
        };

        for migration in MIGRATIONS {
            store.run(migration).await?;
        }
        println!("[PgSessionStore] Schema ensured on {}", store.db_name);
        Ok(store)
    }

    async fn run(&self, sql: &str) -> Result<SqlExecutionResult, String> {
        let (tx, rx) = oneshot::channel();
        self.sql_tx
            .send(SqlExecMsg::Execute {
                sql: sql.to_string(),
                db_name: self.db_name.clone(),
                timeout_secs: STORE_TIMEOUT_SECS,
                limit: STORE_ROW_LIMIT,
                allow_mutation: true,
                respond_to: tx,
            })
            .await
            .map_err(|_| "session store unavailable: executor closed".to_string())?;

        let result = rx
            .await
            .map_err(|_| "session store unavailable: executor died".to_string())??;

        if !result.success {
            return Err(result
                .error
                .unwrap_or_else(|| "session store statement failed".to_string()));
        }
        Ok(result)
    }

    pub async fn create(&self, session_id: &str, db_name: Option<&str>) -> Result<Session, String> {
        let session = Session::new(session_id.to_string(), db_name.map(|s| s.to_string()));
        let sql = format!(
            "INSERT INTO easysql_sessions (id, db_name, status, created_at, updated_at)
             VALUES ({}, {}, {}, {}, {})",
            quote(session_id),
            quote_opt(&session.db_name),
            quote(session.status.as_str()),
            quote_timestamp(&session.created_at),
            quote_timestamp(&session.updated_at),
        );
        self.run(&sql).await?;
        Ok(session)
    }

    pub async fn get(&self, session_id: &str) -> Option<Session> {
        let sql = format!(
            "SELECT id, db_name, status, created_at, updated_at, raw_query, generated_sql,
                    validation_passed, state, title
             FROM easysql_sessions WHERE id = {}",
            quote(session_id)
        );
        let result = self.run(&sql).await.ok()?;
        if result.rows.is_empty() {
            return None;
        }

        let mut session = Session::new(
            session_id.to_string(),
            cell(&result, 0, "db_name").as_str().map(|s| s.to_string()),
        );
        session.status = QueryStatus::parse(cell(&result, 0, "status").as_str().unwrap_or(""));
        session.created_at = parse_timestamp(cell(&result, 0, "created_at"));
        session.updated_at = parse_timestamp(cell(&result, 0, "updated_at"));
        session.raw_query = cell(&result, 0, "raw_query").as_str().map(|s| s.to_string());
        session.generated_sql = cell(&result, 0, "generated_sql")
            .as_str()
            .map(|s| s.to_string());
        session.validation_passed = cell(&result, 0, "validation_passed").as_bool();
        session.state = match cell(&result, 0, "state") {
            Value::Null => None,
            Value::String(s) => serde_json::from_str(s).ok(),
            other => Some(other.clone()),
        };
        session.title = cell(&result, 0, "title").as_str().map(|s| s.to_string());

        session.restore_turns(self.load_turns(session_id).await.unwrap_or_default());
        session.messages = self.load_messages(session_id).await.unwrap_or_default();
        Some(session)
    }

    async fn load_turns(&self, session_id: &str) -> Result<Vec<Turn>, String> {
        let sql = format!(
            "SELECT turn_id, question, status, final_sql, validation_passed, error,
                    chart_plan, chart_reasoning, position, created_at
             FROM easysql_turns WHERE session_id = {} ORDER BY position",
            quote(session_id)
        );
        let result = self.run(&sql).await?;

        let mut turns = Vec::with_capacity(result.rows.len());
        for i in 0..result.rows.len() {
            let mut turn = Turn::new(
                cell(&result, i, "turn_id").as_str().unwrap_or("").to_string(),
                cell(&result, i, "question").as_str().unwrap_or("").to_string(),
                cell(&result, i, "position").as_i64().unwrap_or(0) as i32,
            );
            turn.status = QueryStatus::parse(cell(&result, i, "status").as_str().unwrap_or(""));
            turn.final_sql = cell(&result, i, "final_sql").as_str().map(|s| s.to_string());
            turn.validation_passed = cell(&result, i, "validation_passed").as_bool();
            turn.error = cell(&result, i, "error").as_str().map(|s| s.to_string());
            turn.chart_plan = match cell(&result, i, "chart_plan") {
                Value::Null => None,
                Value::String(s) => serde_json::from_str(s).ok(),
                other => Some(other.clone()),
            };
            turn.chart_reasoning = cell(&result, i, "chart_reasoning")
                .as_str()
                .map(|s| s.to_string());
            turn.created_at = parse_timestamp(cell(&result, i, "created_at"));
            turns.push(turn);
        }

        // Attach clarifications.
        let sql = format!(
            "SELECT t.turn_id AS turn_key, c.position, c.questions, c.answer, c.created_at
             FROM easysql_turn_clarifications c
             JOIN easysql_turns t ON c.turn_id = t.id
             WHERE t.session_id = {}
             ORDER BY t.position, c.position",
            quote(session_id)
        );
        let result = self.run(&sql).await?;
        for i in 0..result.rows.len() {
            let turn_key = cell(&result, i, "turn_key").as_str().unwrap_or("").to_string();
            if let Some(turn) = turns.iter_mut().find(|t| t.turn_id == turn_key) {
                turn.clarifications.push(Clarification {
                    questions: parse_text_array(cell(&result, i, "questions")),
                    answer: cell(&result, i, "answer").as_str().map(|s| s.to_string()),
                    created_at: parse_timestamp(cell(&result, i, "created_at")),
                });
            }
        }

        Ok(turns)
    }

    async fn load_messages(&self, session_id: &str) -> Result<HashMap<String, Message>, String> {
        let sql = format!(
            "SELECT id, parent_id, role, content, generated_sql, tables_used, validation_passed,
                    checkpoint_id, token_count, created_at, is_few_shot, user_answer,
                    clarification_questions, thread_id, branch_id, root_message_id
             FROM easysql_messages WHERE session_id = {}",
            quote(session_id)
        );
        let result = self.run(&sql).await?;

        let mut messages = HashMap::new();
        for i in 0..result.rows.len() {
            let message_id = cell(&result, i, "id").as_str().unwrap_or("").to_string();
            let clarifications = match cell(&result, i, "clarification_questions") {
                Value::Null => None,
                Value::String(s) => serde_json::from_str::<Vec<String>>(s).ok(),
                other => serde_json::from_value(other.clone()).ok(),
            };
            messages.insert(
                message_id.clone(),
                Message {
                    message_id,
                    session_id: session_id.to_string(),
                    thread_id: cell(&result, i, "thread_id")
                        .as_str()
                        .unwrap_or(session_id)
                        .to_string(),
                    parent_id: cell(&result, i, "parent_id").as_str().map(|s| s.to_string()),
                    role: match cell(&result, i, "role").as_str() {
                        Some("assistant") => MessageRole::Assistant,
                        _ => MessageRole::User,
                    },
                    content: cell(&result, i, "content").as_str().map(|s| s.to_string()),
                    generated_sql: cell(&result, i, "generated_sql")
                        .as_str()
                        .map(|s| s.to_string()),
                    tables_used: parse_text_array(cell(&result, i, "tables_used")),
                    validation_passed: cell(&result, i, "validation_passed").as_bool(),
                    user_answer: cell(&result, i, "user_answer").as_str().map(|s| s.to_string()),
                    clarification_questions: clarifications,
                    is_few_shot: cell(&result, i, "is_few_shot").as_bool().unwrap_or(false),
                    token_count: cell(&result, i, "token_count").as_i64(),
                    branch_id: cell(&result, i, "branch_id").as_str().map(|s| s.to_string()),
                    root_message_id: cell(&result, i, "root_message_id")
                        .as_str()
                        .map(|s| s.to_string()),
                    checkpoint_id: cell(&result, i, "checkpoint_id")
                        .as_str()
                        .map(|s| s.to_string()),
                    created_at: parse_timestamp(cell(&result, i, "created_at")),
                },
            );
        }
        Ok(messages)
    }

    /// Write the session projection plus its turns and messages. Turns are
    /// replaced wholesale (they are small and the canonical view).
    pub async fn update(&self, session: &Session) -> Result<(), String> {
        let sql = format!(
            "UPDATE easysql_sessions SET db_name = {}, status = {}, updated_at = {},
                    raw_query = {}, generated_sql = {}, validation_passed = {},
                    state = {}, title = {}
             WHERE id = {}",
            quote_opt(&session.db_name),
            quote(session.status.as_str()),
            quote_timestamp(&session.updated_at),
            quote_opt(&session.raw_query),
            quote_opt(&session.generated_sql),
            quote_bool_opt(session.validation_passed),
            quote_jsonb_opt(&session.state),
            quote_opt(&session.title),
            quote(&session.session_id),
        );
        self.run(&sql).await?;

        self.save_turns(session).await?;
        self.save_messages(session).await?;
        Ok(())
    }

    async fn save_turns(&self, session: &Session) -> Result<(), String> {
        self.run(&format!(
            "DELETE FROM easysql_turns WHERE session_id = {}",
            quote(&session.session_id)
        ))
        .await?;

        for turn in &session.turns {
            let turn_uuid = Uuid::new_v4().to_string();
            let sql = format!(
                "INSERT INTO easysql_turns
                 (id, session_id, turn_id, question, status, final_sql, validation_passed,
                  error, chart_plan, chart_reasoning, position, created_at)
                 VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})",
                quote(&turn_uuid),
                quote(&session.session_id),
                quote(&turn.turn_id),
                quote(&turn.question),
                quote(turn.status.as_str()),
                quote_opt(&turn.final_sql),
                quote_bool_opt(turn.validation_passed),
                quote_opt(&turn.error),
                quote_jsonb_opt(&turn.chart_plan),
                quote_opt(&turn.chart_reasoning),
                turn.position,
                quote_timestamp(&turn.created_at),
            );
            self.run(&sql).await?;

            for (position, clarification) in turn.clarifications.iter().enumerate() {
                let sql = format!(
                    "INSERT INTO easysql_turn_clarifications
                     (id, turn_id, position, questions, answer, created_at)
                     VALUES ({}, {}, {}, {}, {}, {})",
                    quote(&Uuid::new_v4().to_string()),
                    quote(&turn_uuid),
                    position,
                    quote_text_array(&clarification.questions),
                    quote_opt(&clarification.answer),
                    quote_timestamp(&clarification.created_at),
                );
                self.run(&sql).await?;
            }
        }
        Ok(())
    }

    async fn save_messages(&self, session: &Session) -> Result<(), String> {
        for message in session.messages.values() {
            let clarifications_json = message
                .clarification_questions
                .as_ref()
                .map(|q| serde_json::to_value(q).unwrap_or(Value::Null));
            let sql = format!(
                "INSERT INTO easysql_messages
                 (id, session_id, parent_id, role, content, generated_sql, tables_used,
                  validation_passed, checkpoint_id, token_count, created_at, is_few_shot,
                  user_answer, clarification_questions, thread_id, branch_id, root_message_id)
                 VALUES ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {})
                 ON CONFLICT (id) DO UPDATE SET
                   content = EXCLUDED.content,
                   generated_sql = EXCLUDED.generated_sql,
                   tables_used = EXCLUDED.tables_used,
                   validation_passed = EXCLUDED.validation_passed,
                   is_few_shot = EXCLUDED.is_few_shot,
                   user_answer = EXCLUDED.user_answer",
                quote(&message.message_id),
                quote(&session.session_id),
                quote_opt(&message.parent_id),
                quote(match message.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                }),
                quote_opt(&message.content),
                quote_opt(&message.generated_sql),
                quote_text_array(&message.tables_used),
                quote_bool_opt(message.validation_passed),
                quote_opt(&message.checkpoint_id),
                message
                    .token_count
                    .map(|t| t.to_string())
                    .unwrap_or_else(|| "NULL".to_string()),
                quote_timestamp(&message.created_at),
                if message.is_few_shot { "TRUE" } else { "FALSE" },
                quote_opt(&message.user_answer),
                quote_jsonb_opt(&clarifications_json),
                quote(&message.thread_id),
                quote_opt(&message.branch_id),
                quote_opt(&message.root_message_id),
            );
            self.run(&sql).await?;
        }
        Ok(())
    }

    pub async fn update_status(&self, session_id: &str, status: QueryStatus) -> Result<(), String> {
        let sql = format!(
            "UPDATE easysql_sessions SET status = {}, updated_at = {} WHERE id = {}",
            quote(status.as_str()),
            quote_timestamp(&Utc::now()),
            quote(session_id),
        );
        self.run(&sql).await.map(|_| ())
    }

    pub async fn delete(&self, session_id: &str) -> Result<bool, String> {
        // Cascades remove messages, turns, and clarifications.
        let result = self
            .run(&format!(
                "DELETE FROM easysql_sessions WHERE id = {}",
                quote(session_id)
            ))
            .await?;
        Ok(result.affected_rows.map(|n| n > 0).unwrap_or(true))
    }

    pub async fn list_all(&self, limit: usize, offset: usize) -> Result<Vec<Session>, String> {
        let sql = format!(
            "SELECT id FROM easysql_sessions ORDER BY updated_at DESC LIMIT {} OFFSET {}",
            limit, offset
        );
        let result = self.run(&sql).await?;

        let mut sessions = Vec::new();
        for i in 0..result.rows.len() {
            if let Some(id) = cell(&result, i, "id").as_str() {
                if let Some(session) = self.get(id).await {
                    sessions.push(session);
                }
            }
        }
        Ok(sessions)
    }

    pub async fn count(&self) -> usize {
        let result = self.run("SELECT COUNT(*) AS n FROM easysql_sessions").await;
        result
            .ok()
            .and_then(|r| cell(&r, 0, "n").as_i64())
            .unwrap_or(0) as usize
    }

    pub async fn get_message(&self, message_id: &str) -> Option<Message> {
        let sql = format!(
            "SELECT session_id FROM easysql_messages WHERE id = {}",
            quote(message_id)
        );
        let result = self.run(&sql).await.ok()?;
        let session_id = cell(&result, 0, "session_id").as_str()?.to_string();
        let messages = self.load_messages(&session_id).await.ok()?;
        messages.get(message_id).cloned()
    }

    pub async fn mark_as_few_shot(&self, message_id: &str) -> Result<Message, String> {
        self.run(&format!(
            "UPDATE easysql_messages SET is_few_shot = TRUE WHERE id = {}",
            quote(message_id)
        ))
        .await?;

        self.get_message(message_id)
            .await
            .ok_or_else(|| format!("Message {} not found", message_id))
    }

    pub async fn save_checkpoint(&self, thread_id: &str, checkpoint: Value) -> Result<(), String> {
        self.checkpoints
            .write()
            .await
            .insert(thread_id.to_string(), checkpoint);
        Ok(())
    }

    pub async fn load_checkpoint(&self, thread_id: &str) -> Option<Value> {
        self.checkpoints.read().await.get(thread_id).cloned()
    }

    pub async fn delete_checkpoint(&self, thread_id: &str) {
        self.checkpoints.write().await.remove(thread_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_escapes_single_quotes() {
        assert_eq!(quote("O'Hare"), "'O''Hare'");
        assert_eq!(quote_opt(&None), "NULL");
    }

    #[test]
    fn test_quote_text_array() {
        assert_eq!(quote_text_array(&[]), "'{}'::text[]");
        assert_eq!(
            quote_text_array(&["patient".to_string(), "visit".to_string()]),
            "ARRAY['patient', 'visit']::text[]"
        );
    }

    #[test]
    fn test_parse_text_array_both_shapes() {
        let json_shape = serde_json::json!(["a", "b"]);
        assert_eq!(parse_text_array(&json_shape), vec!["a", "b"]);

        let pg_shape = Value::String("{a,b}".to_string());
        assert_eq!(parse_text_array(&pg_shape), vec!["a", "b"]);

        assert!(parse_text_array(&Value::Null).is_empty());
    }

    #[test]
    fn test_migrations_carry_required_constraints() {
        let all = MIGRATIONS.join("\n");
        assert!(all.contains("ON DELETE CASCADE"));
        assert!(all.contains("UNIQUE (session_id, turn_id)"));
        assert!(all.contains("WHERE is_few_shot"));
        assert!(all.contains("idx_easysql_messages_parent"));
    }
}
