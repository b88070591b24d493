//! search_objects tool: live database introspection for the SQL agent.

use tokio::sync::{mpsc, oneshot};

use crate::actors::sql_executor_actor::{ObjectType, SqlExecMsg};

/// Executor for the search_objects built-in tool.
pub struct SearchObjectsExecutor {
    sql_tx: mpsc::Sender<SqlExecMsg>,
    db_name: String,
}

impl SearchObjectsExecutor {
    pub fn new(sql_tx: mpsc::Sender<SqlExecMsg>, db_name: String) -> Self {
        Self { sql_tx, db_name }
    }

    pub async fn execute(&self, object_type: &str, pattern: &str, detail_level: &str) -> String {
        let object_type = match object_type {
            "table" => ObjectType::Table,
            "column" => ObjectType::Column,
            "index" => ObjectType::Index,
            other => return format!("ERROR: Unsupported object_type: {}", other),
        };

        let detail_level = if detail_level.is_empty() {
            "names"
        } else {
            detail_level
        };

        let (tx, rx) = oneshot::channel();
        let sent = self
            .sql_tx
            .send(SqlExecMsg::SearchObjects {
                db_name: self.db_name.clone(),
                object_type,
                pattern: pattern.to_string(),
                detail_level: detail_level.to_string(),
                respond_to: tx,
            })
            .await;

        if sent.is_err() {
            return "ERROR: sql executor unavailable".to_string();
        }

        match rx.await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => format!("ERROR: {}", e),
            Err(_) => "ERROR: sql executor died".to_string(),
        }
    }
}
