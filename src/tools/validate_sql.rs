//! validate_sql tool: prove a statement executable with a LIMIT 1 probe.

use tokio::sync::{mpsc, oneshot};

use crate::actors::sql_executor_actor::SqlExecMsg;

/// Executor for the validate_sql built-in tool.
pub struct ValidateSqlExecutor {
    sql_tx: mpsc::Sender<SqlExecMsg>,
    db_name: String,
    timeout_secs: u64,
}

impl ValidateSqlExecutor {
    pub fn new(sql_tx: mpsc::Sender<SqlExecMsg>, db_name: String, timeout_secs: u64) -> Self {
        Self {
            sql_tx,
            db_name,
            timeout_secs,
        }
    }

    /// Run the probe. Returns `"SUCCESS: ..."` or `"ERROR: ..."` as the
    /// tool observation.
    pub async fn execute(&self, sql: &str) -> String {
        if sql.trim().is_empty() {
            return "ERROR: empty SQL".to_string();
        }

        let sql_to_run = probe_sql(sql);

        let (tx, rx) = oneshot::channel();
        let sent = self
            .sql_tx
            .send(SqlExecMsg::Execute {
                sql: sql_to_run,
                db_name: self.db_name.clone(),
                timeout_secs: self.timeout_secs,
                limit: 1,
                allow_mutation: false,
                respond_to: tx,
            })
            .await;

        if sent.is_err() {
            return "ERROR: sql executor unavailable".to_string();
        }

        match rx.await {
            Ok(Ok(result)) if result.success => {
                "SUCCESS: SQL is valid and can be executed.".to_string()
            }
            Ok(Ok(result)) => format!(
                "ERROR: {}",
                result.error.unwrap_or_else(|| "validation failed".to_string())
            ),
            Ok(Err(e)) => format!("ERROR: {}", e),
            Err(_) => "ERROR: sql executor died".to_string(),
        }
    }
}

/// Append `LIMIT 1` to SELECTs that carry no LIMIT yet.
fn probe_sql(sql: &str) -> String {
    let upper = sql.trim().to_uppercase();
    if upper.starts_with("SELECT") && !upper.contains("LIMIT") {
        format!("{} LIMIT 1", sql.trim().trim_end_matches(';'))
    } else {
        sql.to_string()
    }
}

/// Whether a tool observation reports success.
pub fn is_tool_success(output: &str) -> bool {
    let lower = output.to_lowercase();
    lower.starts_with("success") || (lower.contains("success") && !lower.contains("error"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_sql_appends_limit() {
        assert_eq!(
            probe_sql("SELECT * FROM patient"),
            "SELECT * FROM patient LIMIT 1"
        );
        assert_eq!(
            probe_sql("SELECT * FROM patient LIMIT 5"),
            "SELECT * FROM patient LIMIT 5"
        );
        assert_eq!(
            probe_sql("SELECT * FROM patient;"),
            "SELECT * FROM patient LIMIT 1"
        );
    }

    #[test]
    fn test_is_tool_success() {
        assert!(is_tool_success("SUCCESS: SQL is valid and can be executed."));
        assert!(!is_tool_success("ERROR: no such column: foo"));
        assert!(!is_tool_success("The operation raised an error before success"));
    }
}
