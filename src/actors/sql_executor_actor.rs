//! SQL Executor Actor - dialect-aware validation and execution.
//!
//! This actor handles:
//! - Executing SELECT statements with a timeout, row limiting, and timing
//! - Syntax probing via the dialect-appropriate EXPLAIN variant
//! - Static safety classification (mutation and dangerous-pattern detection)
//! - Live object introspection (`search_objects`) for the SQL agent
//!
//! Two backends: embedded SQLite files through rusqlite (blocking tasks),
//! and an HTTP SQL gateway for postgresql/mysql/oracle/sqlserver targets.

use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

use crate::errors::EngineError;
use crate::settings::{AppSettings, DatabaseKind};

// ============ Safety Classification ============

lazy_static! {
    static ref MUTATION_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"\bINSERT\s+INTO\b").unwrap(),
        Regex::new(r"\bUPDATE\s+\w+\s+SET\b").unwrap(),
        Regex::new(r"\bDELETE\s+FROM\b").unwrap(),
        Regex::new(r"\bTRUNCATE\s+").unwrap(),
        Regex::new(r"\bDROP\s+").unwrap(),
        Regex::new(r"\bALTER\s+").unwrap(),
        Regex::new(r"\bCREATE\s+").unwrap(),
        Regex::new(r"\bGRANT\s+").unwrap(),
        Regex::new(r"\bREVOKE\s+").unwrap(),
    ];
    static ref DANGEROUS_PATTERNS: Vec<(Regex, &'static str)> = vec![
        (Regex::new(r"\bDROP\s+DATABASE\b").unwrap(), "DROP DATABASE detected"),
        (Regex::new(r"\bDROP\s+TABLE\b").unwrap(), "DROP TABLE detected"),
        (Regex::new(r"\bTRUNCATE\s+TABLE\b").unwrap(), "TRUNCATE TABLE detected"),
        (
            Regex::new(r"\bDELETE\s+FROM\s+\w+\s*(;|$)").unwrap(),
            "DELETE without WHERE clause",
        ),
        (
            Regex::new(r"\bUPDATE\s+\w+\s+SET\s+.*(WHERE\s+1\s*=\s*1|WHERE\s+TRUE)").unwrap(),
            "UPDATE with always-true WHERE",
        ),
    ];
    static ref LIMIT_CLAUSE: Regex = Regex::new(r"\bLIMIT\s+\d+").unwrap();
}

/// Static classification of a SQL statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlCheckResult {
    pub safe: bool,
    pub is_mutation: bool,
    pub statement_type: String,
    pub warnings: Vec<String>,
}

/// Classify SQL by regex over its uppercased normalized form. Pure.
pub fn check_sql(sql: &str) -> SqlCheckResult {
    let normalized = sql.trim().to_uppercase();

    let is_mutation = MUTATION_PATTERNS.iter().any(|p| p.is_match(&normalized));

    let warnings: Vec<String> = DANGEROUS_PATTERNS
        .iter()
        .filter(|(p, _)| p.is_match(&normalized))
        .map(|(_, msg)| msg.to_string())
        .collect();

    let statement_type = ["SELECT", "INSERT", "UPDATE", "DELETE", "CREATE", "DROP", "ALTER"]
        .iter()
        .find(|kw| normalized.starts_with(*kw))
        .map(|kw| kw.to_string())
        .unwrap_or_else(|| "OTHER".to_string());

    SqlCheckResult {
        safe: warnings.is_empty(),
        is_mutation,
        statement_type,
        warnings,
    }
}

/// Append `LIMIT n` to SELECTs that have no LIMIT clause yet.
pub fn apply_row_limit(sql: &str, limit: usize) -> String {
    let normalized = sql.trim().to_uppercase();
    if !normalized.starts_with("SELECT") || LIMIT_CLAUSE.is_match(&normalized) {
        return sql.to_string();
    }
    format!("{} LIMIT {}", sql.trim_end().trim_end_matches(';'), limit)
}

// ============ Results & Messages ============

/// Result from SQL execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqlExecutionResult {
    pub success: bool,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    #[serde(default)]
    pub affected_rows: Option<usize>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub execution_time_ms: f64,
    #[serde(default)]
    pub truncated: bool,
}

impl SqlExecutionResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            columns: vec![],
            rows: vec![],
            row_count: 0,
            affected_rows: None,
            error: Some(error.into()),
            execution_time_ms: 0.0,
            truncated: false,
        }
    }
}

/// Object kinds `search_objects` understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Table,
    Column,
    Index,
}

/// Messages for the SQL Executor Actor.
#[derive(Debug)]
pub enum SqlExecMsg {
    /// Execute SQL with the full guard rails (safety gate, limit, timeout).
    Execute {
        sql: String,
        db_name: String,
        timeout_secs: u64,
        limit: usize,
        allow_mutation: bool,
        respond_to: oneshot::Sender<Result<SqlExecutionResult, String>>,
    },
    /// Dialect-appropriate syntax probe. Never returns rows.
    CheckSyntax {
        sql: String,
        db_name: String,
        respond_to: oneshot::Sender<Result<SqlExecutionResult, String>>,
    },
    /// Live introspection over tables/columns/indexes.
    SearchObjects {
        db_name: String,
        object_type: ObjectType,
        pattern: String,
        detail_level: String,
        respond_to: oneshot::Sender<Result<String, String>>,
    },
}

/// Resolved execution backend for one database.
#[derive(Debug, Clone)]
enum Backend {
    Sqlite { path: PathBuf },
    Gateway { url: String, kind: DatabaseKind },
}

/// SQL Executor Actor.
pub struct SqlExecutorActor {
    rx: mpsc::Receiver<SqlExecMsg>,
    settings: AppSettings,
    http_client: reqwest::Client,
}

impl SqlExecutorActor {
    pub fn new(rx: mpsc::Receiver<SqlExecMsg>, settings: AppSettings) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("http client");
        Self {
            rx,
            settings,
            http_client,
        }
    }

    /// Run the actor's message loop.
    pub async fn run(mut self) {
        println!("[SqlExecutorActor] Started");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                SqlExecMsg::Execute {
                    sql,
                    db_name,
                    timeout_secs,
                    limit,
                    allow_mutation,
                    respond_to,
                } => {
                    let result = self
                        .execute(&sql, &db_name, timeout_secs, limit, allow_mutation)
                        .await;
                    let _ = respond_to.send(result);
                }
                SqlExecMsg::CheckSyntax {
                    sql,
                    db_name,
                    respond_to,
                } => {
                    let result = self.check_syntax(&sql, &db_name).await;
                    let _ = respond_to.send(result);
                }
                SqlExecMsg::SearchObjects {
                    db_name,
                    object_type,
                    pattern,
                    detail_level,
                    respond_to,
                } => {
                    let result = self
                        .search_objects(&db_name, object_type, &pattern, &detail_level)
                        .await;
                    let _ = respond_to.send(result);
                }
            }
        }

        println!("[SqlExecutorActor] Stopped");
    }

    fn backend(&self, db_name: &str) -> Result<Backend, String> {
        let config = self
            .settings
            .database(db_name)
            .ok_or_else(|| format!("Database '{}' not configured", db_name))?;

        match config.kind {
            DatabaseKind::Sqlite => {
                let path = config
                    .path
                    .clone()
                    .ok_or_else(|| format!("Database '{}' has no sqlite path", db_name))?;
                Ok(Backend::Sqlite {
                    path: PathBuf::from(path),
                })
            }
            kind => {
                let url = config
                    .gateway_url
                    .clone()
                    .ok_or_else(|| format!("Database '{}' has no gateway_url", db_name))?;
                Ok(Backend::Gateway { url, kind })
            }
        }
    }

    async fn execute(
        &self,
        sql: &str,
        db_name: &str,
        timeout_secs: u64,
        limit: usize,
        allow_mutation: bool,
    ) -> Result<SqlExecutionResult, String> {
        let check = check_sql(sql);

        if check.is_mutation && !allow_mutation {
            return Err(EngineError::Forbidden(format!(
                "Mutation statement ({}) not allowed. Set allow_mutation=true to enable.",
                check.statement_type
            ))
            .to_string());
        }
        if !check.safe && !allow_mutation {
            return Err(EngineError::Forbidden(format!(
                "Dangerous SQL detected: {}",
                check.warnings.join(", ")
            ))
            .to_string());
        }

        let timeout_secs = timeout_secs.min(self.settings.execution.max_timeout_secs);

        // LIMIT N+1: one extra row tells us the result was truncated.
        let sql_to_run = if check.statement_type == "SELECT" {
            apply_row_limit(sql, limit + 1)
        } else {
            sql.to_string()
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.run_raw(&sql_to_run, db_name),
        )
        .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                // The in-flight probe may run to completion; its result is
                // discarded.
                return Err(EngineError::Timeout(timeout_secs).to_string());
            }
        };

        if result.success && result.rows.len() > limit {
            result.rows.truncate(limit);
            result.row_count = result.rows.len();
            result.truncated = true;
        }
        result.execution_time_ms = (elapsed_ms * 100.0).round() / 100.0;

        println!(
            "[SqlExecutorActor] Executed on {} in {:.1}ms: {} rows{}",
            db_name,
            result.execution_time_ms,
            result.row_count,
            if result.truncated { " (truncated)" } else { "" }
        );

        Ok(result)
    }

    async fn check_syntax(&self, sql: &str, db_name: &str) -> Result<SqlExecutionResult, String> {
        let backend = self.backend(db_name)?;
        let kind = match &backend {
            Backend::Sqlite { .. } => DatabaseKind::Sqlite,
            Backend::Gateway { kind, .. } => *kind,
        };

        let probe = format!("{} {}", kind.explain_prefix(), sql);

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(self.settings.execution.default_timeout_secs),
            self.run_raw(&probe, db_name),
        )
        .await;

        let mut result = match outcome {
            Ok(Ok(mut result)) => {
                // A probe's rows are plan output, not data.
                result.rows.clear();
                result.columns.clear();
                result.row_count = 0;
                result
            }
            Ok(Err(e)) => SqlExecutionResult::failure(e),
            Err(_) => SqlExecutionResult::failure(format!(
                "Probe timeout after {}s",
                self.settings.execution.default_timeout_secs
            )),
        };

        result.execution_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        Ok(result)
    }

    /// Run raw SQL against whichever backend serves the database.
    async fn run_raw(&self, sql: &str, db_name: &str) -> Result<SqlExecutionResult, String> {
        match self.backend(db_name)? {
            Backend::Sqlite { path } => {
                let sql = sql.to_string();
                tokio::task::spawn_blocking(move || execute_sqlite(&path, &sql))
                    .await
                    .map_err(|e| format!("SQL execution task panicked: {}", e))?
            }
            Backend::Gateway { url, kind } => {
                self.execute_via_gateway(&url, kind, db_name, sql).await
            }
        }
    }

    async fn execute_via_gateway(
        &self,
        url: &str,
        kind: DatabaseKind,
        db_name: &str,
        sql: &str,
    ) -> Result<SqlExecutionResult, String> {
        let body = json!({
            "db_name": db_name,
            "dialect": kind.dialect_name(),
            "sql": sql,
        });

        let response = self
            .http_client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("SQL gateway unreachable: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(format!("SQL gateway HTTP {}: {}", status, text));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| format!("SQL gateway returned invalid JSON: {}", e))?;

        let success = payload["success"].as_bool().unwrap_or(false);
        if !success {
            let error = payload["error"].as_str().unwrap_or("unknown gateway error");
            return Ok(SqlExecutionResult::failure(error));
        }

        let columns: Vec<String> = payload["columns"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let rows: Vec<Vec<Value>> = payload["rows"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|r| r.as_array().cloned())
                    .collect()
            })
            .unwrap_or_default();
        let row_count = rows.len();

        Ok(SqlExecutionResult {
            success: true,
            columns,
            rows,
            row_count,
            affected_rows: payload["affected_rows"].as_u64().map(|n| n as usize),
            error: None,
            execution_time_ms: 0.0,
            truncated: false,
        })
    }

    async fn search_objects(
        &self,
        db_name: &str,
        object_type: ObjectType,
        pattern: &str,
        detail_level: &str,
    ) -> Result<String, String> {
        let pattern = if pattern.trim().is_empty() {
            "%".to_string()
        } else {
            pattern.trim().to_string()
        };

        match self.backend(db_name)? {
            Backend::Sqlite { path } => {
                let detail = detail_level.to_string();
                tokio::task::spawn_blocking(move || {
                    search_objects_sqlite(&path, object_type, &pattern, &detail)
                })
                .await
                .map_err(|e| format!("Introspection task panicked: {}", e))?
            }
            Backend::Gateway { url, kind } => {
                let sql = introspection_sql(kind, object_type, &pattern);
                let result = self.execute_via_gateway(&url, kind, db_name, &sql).await?;
                if !result.success {
                    return Err(result.error.unwrap_or_else(|| "introspection failed".into()));
                }
                let lines: Vec<String> = result
                    .rows
                    .iter()
                    .take(30)
                    .map(|row| {
                        row.iter()
                            .map(|v| v.as_str().map(|s| s.to_string()).unwrap_or_else(|| v.to_string()))
                            .collect::<Vec<_>>()
                            .join(": ")
                    })
                    .collect();
                Ok(format!(
                    "Found {} {:?} objects:\n{}",
                    result.row_count,
                    object_type,
                    lines.join("\n")
                ))
            }
        }
    }
}

// ============ SQLite Backend ============

fn execute_sqlite(path: &PathBuf, sql: &str) -> Result<SqlExecutionResult, String> {
    let conn = Connection::open(path).map_err(|e| format!("Failed to open database: {}", e))?;

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return Ok(SqlExecutionResult::failure(e.to_string())),
    };

    let columns: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let column_count = stmt.column_count();

    let mut rows_iter = match stmt.query([]) {
        Ok(r) => r,
        Err(e) => return Ok(SqlExecutionResult::failure(e.to_string())),
    };

    let mut rows: Vec<Vec<Value>> = Vec::new();
    loop {
        match rows_iter.next() {
            Ok(Some(row)) => {
                let mut values = Vec::with_capacity(column_count);
                for i in 0..column_count {
                    values.push(rusqlite_to_json(row, i));
                }
                rows.push(values);
            }
            Ok(None) => break,
            Err(e) => return Ok(SqlExecutionResult::failure(e.to_string())),
        }
    }

    let row_count = rows.len();
    Ok(SqlExecutionResult {
        success: true,
        columns,
        rows,
        row_count,
        affected_rows: None,
        error: None,
        execution_time_ms: 0.0,
        truncated: false,
    })
}

/// Convert a rusqlite value to serde_json::Value.
fn rusqlite_to_json(row: &rusqlite::Row, idx: usize) -> Value {
    if let Ok(v) = row.get::<_, i64>(idx) {
        return Value::Number(v.into());
    }
    if let Ok(v) = row.get::<_, f64>(idx) {
        return serde_json::Number::from_f64(v)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.get::<_, String>(idx) {
        return Value::String(v);
    }
    Value::Null
}

fn search_objects_sqlite(
    path: &PathBuf,
    object_type: ObjectType,
    pattern: &str,
    detail_level: &str,
) -> Result<String, String> {
    let conn = Connection::open(path).map_err(|e| format!("Failed to open database: {}", e))?;

    match object_type {
        ObjectType::Table => {
            let mut stmt = conn
                .prepare(
                    "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE ?1 ORDER BY name",
                )
                .map_err(|e| e.to_string())?;
            let tables: Vec<String> = stmt
                .query_map([pattern], |row| row.get::<_, String>(0))
                .map_err(|e| e.to_string())?
                .filter_map(|r| r.ok())
                .collect();

            match detail_level {
                "names" => Ok(format!(
                    "Found {} tables: {:?}",
                    tables.len(),
                    tables.iter().take(20).collect::<Vec<_>>()
                )),
                _ => {
                    let mut lines = Vec::new();
                    for table in tables.iter().take(if detail_level == "full" { 5 } else { 10 }) {
                        let mut col_stmt = conn
                            .prepare(&format!("PRAGMA table_info('{}')", table.replace('\'', "''")))
                            .map_err(|e| e.to_string())?;
                        let cols: Vec<(String, String, bool)> = col_stmt
                            .query_map([], |row| {
                                Ok((
                                    row.get::<_, String>(1)?,
                                    row.get::<_, String>(2)?,
                                    row.get::<_, i64>(5)? > 0,
                                ))
                            })
                            .map_err(|e| e.to_string())?
                            .filter_map(|r| r.ok())
                            .collect();

                        if detail_level == "full" {
                            let col_lines: Vec<String> = cols
                                .iter()
                                .map(|(name, ty, _)| format!("  - {}: {}", name, ty))
                                .collect();
                            lines.push(format!("{}:\n{}", table, col_lines.join("\n")));
                        } else {
                            let pks: Vec<&str> = cols
                                .iter()
                                .filter(|(_, _, pk)| *pk)
                                .map(|(name, _, _)| name.as_str())
                                .collect();
                            lines.push(format!("{}: {} columns, PK: {:?}", table, cols.len(), pks));
                        }
                    }
                    Ok(lines.join(if detail_level == "full" { "\n\n" } else { "\n" }))
                }
            }
        }
        ObjectType::Column => {
            let mut tables_stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name LIMIT 50")
                .map_err(|e| e.to_string())?;
            let tables: Vec<String> = tables_stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| e.to_string())?
                .filter_map(|r| r.ok())
                .collect();

            let glob = like_to_lower_glob(pattern);
            let mut matches = Vec::new();
            for table in tables {
                let mut col_stmt = conn
                    .prepare(&format!("PRAGMA table_info('{}')", table.replace('\'', "''")))
                    .map_err(|e| e.to_string())?;
                let cols: Vec<(String, String)> = col_stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
                    })
                    .map_err(|e| e.to_string())?
                    .filter_map(|r| r.ok())
                    .collect();
                for (name, ty) in cols {
                    if glob_match(&glob, &name.to_lowercase()) {
                        matches.push(format!("{}.{}: {}", table, name, ty));
                    }
                }
            }
            let total = matches.len();
            matches.truncate(30);
            Ok(format!("Found {} columns:\n{}", total, matches.join("\n")))
        }
        ObjectType::Index => {
            let mut stmt = conn
                .prepare(
                    "SELECT name, tbl_name FROM sqlite_master WHERE type = 'index' AND name LIKE ?1 ORDER BY name",
                )
                .map_err(|e| e.to_string())?;
            let indexes: Vec<String> = stmt
                .query_map([pattern], |row| {
                    Ok(format!(
                        "{}.{}",
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(0)?
                    ))
                })
                .map_err(|e| e.to_string())?
                .filter_map(|r| r.ok())
                .collect();
            Ok(format!(
                "Found {} indexes:\n{}",
                indexes.len(),
                indexes.iter().take(30).cloned().collect::<Vec<_>>().join("\n")
            ))
        }
    }
}

/// Translate a SQL LIKE pattern to a lowercase glob for in-process matching.
fn like_to_lower_glob(pattern: &str) -> String {
    pattern.to_lowercase().replace('%', "*").replace('_', "?")
}

/// Minimal glob matcher supporting `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn inner(p: &[char], t: &[char]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some('*'), _) => {
                inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..]))
            }
            (Some('?'), Some(_)) => inner(&p[1..], &t[1..]),
            (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
            _ => false,
        }
    }
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    inner(&p, &t)
}

/// Introspection SQL for gateway-backed dialects.
fn introspection_sql(kind: DatabaseKind, object_type: ObjectType, pattern: &str) -> String {
    let escaped = pattern.replace('\'', "''");
    match (kind, object_type) {
        (DatabaseKind::Oracle, ObjectType::Table) => format!(
            "SELECT table_name FROM all_tables WHERE LOWER(table_name) LIKE LOWER('{}')",
            escaped
        ),
        (DatabaseKind::Oracle, ObjectType::Column) => format!(
            "SELECT table_name, column_name, data_type FROM all_tab_columns WHERE LOWER(column_name) LIKE LOWER('{}')",
            escaped
        ),
        (DatabaseKind::Oracle, ObjectType::Index) => format!(
            "SELECT table_name, index_name FROM all_indexes WHERE LOWER(index_name) LIKE LOWER('{}')",
            escaped
        ),
        (_, ObjectType::Table) => format!(
            "SELECT table_name FROM information_schema.tables WHERE LOWER(table_name) LIKE LOWER('{}')",
            escaped
        ),
        (_, ObjectType::Column) => format!(
            "SELECT table_name, column_name, data_type FROM information_schema.columns WHERE LOWER(column_name) LIKE LOWER('{}')",
            escaped
        ),
        (_, ObjectType::Index) => format!(
            "SELECT tablename, indexname FROM pg_indexes WHERE LOWER(indexname) LIKE LOWER('{}')",
            escaped
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_sql_select_is_safe() {
        let result = check_sql("SELECT * FROM patient WHERE id = 1");
        assert!(result.safe);
        assert!(!result.is_mutation);
        assert_eq!(result.statement_type, "SELECT");
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_check_sql_detects_mutations() {
        for (sql, ty) in [
            ("INSERT INTO t VALUES (1)", "INSERT"),
            ("UPDATE t SET a = 1", "UPDATE"),
            ("DELETE FROM t WHERE id = 1", "DELETE"),
            ("DROP TABLE t", "DROP"),
            ("CREATE TABLE t (a int)", "CREATE"),
            ("ALTER TABLE t ADD COLUMN b int", "ALTER"),
        ] {
            let result = check_sql(sql);
            assert!(result.is_mutation, "expected mutation: {}", sql);
            assert_eq!(result.statement_type, ty);
        }
    }

    #[test]
    fn test_check_sql_dangerous_warnings() {
        let result = check_sql("DELETE FROM patient");
        assert!(result.is_mutation);
        assert!(!result.safe);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("DELETE without WHERE")));

        let result = check_sql("UPDATE patient SET name = 'x' WHERE 1=1");
        assert!(result.warnings.iter().any(|w| w.contains("always-true")));

        let result = check_sql("DROP DATABASE medical");
        assert!(result.warnings.iter().any(|w| w.contains("DROP DATABASE")));
    }

    #[test]
    fn test_check_sql_idempotent() {
        let sql = "DELETE FROM patient";
        assert_eq!(check_sql(sql), check_sql(sql));
    }

    #[test]
    fn test_apply_row_limit() {
        assert_eq!(
            apply_row_limit("SELECT * FROM t", 50),
            "SELECT * FROM t LIMIT 50"
        );
        assert_eq!(
            apply_row_limit("SELECT * FROM t LIMIT 10", 50),
            "SELECT * FROM t LIMIT 10"
        );
        assert_eq!(
            apply_row_limit("SELECT * FROM t;", 50),
            "SELECT * FROM t LIMIT 50"
        );
        assert_eq!(
            apply_row_limit("INSERT INTO t VALUES (1)", 50),
            "INSERT INTO t VALUES (1)"
        );
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("user*", "users"));
        assert!(glob_match("*date*", "visit_date"));
        assert!(glob_match("visit?date", "visit_date"));
        assert!(!glob_match("user*", "patient"));
    }

    #[tokio::test]
    async fn test_mutation_gate_never_reaches_database() {
        let settings: AppSettings = serde_json::from_str(
            r#"{"databases": [{"name": "medical", "kind": "sqlite", "path": "/nonexistent/never.db"}]}"#,
        )
        .unwrap();
        let (_tx, rx) = mpsc::channel(1);
        let actor = SqlExecutorActor::new(rx, settings);

        // The db path does not exist; a FORBIDDEN error proves the statement
        // was rejected before touching any backend.
        let err = actor
            .execute("DELETE FROM patient", "medical", 5, 100, false)
            .await
            .unwrap_err();
        assert!(err.contains("FORBIDDEN"));
        assert!(err.contains("Mutation statement"));
    }

    #[tokio::test]
    async fn test_execute_with_limit_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE nums (n INTEGER);
                 INSERT INTO nums VALUES (1),(2),(3),(4),(5);",
            )
            .unwrap();
        }

        let settings: AppSettings = serde_json::from_str(&format!(
            r#"{{"databases": [{{"name": "t", "kind": "sqlite", "path": "{}"}}]}}"#,
            db_path.display()
        ))
        .unwrap();
        let (_tx, rx) = mpsc::channel(1);
        let actor = SqlExecutorActor::new(rx, settings);

        let result = actor
            .execute("SELECT n FROM nums ORDER BY n", "t", 5, 3, false)
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.row_count, 3);
        assert!(result.truncated);
        assert!(result.execution_time_ms >= 0.0);

        let result = actor
            .execute("SELECT n FROM nums ORDER BY n", "t", 5, 10, false)
            .await
            .unwrap();
        assert_eq!(result.row_count, 5);
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_check_syntax_reports_bad_column() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch("CREATE TABLE patient (patient_id INTEGER, name TEXT);")
                .unwrap();
        }

        let settings: AppSettings = serde_json::from_str(&format!(
            r#"{{"databases": [{{"name": "t", "kind": "sqlite", "path": "{}"}}]}}"#,
            db_path.display()
        ))
        .unwrap();
        let (_tx, rx) = mpsc::channel(1);
        let actor = SqlExecutorActor::new(rx, settings);

        let good = actor
            .check_syntax("SELECT patient_id FROM patient", "t")
            .await
            .unwrap();
        assert!(good.success);

        let bad = actor
            .check_syntax("SELECT foo FROM patient", "t")
            .await
            .unwrap();
        assert!(!bad.success);
        assert!(bad.error.unwrap().contains("foo"));
    }

    #[tokio::test]
    async fn test_search_objects_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("t.db");
        {
            let conn = Connection::open(&db_path).unwrap();
            conn.execute_batch(
                "CREATE TABLE patient (patient_id INTEGER PRIMARY KEY, visit_date TEXT);
                 CREATE TABLE visit (visit_id INTEGER PRIMARY KEY, visit_date TEXT);",
            )
            .unwrap();
        }

        let settings: AppSettings = serde_json::from_str(&format!(
            r#"{{"databases": [{{"name": "t", "kind": "sqlite", "path": "{}"}}]}}"#,
            db_path.display()
        ))
        .unwrap();
        let (_tx, rx) = mpsc::channel(1);
        let actor = SqlExecutorActor::new(rx, settings);

        let tables = actor
            .search_objects("t", ObjectType::Table, "pat%", "names")
            .await
            .unwrap();
        assert!(tables.contains("patient"));
        assert!(!tables.contains("visit"));

        let columns = actor
            .search_objects("t", ObjectType::Column, "%date%", "names")
            .await
            .unwrap();
        assert!(columns.contains("patient.visit_date"));
        assert!(columns.contains("visit.visit_date"));
    }
}
