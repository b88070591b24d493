//! Application settings.
//!
//! Settings load from a JSON5 config file (`easysql.config.json5`, probed in
//! the working directory and then the home directory), with environment
//! variables overriding provider credentials. Runtime overrides swap the
//! whole settings value copy-on-write; see `app_state`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

/// Kinds of target databases the executor can reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Sqlite,
    Postgresql,
    Mysql,
    Oracle,
    Sqlserver,
}

impl DatabaseKind {
    /// Dialect-appropriate syntax probe prefix.
    pub fn explain_prefix(&self) -> &'static str {
        match self {
            DatabaseKind::Sqlite => "EXPLAIN",
            DatabaseKind::Mysql => "EXPLAIN",
            DatabaseKind::Postgresql => "EXPLAIN ANALYZE",
            DatabaseKind::Oracle => "EXPLAIN PLAN FOR",
            DatabaseKind::Sqlserver => "SET SHOWPLAN_TEXT ON;",
        }
    }

    pub fn dialect_name(&self) -> &'static str {
        match self {
            DatabaseKind::Sqlite => "sqlite",
            DatabaseKind::Postgresql => "postgresql",
            DatabaseKind::Mysql => "mysql",
            DatabaseKind::Oracle => "oracle",
            DatabaseKind::Sqlserver => "sqlserver",
        }
    }
}

/// One configured target database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub kind: DatabaseKind,
    /// Path to the database file (sqlite targets).
    #[serde(default)]
    pub path: Option<String>,
    /// HTTP SQL gateway endpoint (non-embedded targets).
    #[serde(default)]
    pub gateway_url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// LLM provider credentials and model selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmSettings {
    #[serde(default)]
    pub google_api_key: Option<String>,
    #[serde(default)]
    pub anthropic_api_key: Option<String>,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub openai_api_base: Option<String>,
    #[serde(default)]
    pub ollama_base_url: Option<String>,
    /// Generation model (SQL generation and repair).
    #[serde(default = "default_model")]
    pub model: String,
    /// Planning model (analyze/clarify/viz). Falls back to `model` when unset.
    #[serde(default)]
    pub model_planning: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_llm_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_planning_timeout")]
    pub planning_timeout_secs: u64,
    #[serde(default = "default_agent_iterations")]
    pub agent_max_iterations: usize,
    #[serde(default = "default_sql_retries")]
    pub max_sql_retries: usize,
    #[serde(default = "default_true")]
    pub use_agent_mode: bool,
    /// "standard" runs the ambiguity analysis; "fast" skips clarification.
    #[serde(default = "default_query_mode")]
    pub query_mode: String,
}

impl Default for LlmSettings {
    fn default() -> Self {
        // serde defaults are the single source of truth
        serde_json::from_str("{}").expect("default llm settings")
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_llm_timeout() -> u64 {
    120
}

fn default_planning_timeout() -> u64 {
    120
}

fn default_agent_iterations() -> usize {
    10
}

fn default_sql_retries() -> usize {
    2
}

fn default_true() -> bool {
    true
}

fn default_query_mode() -> String {
    "standard".to_string()
}

/// Schema retrieval pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalSettings {
    #[serde(default = "default_top_k")]
    pub search_top_k: usize,
    #[serde(default = "default_true")]
    pub expand_fk: bool,
    #[serde(default = "default_expand_depth")]
    pub expand_max_depth: usize,
    #[serde(default = "default_true")]
    pub semantic_filter_enabled: bool,
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f32,
    #[serde(default = "default_semantic_min_tables")]
    pub semantic_min_tables: usize,
    /// Operator-declared tables never dropped by semantic scoring.
    #[serde(default)]
    pub core_tables: Vec<String>,
    #[serde(default = "default_true")]
    pub bridge_protection_enabled: bool,
    #[serde(default = "default_bridge_hops")]
    pub bridge_max_hops: usize,
    #[serde(default)]
    pub llm_filter_enabled: bool,
    #[serde(default = "default_llm_filter_max")]
    pub llm_filter_max_tables: usize,
    #[serde(default = "default_few_shot_top_k")]
    pub few_shot_top_k: usize,
    #[serde(default = "default_few_shot_min_score")]
    pub few_shot_min_score: f32,
    #[serde(default = "default_code_top_k")]
    pub code_top_k: usize,
    #[serde(default = "default_code_threshold")]
    pub code_score_threshold: f32,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        // serde defaults are the single source of truth
        serde_json::from_str("{}").expect("default retrieval settings")
    }
}

fn default_top_k() -> usize {
    10
}

fn default_expand_depth() -> usize {
    1
}

fn default_semantic_threshold() -> f32 {
    0.4
}

fn default_semantic_min_tables() -> usize {
    3
}

fn default_bridge_hops() -> usize {
    3
}

fn default_llm_filter_max() -> usize {
    8
}

fn default_few_shot_top_k() -> usize {
    3
}

fn default_few_shot_min_score() -> f32 {
    0.6
}

fn default_code_top_k() -> usize {
    3
}

fn default_code_threshold() -> f32 {
    0.5
}

/// Storage locations and session backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_vector_path")]
    pub vector_store_path: String,
    #[serde(default = "default_metadata_path")]
    pub metadata_db_path: String,
    /// "memory" or "postgres".
    #[serde(default = "default_session_backend")]
    pub session_backend: String,
    /// Target database name whose gateway backs the postgres session store.
    #[serde(default)]
    pub session_db_name: Option<String>,
    #[serde(default = "default_session_capacity")]
    pub max_sessions: usize,
    #[serde(default = "default_duplicate_threshold")]
    pub few_shot_duplicate_threshold: f32,
}

impl Default for StorageSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("default storage settings")
    }
}

fn default_vector_path() -> String {
    "data/vectors".to_string()
}

fn default_metadata_path() -> String {
    "data/schema_meta.db".to_string()
}

fn default_session_backend() -> String {
    "memory".to_string()
}

fn default_session_capacity() -> usize {
    1000
}

fn default_duplicate_threshold() -> f32 {
    0.95
}

/// SQL execution guard rails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default = "default_exec_timeout")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_exec_timeout_max")]
    pub max_timeout_secs: u64,
    #[serde(default = "default_row_limit")]
    pub default_row_limit: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("default execution settings")
    }
}

fn default_exec_timeout() -> u64 {
    30
}

fn default_exec_timeout_max() -> u64 {
    300
}

fn default_row_limit() -> usize {
    100
}

/// Top-level application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub llm: LlmSettings,
    #[serde(default)]
    pub retrieval: RetrievalSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub verbose_logging: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("default app settings")
    }
}

impl AppSettings {
    pub fn database(&self, db_name: &str) -> Option<&DatabaseConfig> {
        self.databases
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(db_name))
    }

    /// Dialect for a named database, None when the target is unknown.
    pub fn dialect_for(&self, db_name: &str) -> Option<DatabaseKind> {
        self.database(db_name).map(|d| d.kind)
    }

    /// Candidate config file locations, most specific first.
    fn config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("easysql.config.json5")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".easysql").join("config.json5"));
        }
        paths
    }

    /// Load settings from disk, falling back to defaults when no file exists.
    pub async fn load() -> Self {
        for path in Self::config_paths() {
            match fs::read_to_string(&path).await {
                Ok(contents) => match json5::from_str::<AppSettings>(&contents) {
                    Ok(mut settings) => {
                        println!("[Settings] Loaded config from {:?}", path);
                        settings.apply_env_overrides();
                        return settings;
                    }
                    Err(e) => {
                        println!("[Settings] Failed to parse {:?}: {}", path, e);
                    }
                },
                Err(_) => continue,
            }
        }

        println!("[Settings] No config file found, using defaults");
        let mut settings = AppSettings::default();
        settings.apply_env_overrides();
        settings
    }

    /// Environment variables win over file values for credentials.
    pub fn apply_env_overrides(&mut self) {
        let env_overrides: HashMap<&str, &mut Option<String>> = HashMap::from([
            ("GOOGLE_API_KEY", &mut self.llm.google_api_key),
            ("ANTHROPIC_API_KEY", &mut self.llm.anthropic_api_key),
            ("OPENAI_API_KEY", &mut self.llm.openai_api_key),
            ("OPENAI_API_BASE", &mut self.llm.openai_api_base),
            ("OLLAMA_BASE_URL", &mut self.llm.ollama_base_url),
        ]);

        for (var, slot) in env_overrides {
            if let Ok(value) = std::env::var(var) {
                if !value.trim().is_empty() {
                    *slot = Some(value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_json() {
        let settings: AppSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.llm.agent_max_iterations, 10);
        assert_eq!(settings.llm.max_sql_retries, 2);
        assert!(settings.llm.use_agent_mode);
        assert_eq!(settings.retrieval.search_top_k, 10);
        assert!((settings.retrieval.semantic_threshold - 0.4).abs() < f32::EPSILON);
        assert_eq!(settings.storage.max_sessions, 1000);
        assert_eq!(settings.execution.default_timeout_secs, 30);
        assert_eq!(settings.execution.max_timeout_secs, 300);

        // Default::default() follows the same serde defaults.
        let defaults = AppSettings::default();
        assert_eq!(defaults.llm.agent_max_iterations, 10);
        assert_eq!(defaults.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn test_explain_prefixes() {
        assert_eq!(DatabaseKind::Postgresql.explain_prefix(), "EXPLAIN ANALYZE");
        assert_eq!(DatabaseKind::Mysql.explain_prefix(), "EXPLAIN");
        assert_eq!(DatabaseKind::Oracle.explain_prefix(), "EXPLAIN PLAN FOR");
        assert_eq!(
            DatabaseKind::Sqlserver.explain_prefix(),
            "SET SHOWPLAN_TEXT ON;"
        );
    }

    #[test]
    fn test_json5_config_with_comments() {
        let raw = r#"{
            // Target databases
            databases: [
                { name: "medical", kind: "sqlite", path: "data/medical.db" },
            ],
            llm: { model: "gemini-2.0-flash", use_agent_mode: false },
        }"#;

        let settings: AppSettings = json5::from_str(raw).unwrap();
        assert_eq!(settings.databases.len(), 1);
        assert_eq!(settings.databases[0].kind, DatabaseKind::Sqlite);
        assert_eq!(settings.llm.model, "gemini-2.0-flash");
        assert!(!settings.llm.use_agent_mode);
        assert_eq!(settings.dialect_for("MEDICAL"), Some(DatabaseKind::Sqlite));
    }
}
