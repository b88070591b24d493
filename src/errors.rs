//! Typed engine errors.
//!
//! Domain errors carry the failing collaborator's identity and the
//! underlying message. At actor channel boundaries they cross as
//! `Result<T, String>` via `to_string()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Bad or out-of-budget request parameters. No state change occurred.
    #[error("invalid input: {0}")]
    InputError(String),

    /// A backing store (graph, vector, session) is unreachable.
    #[error("{store} unavailable: {message}")]
    StoreUnavailable { store: &'static str, message: String },

    /// The LLM provider failed or timed out.
    #[error("llm provider {provider} failed: {message}")]
    LlmUnavailable { provider: String, message: String },

    /// SQL failed the dialect probe after the repair budget was spent.
    #[error("validation_error: {0}")]
    ValidationFailed(String),

    /// Mutation SQL without opt-in. Never reached the database.
    #[error("FORBIDDEN: {0}")]
    Forbidden(String),

    /// A bounded operation exceeded its deadline.
    #[error("Query timeout after {0}s")]
    Timeout(u64),
}

impl EngineError {
    pub fn store(store: &'static str, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            store,
            message: message.into(),
        }
    }

    pub fn llm(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmUnavailable {
            provider: provider.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_identity() {
        let err = EngineError::store("graph", "connection refused");
        assert_eq!(err.to_string(), "graph unavailable: connection refused");

        let err = EngineError::llm("openai", "429 rate limited");
        assert!(err.to_string().contains("openai"));
    }

    #[test]
    fn test_forbidden_message() {
        let err = EngineError::Forbidden("Mutation statement (DELETE) not allowed".to_string());
        assert!(err.to_string().starts_with("FORBIDDEN:"));
        assert_eq!(EngineError::Timeout(30).to_string(), "Query timeout after 30s");
    }
}
