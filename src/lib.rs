//! easysql - natural-language-to-SQL agent engine.
//!
//! A multi-stage agent pipeline over a schema metadata graph and vector
//! embeddings: analyze → clarify → retrieve → build context → generate →
//! validate → repair, with a tool-using SQL agent mode, multi-turn
//! conversation memory, and a visualization planner.

use std::sync::atomic::{AtomicBool, Ordering};

pub mod actors;
pub mod app_state;
pub mod cli;
pub mod context;
pub mod demo_schema;
pub mod embeddings;
pub mod errors;
pub mod graph;
pub mod multi_turn;
pub mod nodes;
pub mod protocol;
pub mod retrieval;
pub mod service;
pub mod session;
pub mod settings;
pub mod tools;
pub mod viz;

#[cfg(test)]
mod tests;

static VERBOSE_LOGGING: AtomicBool = AtomicBool::new(false);

/// Enable or disable chatty progress logging process-wide.
pub fn set_verbose_logging(enabled: bool) {
    VERBOSE_LOGGING.store(enabled, Ordering::Relaxed);
}

pub fn is_verbose_logging_enabled() -> bool {
    VERBOSE_LOGGING.load(Ordering::Relaxed)
}
