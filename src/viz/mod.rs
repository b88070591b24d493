//! Visualization planning sub-graph: preprocess → plan → validate.
//!
//! Runs independently of the main agent graph, invoked after a successful
//! SQL execution. The LLM step is optional; without it (or when its plan
//! fails validation) the deterministic fallback applies.

pub mod aggregate;
pub mod plan;
pub mod preprocess;
pub mod schemas;
pub mod validate;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::actors::llm_gateway_actor::LlmMsg;
use preprocess::{build_profiles, ColumnProfile};
use schemas::VizPlan;

/// Input to the planner: a SQL result set plus its provenance.
#[derive(Debug, Clone, Default)]
pub struct VizInput {
    pub question: Option<String>,
    pub sql: Option<String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
}

impl VizInput {
    pub fn from_result(
        question: Option<String>,
        sql: Option<String>,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    ) -> Self {
        let row_count = rows.len();
        Self {
            question,
            sql,
            columns,
            rows,
            row_count,
        }
    }
}

/// Outcome of one planning run.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VizOutcome {
    pub plan: VizPlan,
    pub profile: Vec<ColumnProfile>,
    pub fallback: bool,
    pub errors: Vec<String>,
}

/// Run the sub-graph. `llm_tx = None` goes straight to the deterministic
/// fallback.
pub async fn run_viz_planner(
    input: &VizInput,
    llm_tx: Option<&mpsc::Sender<LlmMsg>>,
) -> VizOutcome {
    // preprocess
    let profiles = build_profiles(input);

    // plan
    let (llm_plan, mut errors) = match llm_tx {
        Some(llm_tx) => plan::plan_with_llm(llm_tx, input, &profiles).await,
        None => (None, Vec::new()),
    };

    // validate (with fallback)
    let (plan, validation_errors, fallback) =
        validate::validate_plan(llm_plan, &profiles, input.question.as_deref());
    errors.extend(validation_errors);

    println!(
        "[VizPlanner] suitable={}, charts={}, fallback={}",
        plan.suitable,
        plan.charts.len(),
        fallback
    );

    VizOutcome {
        plan,
        profile: profiles,
        fallback,
        errors,
    }
}
