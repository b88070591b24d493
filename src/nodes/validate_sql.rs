//! Validate-SQL node: dialect-appropriate syntax probe of the generated
//! statement (naive path).

use tokio::sync::oneshot;

use crate::actors::sql_executor_actor::SqlExecMsg;
use crate::graph::state::{AgentState, StateUpdate, ValidationResult};
use crate::graph::{NodeContext, NodeOutcome};

pub async fn run(state: &AgentState, ctx: &NodeContext) -> Result<NodeOutcome, String> {
    let sql = match &state.generated_sql {
        Some(sql) => sql.clone(),
        None => {
            return Ok(NodeOutcome::Update(StateUpdate {
                validation_passed: Some(false),
                error: Some(Some("No SQL generated".to_string())),
                ..Default::default()
            }));
        }
    };

    let db_name = state.db_name.clone().unwrap_or_else(|| "default".to_string());

    let (tx, rx) = oneshot::channel();
    ctx.sql_tx
        .send(SqlExecMsg::CheckSyntax {
            sql,
            db_name,
            respond_to: tx,
        })
        .await
        .map_err(|_| "sql executor unavailable".to_string())?;
    let result = rx.await.map_err(|_| "sql executor died".to_string())??;

    let update = if result.success {
        StateUpdate {
            validation_passed: Some(true),
            validation_result: Some(Some(ValidationResult {
                valid: true,
                details: Some("Syntax probe passed".to_string()),
                error: None,
            })),
            error: Some(None),
            ..Default::default()
        }
    } else {
        let error = result
            .error
            .unwrap_or_else(|| "validation failed".to_string());
        println!("[ValidateSql] Probe failed: {}", error);
        StateUpdate {
            validation_passed: Some(false),
            validation_result: Some(Some(ValidationResult {
                valid: false,
                details: None,
                error: Some(error.clone()),
            })),
            error: Some(Some(error)),
            ..Default::default()
        }
    };

    Ok(NodeOutcome::Update(update))
}
