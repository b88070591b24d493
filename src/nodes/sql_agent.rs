//! SQL agent node: iterative tool-using generation with forced validation.
//!
//! Replaces the naive generate/validate/repair chain when agent mode is
//! on. The inner loop streams the model, executes `validate_sql` and
//! `search_objects` calls, and never returns SQL that was not proven by a
//! successful validation in this loop, unless the iteration budget runs
//! out (in which case `validation_passed` is false and the last error is
//! surfaced).

use std::collections::HashSet;
use tokio::sync::mpsc;

use super::{call_llm, extract_sql};
use crate::actors::llm_gateway_actor::ModelPurpose;
use crate::graph::state::{AgentState, StateUpdate, ValidationResult};
use crate::graph::{NodeContext, NodeOutcome};
use crate::multi_turn::token_manager::TokenManager;
use crate::protocol::{
    AgentAction, AgentProgressEvent, ChatMessage, ParsedToolCall, StreamEvent,
};
use crate::tools::validate_sql::is_tool_success;
use crate::tools::{agent_tool_specs, SearchObjectsExecutor, ValidateSqlExecutor};

const AGENT_WORKFLOW_PROMPT: &str = r#"## Available tools
1. validate_sql - validate a SQL statement (runs it with LIMIT 1)
2. search_objects - search live tables/columns/indexes by pattern

## Workflow (follow strictly)
1. Analyze the question against the schema context above.
2. Draft the SQL statement.
3. MANDATORY: call validate_sql on it. Never skip this step.
4. If validation returns ERROR:
   - read the error (missing column, wrong table name, ...)
   - use search_objects to find the correct names when needed
   - fix the SQL and call validate_sql AGAIN
5. Repeat until validate_sql returns SUCCESS.
6. Only after SUCCESS, output the final SQL.

## Rules
- Never output final SQL without a SUCCESS validation in this conversation.
- Never use parameter placeholders (%s, :name, ?).
- If several attempts keep failing, explain the problem and return your last SQL.

## Output format
After validation passes, output:
```sql
your final SQL
```"#;

fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let prefix: String = text.chars().take(max_len).collect();
        format!("{}...", prefix)
    }
}

async fn emit_progress(
    ctx: &NodeContext,
    iteration: usize,
    action: AgentAction,
    tool: Option<String>,
    success: Option<bool>,
    input_preview: Option<String>,
    output_preview: Option<String>,
) {
    ctx.emit(StreamEvent::AgentProgress(AgentProgressEvent {
        iteration,
        action,
        tool,
        success,
        input_preview,
        output_preview,
    }))
    .await;
}

/// Forward raw LLM tokens into the stream event channel.
fn spawn_token_forwarder(
    ctx: &NodeContext,
    iteration: usize,
) -> (
    mpsc::UnboundedSender<String>,
    tokio::task::JoinHandle<()>,
) {
    let (token_tx, mut token_rx) = mpsc::unbounded_channel::<String>();
    let events = ctx.events.clone();
    let handle = tokio::spawn(async move {
        while let Some(content) = token_rx.recv().await {
            if let Some(events) = &events {
                let _ = events
                    .send(StreamEvent::Token { iteration, content })
                    .await;
            }
        }
    });
    (token_tx, handle)
}

pub async fn run(state: &AgentState, ctx: &NodeContext) -> Result<NodeOutcome, String> {
    let context = state
        .context_output
        .clone()
        .or_else(|| state.cached_context.clone())
        .ok_or_else(|| "No context available for SQL generation".to_string())?;

    let db_name = state.db_name.clone().unwrap_or_else(|| "default".to_string());
    let max_iterations = ctx.settings.llm.agent_max_iterations;

    let validate_tool = ValidateSqlExecutor::new(
        ctx.sql_tx.clone(),
        db_name.clone(),
        ctx.settings.execution.default_timeout_secs,
    );
    let search_tool = SearchObjectsExecutor::new(ctx.sql_tx.clone(), db_name.clone());
    let tools = agent_tool_specs();

    // Dialect rules ride in the built context; the workflow contract is
    // appended here.
    let system_prompt = format!("{}\n\n{}", context.system_prompt, AGENT_WORKFLOW_PROMPT);

    let mut messages: Vec<ChatMessage> = Vec::new();
    if !state.conversation_history.is_empty() {
        let manager = TokenManager::default();
        let (summary, recent) = manager
            .prepare_history(
                &state.conversation_history,
                context.total_tokens,
                Some(&ctx.llm_tx),
            )
            .await;
        messages.extend(TokenManager::build_history_messages(
            summary.as_deref(),
            &recent,
        ));
    }
    messages.push(ChatMessage::user(context.user_prompt.clone()));

    let mut validation_passed = false;
    let mut validated_sqls: HashSet<String> = HashSet::new();
    let mut last_sql: Option<String> = None;
    let mut last_error: Option<String> = None;
    let mut iteration = 0usize;

    while iteration < max_iterations {
        iteration += 1;
        println!("[SqlAgent] Iteration {}/{}", iteration, max_iterations);

        if ctx.cancelled() {
            return Err("cancelled".to_string());
        }

        emit_progress(ctx, iteration, AgentAction::Thinking, None, None, None, None).await;

        let (token_tx, forwarder) = spawn_token_forwarder(ctx, iteration);
        let mut full_messages = vec![ChatMessage::system(system_prompt.clone())];
        full_messages.extend(messages.iter().cloned());

        let response = call_llm(
            ctx,
            ModelPurpose::Generation,
            full_messages,
            Some(tools.clone()),
            None,
            Some(token_tx),
        )
        .await;
        let _ = forwarder.await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                // Transient provider failures are retriable within the
                // iteration budget.
                println!("[SqlAgent] LLM call failed: {}", e);
                last_error = Some(e);
                continue;
            }
        };

        if !response.content.is_empty() {
            emit_progress(
                ctx,
                iteration,
                AgentAction::ThoughtComplete,
                None,
                None,
                None,
                Some(truncate(&response.content, 300)),
            )
            .await;
        }

        if !response.tool_calls.is_empty() {
            messages.push(ChatMessage::assistant_with_tool_calls(
                response.content.clone(),
                response.tool_calls.clone(),
            ));

            for call in &response.tool_calls {
                let call_id = call
                    .id
                    .clone()
                    .unwrap_or_else(|| format!("call_{}", iteration));

                emit_progress(
                    ctx,
                    iteration,
                    AgentAction::ToolStart,
                    Some(call.name.clone()),
                    None,
                    Some(truncate(&call.arguments.to_string(), 200)),
                    None,
                )
                .await;

                let observation = execute_tool(call, &validate_tool, &search_tool).await;
                let success = is_tool_success(&observation);

                if call.name == "validate_sql" {
                    if let Some(sql) = call.arguments.get("sql").and_then(|v| v.as_str()) {
                        last_sql = Some(sql.to_string());
                        if success {
                            validated_sqls.insert(sql.to_string());
                        }
                    }
                    validation_passed = success;
                    if !success {
                        last_error = Some(observation.clone());
                    }
                }

                emit_progress(
                    ctx,
                    iteration,
                    AgentAction::ToolEnd,
                    Some(call.name.clone()),
                    Some(success),
                    None,
                    Some(truncate(&observation, 300)),
                )
                .await;

                messages.push(ChatMessage::tool_result(call_id, observation));
            }

            if !validation_passed {
                if let Some(error) = &last_error {
                    messages.push(ChatMessage::user(format!(
                        "The SQL failed validation with: {}\n\n\
                         Fix the SQL based on this error, then call validate_sql again.",
                        error
                    )));
                }
            }
            continue;
        }

        // No tool calls: the model considers itself done.
        match extract_sql(&response.content) {
            Some(sql) => {
                last_sql = Some(sql.clone());

                if validated_sqls.contains(&sql) {
                    validation_passed = true;
                    println!("[SqlAgent] Final SQL was validated in this loop");
                    break;
                }

                // Force validation: the model skipped the validate tool.
                println!("[SqlAgent] Forcing validation of unvalidated SQL");
                emit_progress(
                    ctx,
                    iteration,
                    AgentAction::ForceValidation,
                    Some("validate_sql".to_string()),
                    None,
                    Some(truncate(&sql, 200)),
                    None,
                )
                .await;

                let observation = validate_tool.execute(&sql).await;
                let success = is_tool_success(&observation);
                emit_progress(
                    ctx,
                    iteration,
                    AgentAction::ToolEnd,
                    Some("validate_sql".to_string()),
                    Some(success),
                    None,
                    Some(truncate(&observation, 300)),
                )
                .await;

                if success {
                    validation_passed = true;
                    validated_sqls.insert(sql);
                    break;
                }

                validation_passed = false;
                last_error = Some(observation.clone());
                messages.push(ChatMessage::assistant(response.content.clone()));
                messages.push(ChatMessage::user(format!(
                    "The SQL failed validation with: {}\n\n\
                     Fix the SQL based on this error, then call validate_sql again.",
                    observation
                )));
            }
            None => {
                println!("[SqlAgent] No SQL and no tool calls; stopping");
                if last_error.is_none() {
                    last_error = Some("Model produced neither SQL nor tool calls".to_string());
                }
                break;
            }
        }
    }

    println!(
        "[SqlAgent] Done: iterations={}, validated={}",
        iteration, validation_passed
    );

    let update = match last_sql {
        Some(sql) => StateUpdate {
            generated_sql: Some(Some(sql)),
            validation_passed: Some(validation_passed),
            validation_result: Some(Some(ValidationResult {
                valid: validation_passed,
                details: Some(format!("Completed in {} iterations", iteration)),
                error: if validation_passed {
                    None
                } else {
                    last_error.clone()
                },
            })),
            error: Some(if validation_passed { None } else { last_error }),
            retry_count: Some(iteration.saturating_sub(1)),
            ..Default::default()
        },
        None => StateUpdate {
            generated_sql: Some(None),
            validation_passed: Some(false),
            error: Some(Some(
                last_error.unwrap_or_else(|| "Failed to generate SQL".to_string()),
            )),
            retry_count: Some(iteration.saturating_sub(1)),
            ..Default::default()
        },
    };

    Ok(NodeOutcome::Update(update))
}

async fn execute_tool(
    call: &ParsedToolCall,
    validate_tool: &ValidateSqlExecutor,
    search_tool: &SearchObjectsExecutor,
) -> String {
    match call.name.as_str() {
        "validate_sql" => {
            let sql = call
                .arguments
                .get("sql")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            validate_tool.execute(sql).await
        }
        "search_objects" => {
            let object_type = call
                .arguments
                .get("object_type")
                .and_then(|v| v.as_str())
                .unwrap_or("table");
            let pattern = call
                .arguments
                .get("pattern")
                .and_then(|v| v.as_str())
                .unwrap_or("%");
            let detail_level = call
                .arguments
                .get("detail_level")
                .and_then(|v| v.as_str())
                .unwrap_or("names");
            search_tool.execute(object_type, pattern, detail_level).await
        }
        other => format!("ERROR: Unknown tool {}", other),
    }
}
