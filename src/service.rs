//! Query service: session lifecycle around the agent graph.
//!
//! Enforces at most one in-flight generation per session, owns the status
//! transitions, persists turns/messages, and carries the multi-turn state
//! (history + typed caches) between turns through the session store.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::actors::few_shot_actor::{FewShotExample, FewShotMsg};
use crate::actors::sql_executor_actor::SqlExecMsg;
use crate::app_state::EngineHandles;
use crate::graph::state::AgentState;
use crate::graph::{AgentGraph, GraphRunner, RunOutcome};
use crate::protocol::{ClarificationPayload, ExecuteRequest, ExecuteResponse, ExecuteStatus, StreamEvent};
use crate::session::{
    Clarification, Message, MessageRole, QueryStatus, Session, SessionStore,
};
use crate::viz::{run_viz_planner, VizInput, VizOutcome};

/// The response envelope every query path returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub session_id: String,
    pub status: QueryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_passed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarification: Option<ClarificationInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClarificationInfo {
    pub questions: Vec<String>,
}

/// Multi-turn carryover persisted in the session's state column.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SessionCarryover {
    conversation_history: Vec<crate::multi_turn::ConversationTurn>,
    cached_context: Option<crate::context::ContextOutput>,
    cached_retrieval: Option<crate::retrieval::RetrievalResult>,
}

/// Removes the session from the active set on every exit path.
struct ActiveGuard {
    active: Arc<Mutex<HashSet<String>>>,
    session_id: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active
            .lock()
            .expect("active set poisoned")
            .remove(&self.session_id);
    }
}

pub struct QueryService {
    handles: EngineHandles,
    store: Arc<SessionStore>,
    graph: AgentGraph,
    /// Sessions with a generation in flight. One logical execution per
    /// thread id at any time.
    active: Arc<Mutex<HashSet<String>>>,
}

impl QueryService {
    pub fn new(handles: EngineHandles, store: Arc<SessionStore>) -> Self {
        let graph = AgentGraph::from_settings(&handles.settings);
        Self {
            handles,
            store,
            graph,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn handles(&self) -> &EngineHandles {
        &self.handles
    }

    pub async fn create_session(&self, db_name: Option<&str>) -> Result<Session, String> {
        let session_id = Uuid::new_v4().to_string();
        self.store.create(&session_id, db_name).await
    }

    fn acquire(&self, session_id: &str) -> Result<ActiveGuard, String> {
        let mut active = self.active.lock().expect("active set poisoned");
        if !active.insert(session_id.to_string()) {
            return Err(format!(
                "Session {} already has a generation in progress",
                session_id
            ));
        }
        Ok(ActiveGuard {
            active: self.active.clone(),
            session_id: session_id.to_string(),
        })
    }

    fn load_carryover(session: &Session) -> SessionCarryover {
        session
            .state
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    fn carryover_value(state: &AgentState) -> Value {
        serde_json::to_value(SessionCarryover {
            conversation_history: state.conversation_history.clone(),
            cached_context: state.cached_context.clone(),
            cached_retrieval: state.cached_retrieval.clone(),
        })
        .unwrap_or(Value::Null)
    }

    /// Run a new question through the graph (blocking until completion or
    /// suspension).
    pub async fn execute_query(
        &self,
        session_id: &str,
        question: &str,
    ) -> Result<QueryResponse, String> {
        self.run_query(session_id, question, None).await
    }

    /// Same as `execute_query` but with a stream event sink attached.
    pub async fn execute_query_streaming(
        &self,
        session_id: &str,
        question: &str,
        events: mpsc::Sender<StreamEvent>,
    ) -> Result<QueryResponse, String> {
        self.run_query(session_id, question, Some(events)).await
    }

    async fn run_query(
        &self,
        session_id: &str,
        question: &str,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<QueryResponse, String> {
        let _guard = self.acquire(session_id)?;

        let mut session = self
            .store
            .get(session_id)
            .await
            .ok_or_else(|| format!("Session {} not found", session_id))?;

        session.raw_query = Some(question.to_string());
        session.status = QueryStatus::Processing;
        let turn_id = {
            let turn = session.create_turn(question.to_string());
            turn.status = QueryStatus::Processing;
            turn.turn_id.clone()
        };
        self.store.update(&session).await?;

        if let Some(events) = &events {
            let _ = events
                .send(StreamEvent::Start {
                    session_id: session_id.to_string(),
                })
                .await;
        }

        let carryover = Self::load_carryover(&session);
        let mut state = AgentState::for_query(question, session.db_name.clone());
        state.conversation_history = carryover.conversation_history;
        state.cached_context = carryover.cached_context;
        state.cached_retrieval = carryover.cached_retrieval;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self::watch_disconnect(events.clone(), cancel_tx);
        let ctx = self.handles.node_context(cancel_rx, events.clone());

        let runner = GraphRunner::new(self.graph);
        let outcome = runner
            .run(state, session_id, AgentGraph::entry(), &ctx, &self.store)
            .await;

        self.finish_run(session_id, &turn_id, outcome, events).await
    }

    /// Resume a session suspended on clarification.
    pub async fn continue_conversation(
        &self,
        session_id: &str,
        answer: &str,
    ) -> Result<QueryResponse, String> {
        self.continue_conversation_streaming(session_id, answer, None)
            .await
    }

    pub async fn continue_conversation_streaming(
        &self,
        session_id: &str,
        answer: &str,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<QueryResponse, String> {
        let _guard = self.acquire(session_id)?;

        let mut session = self
            .store
            .get(session_id)
            .await
            .ok_or_else(|| format!("Session {} not found", session_id))?;

        if session.status != QueryStatus::AwaitingClarification {
            return Ok(QueryResponse {
                session_id: session_id.to_string(),
                status: QueryStatus::Failed,
                sql: None,
                validation_passed: None,
                validation_error: None,
                clarification: None,
                error: Some("Session is not awaiting clarification".to_string()),
            });
        }

        let checkpoint = self
            .store
            .load_checkpoint(session_id)
            .await
            .ok_or_else(|| format!("No checkpoint for session {}", session_id))?;
        let (mut state, node) = crate::graph::parse_checkpoint(&checkpoint)?;
        state.clarification_answer = Some(answer.to_string());

        // Record the answer on the pending clarification.
        let turn_id = session
            .current_turn()
            .map(|t| t.turn_id.clone())
            .unwrap_or_default();
        if let Some(turn) = session.current_turn_mut() {
            if let Some(clarification) =
                turn.clarifications.iter_mut().find(|c| c.answer.is_none())
            {
                clarification.answer = Some(answer.to_string());
            }
            turn.status = QueryStatus::Processing;
        }
        session.status = QueryStatus::Processing;
        self.store.update(&session).await?;

        if let Some(events) = &events {
            let _ = events
                .send(StreamEvent::Start {
                    session_id: session_id.to_string(),
                })
                .await;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        Self::watch_disconnect(events.clone(), cancel_tx);
        let ctx = self.handles.node_context(cancel_rx, events.clone());

        let runner = GraphRunner::new(self.graph);
        let outcome = runner
            .run(state, session_id, node, &ctx, &self.store)
            .await;

        self.finish_run(session_id, &turn_id, outcome, events).await
    }

    /// A closed stream consumer cancels the in-flight run.
    fn watch_disconnect(events: Option<mpsc::Sender<StreamEvent>>, cancel_tx: watch::Sender<bool>) {
        let events = match events {
            Some(events) => events,
            None => return,
        };
        tokio::spawn(async move {
            events.closed().await;
            let _ = cancel_tx.send(true);
        });
    }

    async fn finish_run(
        &self,
        session_id: &str,
        turn_id: &str,
        outcome: Result<RunOutcome, String>,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<QueryResponse, String> {
        let mut session = self
            .store
            .get(session_id)
            .await
            .ok_or_else(|| format!("Session {} not found", session_id))?;

        let response = match outcome {
            Ok(RunOutcome::Interrupted { state, payload }) => {
                self.apply_interrupt(&mut session, turn_id, &state, &payload)
                    .await?
            }
            Ok(RunOutcome::Complete(state)) => {
                self.apply_complete(&mut session, turn_id, state).await?
            }
            Err(error) => {
                session.status = QueryStatus::Failed;
                if let Some(turn) = session.turns.iter_mut().find(|t| t.turn_id == turn_id) {
                    turn.status = QueryStatus::Failed;
                    turn.error = Some(error.clone());
                }
                session.touch();
                self.store.update(&session).await?;

                QueryResponse {
                    session_id: session_id.to_string(),
                    status: QueryStatus::Failed,
                    sql: None,
                    validation_passed: None,
                    validation_error: None,
                    clarification: None,
                    error: Some(error),
                }
            }
        };

        if let Some(events) = events {
            let event = match response.status {
                QueryStatus::Failed => StreamEvent::Error {
                    error: response
                        .error
                        .clone()
                        .unwrap_or_else(|| "unknown error".to_string()),
                },
                _ => StreamEvent::Complete(serde_json::to_value(&response).unwrap_or(Value::Null)),
            };
            let _ = events.send(event).await;
        }

        Ok(response)
    }

    async fn apply_interrupt(
        &self,
        session: &mut Session,
        turn_id: &str,
        state: &AgentState,
        payload: &ClarificationPayload,
    ) -> Result<QueryResponse, String> {
        let questions = state.clarification_questions.clone().unwrap_or_default();

        session.status = QueryStatus::AwaitingClarification;
        if let Some(turn) = session.turns.iter_mut().find(|t| t.turn_id == turn_id) {
            turn.status = QueryStatus::AwaitingClarification;
            turn.clarifications.push(Clarification {
                questions: questions.clone(),
                answer: None,
                created_at: chrono::Utc::now(),
            });
        }
        session.touch();
        self.store.update(session).await?;

        println!(
            "[QueryService] Session {} awaiting clarification: {}",
            session.session_id, payload.question
        );

        Ok(QueryResponse {
            session_id: session.session_id.clone(),
            status: QueryStatus::AwaitingClarification,
            sql: None,
            validation_passed: None,
            validation_error: None,
            clarification: Some(ClarificationInfo { questions }),
            error: None,
        })
    }

    async fn apply_complete(
        &self,
        session: &mut Session,
        turn_id: &str,
        state: AgentState,
    ) -> Result<QueryResponse, String> {
        let session_id = session.session_id.clone();
        let terminal_error = state.error.clone();
        let failed = terminal_error.is_some() && state.generated_sql.is_none();

        // Messages: the user question and the assistant's resolution.
        let user_message_id = Uuid::new_v4().to_string();
        let assistant_message_id = Uuid::new_v4().to_string();
        let tables_used = state
            .retrieval_result
            .as_ref()
            .map(|r| r.tables.clone())
            .unwrap_or_default();

        session.add_message(Message {
            message_id: user_message_id.clone(),
            session_id: session_id.clone(),
            thread_id: session_id.clone(),
            parent_id: None,
            role: MessageRole::User,
            content: Some(state.raw_query.clone()),
            generated_sql: None,
            tables_used: vec![],
            validation_passed: None,
            user_answer: None,
            clarification_questions: None,
            is_few_shot: false,
            token_count: None,
            branch_id: None,
            root_message_id: None,
            checkpoint_id: None,
            created_at: chrono::Utc::now(),
        });
        session.add_message(Message {
            message_id: assistant_message_id.clone(),
            session_id: session_id.clone(),
            thread_id: session_id.clone(),
            parent_id: Some(user_message_id),
            role: MessageRole::Assistant,
            content: state.generated_sql.clone(),
            generated_sql: state.generated_sql.clone(),
            tables_used,
            validation_passed: Some(state.validation_passed),
            user_answer: None,
            clarification_questions: None,
            is_few_shot: false,
            token_count: None,
            branch_id: None,
            root_message_id: None,
            checkpoint_id: None,
            created_at: chrono::Utc::now(),
        });

        session.generated_sql = state.generated_sql.clone();
        session.validation_passed = Some(state.validation_passed);
        session.status = if failed {
            QueryStatus::Failed
        } else {
            QueryStatus::Completed
        };
        session.state = Some(Self::carryover_value(&state));

        if let Some(turn) = session.turns.iter_mut().find(|t| t.turn_id == turn_id) {
            turn.status = session.status;
            turn.final_sql = state.generated_sql.clone();
            turn.validation_passed = Some(state.validation_passed);
            turn.error = terminal_error.clone();
        }
        session.touch();
        self.store.update(session).await?;

        let validation_error = if state.validation_passed {
            None
        } else {
            terminal_error
                .clone()
                .or_else(|| state.validation_result.as_ref().and_then(|v| v.error.clone()))
        };

        Ok(QueryResponse {
            session_id,
            status: session.status,
            sql: state.generated_sql,
            validation_passed: Some(state.validation_passed),
            validation_error,
            clarification: None,
            error: if failed { terminal_error } else { None },
        })
    }

    /// Standalone SQL execution with the full guard rails.
    pub async fn execute_sql(&self, request: ExecuteRequest) -> ExecuteResponse {
        let timeout = request
            .timeout
            .min(self.handles.settings.execution.max_timeout_secs);

        let (tx, rx) = oneshot::channel();
        let sent = self
            .handles
            .sql_tx
            .send(SqlExecMsg::Execute {
                sql: request.sql.clone(),
                db_name: request.db_name.clone(),
                timeout_secs: timeout,
                limit: request.limit,
                allow_mutation: request.allow_mutation,
                respond_to: tx,
            })
            .await;

        if sent.is_err() {
            return ExecuteResponse::failed("sql executor unavailable");
        }

        match rx.await {
            Ok(Ok(result)) => ExecuteResponse {
                status: if result.success {
                    ExecuteStatus::Success
                } else {
                    ExecuteStatus::Failed
                },
                columns: Some(result.columns),
                rows: Some(result.rows),
                row_count: Some(result.row_count),
                affected_rows: result.affected_rows,
                execution_time_ms: Some(result.execution_time_ms),
                truncated: Some(result.truncated),
                error: result.error,
            },
            Ok(Err(e)) if e.starts_with("FORBIDDEN") => {
                ExecuteResponse::forbidden(e.trim_start_matches("FORBIDDEN: ").to_string())
            }
            Ok(Err(e)) if e.contains("timeout") => ExecuteResponse {
                status: ExecuteStatus::Timeout,
                ..ExecuteResponse::failed(e)
            },
            Ok(Err(e)) => ExecuteResponse::failed(e),
            Err(_) => ExecuteResponse::failed("sql executor died"),
        }
    }

    /// Plan charts for a result set and persist the plan on the turn.
    pub async fn plan_chart(
        &self,
        session_id: &str,
        turn_id: Option<&str>,
        input: VizInput,
        use_llm: bool,
    ) -> Result<VizOutcome, String> {
        let llm_tx = if use_llm {
            Some(&self.handles.llm_tx)
        } else {
            None
        };
        let outcome = run_viz_planner(&input, llm_tx).await;

        if let Some(mut session) = self.store.get(session_id).await {
            let target = match turn_id {
                Some(turn_id) => session.turns.iter_mut().find(|t| t.turn_id == turn_id),
                None => session.current_turn_mut(),
            };
            if let Some(turn) = target {
                turn.chart_plan = serde_json::to_value(&outcome.plan).ok();
                turn.chart_reasoning = outcome.plan.reasoning.clone();
            }
            session.touch();
            self.store.update(&session).await?;
        }

        Ok(outcome)
    }

    /// Promote a validated assistant message to a few-shot example.
    /// Duplicate questions (cosine ≥ threshold in the same database) are
    /// rejected with the existing example id.
    pub async fn mark_as_few_shot(&self, message_id: &str) -> Result<String, String> {
        let message = self.store.mark_as_few_shot(message_id).await?;

        let few_shot_tx = self
            .handles
            .few_shot_tx
            .as_ref()
            .ok_or_else(|| "few-shot store not configured".to_string())?;

        let session = self
            .store
            .get(&message.session_id)
            .await
            .ok_or_else(|| "session for message vanished".to_string())?;
        let db_name = session.db_name.clone().unwrap_or_default();

        let question = session
            .messages
            .values()
            .find(|m| Some(m.message_id.clone()) == message.parent_id)
            .and_then(|m| m.content.clone())
            .unwrap_or_else(|| message.content.clone().unwrap_or_default());
        let sql = message
            .generated_sql
            .clone()
            .ok_or_else(|| "message has no SQL to store".to_string())?;

        let embedding = self.handles.embeddings.encode(&question).await?;
        let example = FewShotExample {
            id: Uuid::new_v4().to_string(),
            db_name: db_name.clone(),
            question,
            sql,
            tables_used: message.tables_used.clone(),
            explanation: String::new(),
            message_id: message.message_id.clone(),
            created_at: chrono::Utc::now().timestamp(),
            score: 0.0,
        };

        let (tx, rx) = oneshot::channel();
        few_shot_tx
            .send(FewShotMsg::Insert {
                example,
                embedding,
                duplicate_threshold: self.handles.settings.storage.few_shot_duplicate_threshold,
                respond_to: tx,
            })
            .await
            .map_err(|_| "few-shot store unavailable".to_string())?;
        rx.await.map_err(|_| "few-shot store died".to_string())?
    }
}
