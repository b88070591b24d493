//! Agent graph runtime.
//!
//! The compiled graph is an immutable value: node identifiers plus pure
//! routing functions over the state. The runner executes nodes
//! sequentially for one thread id, merging each node's partial update at
//! the node boundary, emitting sanitized stream events, honoring
//! cancellation between nodes, and persisting a checkpoint when the
//! clarify node suspends.

pub mod state;

use serde_json::json;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::actors::code_vector_actor::CodeVectorMsg;
use crate::actors::few_shot_actor::FewShotMsg;
use crate::actors::graph_store_actor::GraphStoreMsg;
use crate::actors::llm_gateway_actor::LlmMsg;
use crate::actors::schema_vector_actor::SchemaVectorMsg;
use crate::actors::sql_executor_actor::SqlExecMsg;
use crate::embeddings::EmbeddingService;
use crate::nodes;
use crate::protocol::{ClarificationPayload, StreamEvent};
use crate::session::SessionStore;
use crate::settings::AppSettings;
use state::{sanitize, AgentState, StateUpdate};

/// Node identifiers of the compiled graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeId {
    Analyze,
    Clarify,
    ShiftDetect,
    Retrieve,
    RetrieveFewShot,
    BuildContext,
    GenerateSql,
    ValidateSql,
    RepairSql,
    SqlAgent,
    UpdateHistory,
    End,
}

impl NodeId {
    pub fn name(&self) -> &'static str {
        match self {
            NodeId::Analyze => "analyze",
            NodeId::Clarify => "clarify",
            NodeId::ShiftDetect => "shift_detect",
            NodeId::Retrieve => "retrieve",
            NodeId::RetrieveFewShot => "retrieve_few_shot",
            NodeId::BuildContext => "build_context",
            NodeId::GenerateSql => "generate_sql",
            NodeId::ValidateSql => "validate_sql",
            NodeId::RepairSql => "repair_sql",
            NodeId::SqlAgent => "sql_agent",
            NodeId::UpdateHistory => "update_history",
            NodeId::End => "end",
        }
    }
}

/// Everything a node may reach: actor channels, settings, cancellation,
/// and the stream event sink.
#[derive(Clone)]
pub struct NodeContext {
    pub settings: Arc<AppSettings>,
    pub graph_tx: mpsc::Sender<GraphStoreMsg>,
    pub vector_tx: mpsc::Sender<SchemaVectorMsg>,
    pub few_shot_tx: Option<mpsc::Sender<FewShotMsg>>,
    pub code_tx: Option<mpsc::Sender<CodeVectorMsg>>,
    pub sql_tx: mpsc::Sender<SqlExecMsg>,
    pub llm_tx: mpsc::Sender<LlmMsg>,
    pub embeddings: Arc<EmbeddingService>,
    pub cancel_rx: watch::Receiver<bool>,
    /// Bounded sink; sends block when the consumer is slow.
    pub events: Option<mpsc::Sender<StreamEvent>>,
}

impl NodeContext {
    pub fn cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    pub async fn emit(&self, event: StreamEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event).await;
        }
    }
}

/// What one node produced.
pub enum NodeOutcome {
    Update(StateUpdate),
    /// Cooperative suspend awaiting a user answer.
    Interrupt(ClarificationPayload),
}

/// The compiled agent graph. Immutable after build, shared process-wide.
#[derive(Debug, Clone, Copy)]
pub struct AgentGraph {
    pub use_agent_mode: bool,
    pub max_sql_retries: usize,
}

impl AgentGraph {
    pub fn from_settings(settings: &AppSettings) -> Self {
        Self {
            use_agent_mode: settings.llm.use_agent_mode,
            max_sql_retries: settings.llm.max_sql_retries,
        }
    }

    pub fn entry() -> NodeId {
        NodeId::Analyze
    }

    /// Pure routing: reads state, performs no IO.
    pub fn next(&self, node: NodeId, state: &AgentState) -> NodeId {
        match node {
            NodeId::Analyze => {
                if state
                    .clarification_questions
                    .as_ref()
                    .map(|q| !q.is_empty())
                    .unwrap_or(false)
                {
                    NodeId::Clarify
                } else if !state.conversation_history.is_empty()
                    && state.cached_retrieval.is_some()
                {
                    NodeId::ShiftDetect
                } else {
                    NodeId::Retrieve
                }
            }
            NodeId::Clarify => NodeId::Retrieve,
            NodeId::ShiftDetect => NodeId::Retrieve,
            NodeId::Retrieve => NodeId::RetrieveFewShot,
            NodeId::RetrieveFewShot => NodeId::BuildContext,
            NodeId::BuildContext => {
                if self.use_agent_mode {
                    NodeId::SqlAgent
                } else {
                    NodeId::GenerateSql
                }
            }
            NodeId::GenerateSql => NodeId::ValidateSql,
            NodeId::ValidateSql => {
                if state.validation_passed {
                    NodeId::UpdateHistory
                } else if state.retry_count < self.max_sql_retries {
                    NodeId::RepairSql
                } else {
                    NodeId::UpdateHistory
                }
            }
            NodeId::RepairSql => NodeId::ValidateSql,
            NodeId::SqlAgent => NodeId::UpdateHistory,
            NodeId::UpdateHistory => NodeId::End,
            NodeId::End => NodeId::End,
        }
    }
}

/// Outcome of one runner invocation.
pub enum RunOutcome {
    Complete(AgentState),
    Interrupted {
        state: AgentState,
        payload: ClarificationPayload,
    },
}

/// Checkpoint payload persisted on suspension.
fn checkpoint_value(state: &AgentState, node: NodeId) -> serde_json::Value {
    json!({ "node": node, "state": state })
}

/// Restore a checkpoint into (state, node).
pub fn parse_checkpoint(value: &serde_json::Value) -> Result<(AgentState, NodeId), String> {
    let node: NodeId = serde_json::from_value(value["node"].clone())
        .map_err(|e| format!("corrupt checkpoint node: {}", e))?;
    let state: AgentState = serde_json::from_value(value["state"].clone())
        .map_err(|e| format!("corrupt checkpoint state: {}", e))?;
    Ok((state, node))
}

/// Executes the graph for one thread.
pub struct GraphRunner {
    pub graph: AgentGraph,
}

impl GraphRunner {
    pub fn new(graph: AgentGraph) -> Self {
        Self { graph }
    }

    /// Run from `start` until END or an interrupt. State updates apply
    /// atomically at node boundaries; a sanitized patch is emitted after
    /// each node.
    pub async fn run(
        &self,
        mut state: AgentState,
        thread_id: &str,
        start: NodeId,
        ctx: &NodeContext,
        store: &SessionStore,
    ) -> Result<RunOutcome, String> {
        let mut node = start;

        while node != NodeId::End {
            if ctx.cancelled() {
                return Err("cancelled".to_string());
            }

            println!("[GraphRunner] thread={} node={}", thread_id, node.name());

            let outcome = self.execute_node(node, &state, ctx).await;

            let update = match outcome {
                Ok(NodeOutcome::Update(update)) => update,
                Ok(NodeOutcome::Interrupt(payload)) => {
                    store
                        .save_checkpoint(thread_id, checkpoint_value(&state, node))
                        .await?;
                    return Ok(RunOutcome::Interrupted { state, payload });
                }
                Err(error) => {
                    println!(
                        "[GraphRunner] node {} failed: {}",
                        node.name(),
                        error
                    );
                    state.error = Some(error);
                    break;
                }
            };

            update.apply(&mut state);
            ctx.emit(StreamEvent::StateUpdate(sanitize(&state))).await;

            // Errors are terminal unless an explicit repair edge handles
            // them (the validate -> repair cycle carries its own error).
            if state.error.is_some()
                && !matches!(
                    node,
                    NodeId::ValidateSql
                        | NodeId::RepairSql
                        | NodeId::SqlAgent
                        | NodeId::UpdateHistory
                )
            {
                break;
            }

            node = self.graph.next(node, &state);
        }

        store.delete_checkpoint(thread_id).await;
        Ok(RunOutcome::Complete(state))
    }

    async fn execute_node(
        &self,
        node: NodeId,
        state: &AgentState,
        ctx: &NodeContext,
    ) -> Result<NodeOutcome, String> {
        match node {
            NodeId::Analyze => nodes::analyze::run(state, ctx).await,
            NodeId::Clarify => nodes::clarify::run(state, ctx).await,
            NodeId::ShiftDetect => nodes::shift_detect::run(state, ctx).await,
            NodeId::Retrieve => nodes::retrieve::run(state, ctx).await,
            NodeId::RetrieveFewShot => nodes::retrieve_few_shot::run(state, ctx).await,
            NodeId::BuildContext => nodes::build_context::run(state, ctx).await,
            NodeId::GenerateSql => nodes::generate_sql::run(state, ctx).await,
            NodeId::ValidateSql => nodes::validate_sql::run(state, ctx).await,
            NodeId::RepairSql => nodes::repair_sql::run(state, ctx).await,
            NodeId::SqlAgent => nodes::sql_agent::run(state, ctx).await,
            NodeId::UpdateHistory => nodes::update_history::run(state, ctx).await,
            NodeId::End => Ok(NodeOutcome::Update(StateUpdate::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> AgentGraph {
        AgentGraph {
            use_agent_mode: false,
            max_sql_retries: 2,
        }
    }

    #[test]
    fn test_analyze_routes_to_clarify_on_questions() {
        let mut state = AgentState::for_query("q", None);
        state.clarification_questions = Some(vec!["which date?".to_string()]);
        assert_eq!(graph().next(NodeId::Analyze, &state), NodeId::Clarify);
    }

    #[test]
    fn test_analyze_routes_to_retrieve_without_questions() {
        let state = AgentState::for_query("q", None);
        assert_eq!(graph().next(NodeId::Analyze, &state), NodeId::Retrieve);

        let mut state = AgentState::for_query("q", None);
        state.clarification_questions = Some(vec![]);
        assert_eq!(graph().next(NodeId::Analyze, &state), NodeId::Retrieve);
    }

    #[test]
    fn test_analyze_routes_to_shift_detect_with_cache() {
        let mut state = AgentState::for_query("q", None);
        state.conversation_history.push(crate::multi_turn::ConversationTurn {
            message_id: "m".to_string(),
            question: "prior".to_string(),
            sql: None,
            tables_used: vec![],
            token_count: 10,
        });
        state.cached_retrieval = Some(Default::default());
        assert_eq!(graph().next(NodeId::Analyze, &state), NodeId::ShiftDetect);
    }

    #[test]
    fn test_validate_routing_repair_cycle() {
        let mut state = AgentState::for_query("q", None);
        state.validation_passed = false;
        state.retry_count = 0;
        assert_eq!(graph().next(NodeId::ValidateSql, &state), NodeId::RepairSql);

        state.retry_count = 2;
        assert_eq!(
            graph().next(NodeId::ValidateSql, &state),
            NodeId::UpdateHistory
        );

        state.validation_passed = true;
        state.retry_count = 0;
        assert_eq!(
            graph().next(NodeId::ValidateSql, &state),
            NodeId::UpdateHistory
        );
    }

    #[test]
    fn test_agent_mode_replaces_naive_chain() {
        let state = AgentState::for_query("q", None);
        let agent_graph = AgentGraph {
            use_agent_mode: true,
            max_sql_retries: 2,
        };
        assert_eq!(
            agent_graph.next(NodeId::BuildContext, &state),
            NodeId::SqlAgent
        );
        assert_eq!(
            agent_graph.next(NodeId::SqlAgent, &state),
            NodeId::UpdateHistory
        );
        assert_eq!(graph().next(NodeId::BuildContext, &state), NodeId::GenerateSql);
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let state = AgentState::for_query("suspended question", None);
        let value = checkpoint_value(&state, NodeId::Clarify);
        let (restored, node) = parse_checkpoint(&value).unwrap();
        assert_eq!(node, NodeId::Clarify);
        assert_eq!(restored.raw_query, "suspended question");
    }
}
