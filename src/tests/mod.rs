//! Integration tests: real graph store and SQL executor over a seeded
//! demo database, scripted LLM gateway, and a canned schema vector store.

mod graph_integration;
mod multi_turn_integration;

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, RwLock};

use crate::actors::graph_store_actor::{GraphStoreActor, GraphStoreMsg};
use crate::actors::llm_gateway_actor::{spawn_scripted_gateway, ScriptedReply};
use crate::actors::schema_vector_actor::{ColumnHit, SchemaVectorMsg, TableHit};
use crate::actors::sql_executor_actor::{SqlExecMsg, SqlExecutorActor};
use crate::app_state::EngineHandles;
use crate::demo_schema;
use crate::embeddings::{
    EmbeddingProvider, EmbeddingService, HashEmbeddingProvider, SharedEmbeddingProvider,
};
use crate::service::QueryService;
use crate::session::{MemorySessionStore, SessionStore};
use crate::settings::AppSettings;

/// A vector-store stub that answers every table search with the same
/// canned hits (tests pick hits matching their scenario).
pub(crate) fn spawn_stub_vector_store(
    table_hits: Vec<TableHit>,
    column_hits: Vec<ColumnHit>,
) -> mpsc::Sender<SchemaVectorMsg> {
    let (tx, mut rx) = mpsc::channel::<SchemaVectorMsg>(32);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match msg {
                SchemaVectorMsg::SearchTables {
                    limit, respond_to, ..
                } => {
                    let hits: Vec<TableHit> =
                        table_hits.iter().take(limit).cloned().collect();
                    let _ = respond_to.send(Ok(hits));
                }
                SchemaVectorMsg::SearchColumns {
                    table_filter,
                    limit,
                    respond_to,
                    ..
                } => {
                    let hits: Vec<ColumnHit> = column_hits
                        .iter()
                        .filter(|hit| {
                            table_filter
                                .as_ref()
                                .map(|tables| tables.contains(&hit.table_name))
                                .unwrap_or(true)
                        })
                        .take(limit)
                        .cloned()
                        .collect();
                    let _ = respond_to.send(Ok(hits));
                }
                SchemaVectorMsg::UpsertTable { respond_to, .. } => {
                    let _ = respond_to.send(Ok(()));
                }
                SchemaVectorMsg::UpsertColumn { respond_to, .. } => {
                    let _ = respond_to.send(Ok(()));
                }
            }
        }
    });
    tx
}

pub(crate) fn table_hit(name: &str, score: f32) -> TableHit {
    TableHit {
        table_name: name.to_string(),
        db_name: demo_schema::DEMO_DB_NAME.to_string(),
        chinese_name: None,
        description: None,
        score,
    }
}

pub(crate) fn column_hit(table: &str, column: &str, data_type: &str, score: f32) -> ColumnHit {
    ColumnHit {
        table_name: table.to_string(),
        column_name: column.to_string(),
        chinese_name: None,
        data_type: data_type.to_string(),
        is_pk: false,
        is_fk: false,
        score,
    }
}

/// A fully wired engine over temp storage.
pub(crate) struct TestEngine {
    pub service: QueryService,
    _dir: tempfile::TempDir,
}

pub(crate) async fn build_engine(
    scripted: Vec<ScriptedReply>,
    table_hits: Vec<TableHit>,
    column_hits: Vec<ColumnHit>,
    configure: impl FnOnce(&mut AppSettings),
) -> TestEngine {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("medical.db");
    demo_schema::create_demo_database(&db_path).expect("demo db");

    let mut settings: AppSettings = serde_json::from_str(&format!(
        r#"{{"databases": [{{"name": "medical", "kind": "sqlite", "path": "{}"}}]}}"#,
        db_path.display()
    ))
    .expect("settings");
    configure(&mut settings);

    // Real metadata graph, seeded with the demo schema.
    let (graph_tx, graph_rx) = mpsc::channel(32);
    let graph_actor = GraphStoreActor::new(graph_rx, ":memory:").expect("graph store");
    tokio::spawn(graph_actor.run());

    let (seed_tx, seed_rx) = oneshot::channel();
    graph_tx
        .send(GraphStoreMsg::SeedSchema {
            tables: demo_schema::medical_schema_seeds(),
            respond_to: seed_tx,
        })
        .await
        .expect("seed send");
    seed_rx.await.expect("seed reply").expect("seed ok");

    // Real executor against the demo sqlite database.
    let (sql_tx, sql_rx) = mpsc::channel::<SqlExecMsg>(32);
    let sql_actor = SqlExecutorActor::new(sql_rx, settings.clone());
    tokio::spawn(sql_actor.run());

    let vector_tx = spawn_stub_vector_store(table_hits, column_hits);
    let llm_tx = spawn_scripted_gateway(scripted);

    let provider: SharedEmbeddingProvider = Arc::new(RwLock::new(Some(
        Arc::new(HashEmbeddingProvider) as Arc<dyn EmbeddingProvider>,
    )));
    let embeddings = Arc::new(EmbeddingService::new(provider));

    let handles = EngineHandles {
        settings: Arc::new(settings),
        graph_tx,
        vector_tx,
        few_shot_tx: None,
        code_tx: None,
        sql_tx,
        llm_tx,
        embeddings,
    };

    let store = Arc::new(SessionStore::Memory(MemorySessionStore::new(100)));

    TestEngine {
        service: QueryService::new(handles, store),
        _dir: dir,
    }
}

/// Scripted reply helpers.
pub(crate) fn structured_reply(value: serde_json::Value) -> ScriptedReply {
    ScriptedReply {
        content: value.to_string(),
        structured: Some(value),
        ..Default::default()
    }
}

pub(crate) fn text_reply(content: &str) -> ScriptedReply {
    ScriptedReply {
        content: content.to_string(),
        ..Default::default()
    }
}

pub(crate) fn tool_call_reply(name: &str, arguments: serde_json::Value, id: &str) -> ScriptedReply {
    ScriptedReply {
        content: String::new(),
        tool_calls: vec![crate::protocol::ParsedToolCall {
            name: name.to_string(),
            arguments,
            id: Some(id.to_string()),
        }],
        ..Default::default()
    }
}
