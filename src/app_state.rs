//! Engine wiring: actor startup, shared handles, runtime config overrides.
//!
//! All actors are spawned at startup; the handles struct carries their
//! channel senders plus the shared embedding service. Teardown is implied
//! by channel closure: dropping every sender ends each actor's message
//! loop in reverse dependency order.

use std::sync::Arc;
use tokio::sync::{mpsc, watch, RwLock};

use crate::actors::code_vector_actor::{CodeVectorActor, CodeVectorMsg};
use crate::actors::few_shot_actor::{FewShotActor, FewShotMsg};
use crate::actors::graph_store_actor::{GraphStoreActor, GraphStoreMsg};
use crate::actors::llm_gateway_actor::{LlmBackend, LlmGatewayActor, LlmMsg};
use crate::actors::schema_vector_actor::{SchemaVectorActor, SchemaVectorMsg};
use crate::actors::sql_executor_actor::{SqlExecMsg, SqlExecutorActor};
use crate::embeddings::{EmbeddingService, SharedEmbeddingProvider};
use crate::graph::NodeContext;
use crate::protocol::StreamEvent;
use crate::session::{MemorySessionStore, PgSessionStore, SessionStore};
use crate::settings::AppSettings;

const ACTOR_CHANNEL_CAPACITY: usize = 64;

/// Channel senders and shared services the engine runs on.
#[derive(Clone)]
pub struct EngineHandles {
    pub settings: Arc<AppSettings>,
    pub graph_tx: mpsc::Sender<GraphStoreMsg>,
    pub vector_tx: mpsc::Sender<SchemaVectorMsg>,
    pub few_shot_tx: Option<mpsc::Sender<FewShotMsg>>,
    pub code_tx: Option<mpsc::Sender<CodeVectorMsg>>,
    pub sql_tx: mpsc::Sender<SqlExecMsg>,
    pub llm_tx: mpsc::Sender<LlmMsg>,
    pub embeddings: Arc<EmbeddingService>,
}

impl EngineHandles {
    /// A per-run node context over these handles.
    pub fn node_context(
        &self,
        cancel_rx: watch::Receiver<bool>,
        events: Option<mpsc::Sender<StreamEvent>>,
    ) -> NodeContext {
        NodeContext {
            settings: self.settings.clone(),
            graph_tx: self.graph_tx.clone(),
            vector_tx: self.vector_tx.clone(),
            few_shot_tx: self.few_shot_tx.clone(),
            code_tx: self.code_tx.clone(),
            sql_tx: self.sql_tx.clone(),
            llm_tx: self.llm_tx.clone(),
            embeddings: self.embeddings.clone(),
            cancel_rx,
            events,
        }
    }
}

/// Spawn every actor and return the handles plus the session store.
pub async fn start_engine(
    settings: AppSettings,
    llm_backend: LlmBackend,
    embedding_provider: SharedEmbeddingProvider,
) -> Result<(EngineHandles, Arc<SessionStore>), String> {
    let settings = Arc::new(settings);

    // Schema graph store.
    let (graph_tx, graph_rx) = mpsc::channel(ACTOR_CHANNEL_CAPACITY);
    let graph_actor = GraphStoreActor::new(graph_rx, &settings.storage.metadata_db_path)?;
    tokio::spawn(graph_actor.run());

    // Vector collections share one LanceDB directory.
    let vector_path = settings.storage.vector_store_path.clone();
    let (vector_tx, vector_rx) = mpsc::channel(ACTOR_CHANNEL_CAPACITY);
    let schema_vector_actor = SchemaVectorActor::new(vector_rx, &vector_path).await?;
    tokio::spawn(schema_vector_actor.run());

    let (few_shot_tx, few_shot_rx) = mpsc::channel(ACTOR_CHANNEL_CAPACITY);
    let few_shot_actor = FewShotActor::new(few_shot_rx, &vector_path).await?;
    tokio::spawn(few_shot_actor.run());

    let (code_tx, code_rx) = mpsc::channel(ACTOR_CHANNEL_CAPACITY);
    let code_actor = CodeVectorActor::new(code_rx, &vector_path).await?;
    tokio::spawn(code_actor.run());

    // SQL executor.
    let (sql_tx, sql_rx) = mpsc::channel(ACTOR_CHANNEL_CAPACITY);
    let sql_actor = SqlExecutorActor::new(sql_rx, (*settings).clone());
    tokio::spawn(sql_actor.run());

    // LLM gateway.
    let (llm_tx, llm_rx) = mpsc::channel(ACTOR_CHANNEL_CAPACITY);
    let llm_actor = LlmGatewayActor::new(llm_rx, settings.llm.clone(), llm_backend);
    tokio::spawn(llm_actor.run());

    let embeddings = Arc::new(EmbeddingService::new(embedding_provider));

    // Session store backend.
    let store = match settings.storage.session_backend.as_str() {
        "postgres" => {
            let db_name = settings
                .storage
                .session_db_name
                .clone()
                .ok_or_else(|| "postgres session backend requires session_db_name".to_string())?;
            SessionStore::Postgres(PgSessionStore::new(sql_tx.clone(), db_name).await?)
        }
        _ => SessionStore::Memory(MemorySessionStore::new(settings.storage.max_sessions)),
    };

    println!(
        "[Engine] Started ({} session backend, {} databases configured)",
        settings.storage.session_backend,
        settings.databases.len()
    );

    Ok((
        EngineHandles {
            settings,
            graph_tx,
            vector_tx,
            few_shot_tx: Some(few_shot_tx),
            code_tx: Some(code_tx),
            sql_tx,
            llm_tx,
            embeddings,
        },
        Arc::new(store),
    ))
}

/// Runtime configuration overrides with copy-on-write swap. Dependent
/// caches are invalidated on every update.
pub struct RuntimeConfig {
    current: RwLock<Arc<AppSettings>>,
    embeddings: Arc<EmbeddingService>,
}

impl RuntimeConfig {
    pub fn new(settings: Arc<AppSettings>, embeddings: Arc<EmbeddingService>) -> Self {
        Self {
            current: RwLock::new(settings),
            embeddings,
        }
    }

    pub async fn current(&self) -> Arc<AppSettings> {
        self.current.read().await.clone()
    }

    /// Swap in an updated settings value and clear dependent caches.
    pub async fn apply<F>(&self, mutate: F)
    where
        F: FnOnce(&mut AppSettings),
    {
        let mut guard = self.current.write().await;
        let mut next = (**guard).clone();
        mutate(&mut next);
        *guard = Arc::new(next);
        drop(guard);

        // Cache invalidation: embeddings are the only process-local cache
        // keyed by config-dependent inputs.
        self.embeddings.clear_cache();
        println!("[RuntimeConfig] Override applied, caches invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::HashEmbeddingProvider;

    #[tokio::test]
    async fn test_runtime_config_copy_on_write() {
        let provider: SharedEmbeddingProvider = Arc::new(RwLock::new(Some(
            Arc::new(HashEmbeddingProvider) as Arc<dyn crate::embeddings::EmbeddingProvider>,
        )));
        let embeddings = Arc::new(EmbeddingService::new(provider));
        let config = RuntimeConfig::new(Arc::new(AppSettings::default()), embeddings);

        let before = config.current().await;
        config
            .apply(|s| s.retrieval.search_top_k = 42)
            .await;
        let after = config.current().await;

        assert_eq!(before.retrieval.search_top_k, 10);
        assert_eq!(after.retrieval.search_top_k, 42);
    }
}
