//! Command-line interface for the engine.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};

use crate::actors::graph_store_actor::GraphStoreMsg;
use crate::actors::schema_vector_actor::{
    ColumnEmbeddingRecord, SchemaVectorMsg, TableEmbeddingRecord,
};
use crate::demo_schema;
use crate::protocol::{ExecuteRequest, StreamEvent};
use crate::service::QueryService;
use crate::session::QueryStatus;

#[derive(Parser, Debug)]
#[command(name = "easysql", about = "Natural-language-to-SQL agent engine")]
pub struct Cli {
    /// Print verbose progress logging.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ask a natural-language question.
    Query {
        question: String,
        /// Target database name.
        #[arg(long)]
        db: Option<String>,
        /// Reuse an existing session for a follow-up question.
        #[arg(long)]
        session: Option<String>,
        /// Stream progress events to stdout.
        #[arg(long)]
        stream: bool,
    },
    /// Answer a pending clarification.
    Continue {
        session: String,
        answer: String,
    },
    /// Execute SQL directly (SELECT only unless --allow-mutation).
    Execute {
        sql: String,
        #[arg(long)]
        db: String,
        #[arg(long)]
        allow_mutation: bool,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// List recent sessions.
    Sessions {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Create and index the embedded medical demo database.
    SeedDemo {
        #[arg(long, default_value = "data/medical.db")]
        path: PathBuf,
    },
}

/// Drain stream events to stdout while a query runs.
fn spawn_event_printer(mut rx: mpsc::Receiver<StreamEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Token { content, .. } => {
                    print!("{}", content);
                }
                StreamEvent::AgentProgress(progress) => {
                    println!(
                        "\n[progress] iteration={} action={:?} tool={}",
                        progress.iteration,
                        progress.action,
                        progress.tool.as_deref().unwrap_or("-")
                    );
                }
                StreamEvent::StateUpdate(patch) => {
                    if crate::is_verbose_logging_enabled() {
                        println!("\n[state] {}", patch);
                    }
                }
                StreamEvent::Start { session_id } => {
                    println!("[session {}]", session_id);
                }
                StreamEvent::Complete(_) | StreamEvent::Error { .. } => {}
            }
        }
    })
}

fn print_response(response: &crate::service::QueryResponse) {
    match response.status {
        QueryStatus::AwaitingClarification => {
            println!("Clarification needed:");
            if let Some(clarification) = &response.clarification {
                for question in &clarification.questions {
                    println!("  - {}", question);
                }
            }
            println!(
                "\nAnswer with: easysql continue {} \"<answer>\"",
                response.session_id
            );
        }
        QueryStatus::Completed => {
            println!("\nSQL:\n{}", response.sql.as_deref().unwrap_or("(none)"));
            println!(
                "validated: {}",
                response.validation_passed.unwrap_or(false)
            );
            if let Some(error) = &response.validation_error {
                println!("validation error: {}", error);
            }
        }
        _ => {
            println!(
                "status: {:?}, error: {}",
                response.status,
                response.error.as_deref().unwrap_or("(none)")
            );
        }
    }
}

/// Dispatch one parsed command against a running engine.
pub async fn run_command(command: Command, service: &QueryService) -> Result<(), String> {
    match command {
        Command::Query {
            question,
            db,
            session,
            stream,
        } => {
            let session_id = match session {
                Some(id) => id,
                None => service.create_session(db.as_deref()).await?.session_id,
            };

            let response = if stream {
                let (events_tx, events_rx) = mpsc::channel(64);
                let printer = spawn_event_printer(events_rx);
                let response = service
                    .execute_query_streaming(&session_id, &question, events_tx)
                    .await?;
                let _ = printer.await;
                response
            } else {
                service.execute_query(&session_id, &question).await?
            };

            print_response(&response);
            Ok(())
        }

        Command::Continue { session, answer } => {
            let response = service.continue_conversation(&session, &answer).await?;
            print_response(&response);
            Ok(())
        }

        Command::Execute {
            sql,
            db,
            allow_mutation,
            limit,
        } => {
            let response = service
                .execute_sql(ExecuteRequest {
                    sql,
                    db_name: db,
                    allow_mutation,
                    limit,
                    timeout: 30,
                })
                .await;

            println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
            Ok(())
        }

        Command::Sessions { limit } => {
            let sessions = service.store().list_all(limit, 0).await?;
            println!("{} session(s):", sessions.len());
            for session in sessions {
                println!(
                    "  {}  {:?}  db={}  turns={}  {}",
                    session.session_id,
                    session.status,
                    session.db_name.as_deref().unwrap_or("-"),
                    session.turns.len(),
                    session.updated_at.format("%Y-%m-%d %H:%M:%S"),
                );
            }
            Ok(())
        }

        Command::SeedDemo { path } => seed_demo(&path, service).await,
    }
}

/// Create the demo database, seed the metadata graph, and index the schema
/// embeddings.
async fn seed_demo(path: &std::path::Path, service: &QueryService) -> Result<(), String> {
    demo_schema::create_demo_database(path)?;

    let handles = service.handles();
    let seeds = demo_schema::medical_schema_seeds();

    let (tx, rx) = oneshot::channel();
    handles
        .graph_tx
        .send(GraphStoreMsg::SeedSchema {
            tables: seeds.clone(),
            respond_to: tx,
        })
        .await
        .map_err(|_| "graph store unavailable".to_string())?;
    rx.await.map_err(|_| "graph store died".to_string())??;

    let mut indexed = 0usize;
    for seed in &seeds {
        let table_text = demo_schema::table_embedding_text(seed);
        let embedding = match handles.embeddings.encode(&table_text).await {
            Ok(embedding) => embedding,
            Err(e) => {
                println!("[SeedDemo] Skipping embeddings ({}), schema graph is seeded", e);
                return Ok(());
            }
        };

        let (tx, rx) = oneshot::channel();
        handles
            .vector_tx
            .send(SchemaVectorMsg::UpsertTable {
                record: TableEmbeddingRecord {
                    id: format!("{}::{}", demo_schema::DEMO_DB_NAME, seed.meta.name),
                    db_name: demo_schema::DEMO_DB_NAME.to_string(),
                    table_name: seed.meta.name.clone(),
                    chinese_name: seed.meta.chinese_name.clone(),
                    description: seed.meta.description.clone(),
                    domain: seed.meta.domain.clone(),
                    core_columns_text: table_text,
                },
                embedding,
                respond_to: tx,
            })
            .await
            .map_err(|_| "vector store unavailable".to_string())?;
        rx.await.map_err(|_| "vector store died".to_string())??;

        for column in &seed.columns {
            let column_text = demo_schema::column_embedding_text(&seed.meta.name, column);
            let embedding = handles.embeddings.encode(&column_text).await?;

            let (tx, rx) = oneshot::channel();
            handles
                .vector_tx
                .send(SchemaVectorMsg::UpsertColumn {
                    record: ColumnEmbeddingRecord {
                        id: format!(
                            "{}::{}::{}",
                            demo_schema::DEMO_DB_NAME,
                            seed.meta.name,
                            column.name
                        ),
                        db_name: demo_schema::DEMO_DB_NAME.to_string(),
                        table_name: seed.meta.name.clone(),
                        column_name: column.name.clone(),
                        chinese_name: column.chinese_name.clone(),
                        data_type: column.data_type.clone(),
                        is_pk: column.is_pk,
                        is_fk: column.is_fk,
                    },
                    embedding,
                    respond_to: tx,
                })
                .await
                .map_err(|_| "vector store unavailable".to_string())?;
            rx.await.map_err(|_| "vector store died".to_string())??;
        }

        indexed += 1;
        println!("[SeedDemo] Indexed {}", seed.meta.name);
    }

    println!("[SeedDemo] Done: {} tables indexed", indexed);
    Ok(())
}
