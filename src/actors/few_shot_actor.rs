//! Few-Shot Store Actor - curated Q&A examples in LanceDB.
//!
//! This actor handles:
//! - Semantic search for examples similar to an incoming question
//! - Duplicate-gated inserts (top-1 cosine ≥ threshold in the same database
//!   is rejected and the existing example id is surfaced)
//! - Listing, lookup by message id, and deletion

use arrow_array::{Array, Float32Array, Int64Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use futures::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Table};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::lance::{ensure_table, escape_filter_value, score_from_distance, vector_cell, vector_field};

/// A stored or retrieved few-shot example.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FewShotExample {
    pub id: String,
    pub db_name: String,
    pub question: String,
    pub sql: String,
    pub tables_used: Vec<String>,
    pub explanation: String,
    pub message_id: String,
    pub created_at: i64,
    #[serde(default)]
    pub score: f32,
}

/// Messages for the Few-Shot Store Actor.
#[derive(Debug)]
pub enum FewShotMsg {
    SearchSimilar {
        query_embedding: Vec<f32>,
        db_name: String,
        top_k: usize,
        min_score: f32,
        respond_to: oneshot::Sender<Result<Vec<FewShotExample>, String>>,
    },
    Insert {
        example: FewShotExample,
        embedding: Vec<f32>,
        duplicate_threshold: f32,
        respond_to: oneshot::Sender<Result<String, String>>,
    },
    ListByDb {
        db_name: String,
        limit: usize,
        respond_to: oneshot::Sender<Result<Vec<FewShotExample>, String>>,
    },
    GetByMessageId {
        message_id: String,
        respond_to: oneshot::Sender<Result<Option<FewShotExample>, String>>,
    },
    Delete {
        id: String,
        respond_to: oneshot::Sender<Result<(), String>>,
    },
}

fn few_shot_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("db_name", DataType::Utf8, false),
        Field::new("question", DataType::Utf8, false),
        Field::new("sql", DataType::Utf8, false),
        // Comma-joined, matching the canonical collection schema.
        Field::new("tables_used", DataType::Utf8, false),
        Field::new("explanation", DataType::Utf8, true),
        Field::new("message_id", DataType::Utf8, true),
        Field::new("created_at", DataType::Int64, false),
        vector_field(),
    ]))
}

/// Few-Shot Store Actor.
pub struct FewShotActor {
    rx: mpsc::Receiver<FewShotMsg>,
    table: Table,
}

impl FewShotActor {
    pub async fn new(rx: mpsc::Receiver<FewShotMsg>, db_path: &str) -> Result<Self, String> {
        let db_connection = connect(db_path)
            .execute()
            .await
            .map_err(|e| format!("vector store unavailable: {}", e))?;

        let table = ensure_table(&db_connection, "few_shot_examples", few_shot_schema()).await?;
        Ok(Self { rx, table })
    }

    /// Run the actor's message loop.
    pub async fn run(mut self) {
        println!("[FewShotActor] Started");

        while let Some(msg) = self.rx.recv().await {
            let table = self.table.clone();

            tokio::spawn(async move {
                match msg {
                    FewShotMsg::SearchSimilar {
                        query_embedding,
                        db_name,
                        top_k,
                        min_score,
                        respond_to,
                    } => {
                        let _ = respond_to.send(
                            search_similar(&table, query_embedding, &db_name, top_k, min_score)
                                .await,
                        );
                    }
                    FewShotMsg::Insert {
                        example,
                        embedding,
                        duplicate_threshold,
                        respond_to,
                    } => {
                        let _ = respond_to
                            .send(insert(&table, example, embedding, duplicate_threshold).await);
                    }
                    FewShotMsg::ListByDb {
                        db_name,
                        limit,
                        respond_to,
                    } => {
                        let _ = respond_to.send(list_by_db(&table, &db_name, limit).await);
                    }
                    FewShotMsg::GetByMessageId {
                        message_id,
                        respond_to,
                    } => {
                        let _ = respond_to.send(get_by_message_id(&table, &message_id).await);
                    }
                    FewShotMsg::Delete { id, respond_to } => {
                        let filter = format!("id = '{}'", escape_filter_value(&id));
                        let result = table
                            .delete(&filter)
                            .await
                            .map(|_| ())
                            .map_err(|e| format!("Failed to delete example: {}", e));
                        let _ = respond_to.send(result);
                    }
                }
            });
        }

        println!("[FewShotActor] Stopped");
    }
}

fn parse_examples(batch: &RecordBatch, scores: bool) -> Vec<FewShotExample> {
    let ids = batch
        .column_by_name("id")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let dbs = batch
        .column_by_name("db_name")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let questions = batch
        .column_by_name("question")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let sqls = batch
        .column_by_name("sql")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let tables = batch
        .column_by_name("tables_used")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let explanations = batch
        .column_by_name("explanation")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let message_ids = batch
        .column_by_name("message_id")
        .and_then(|c| c.as_any().downcast_ref::<StringArray>());
    let created = batch
        .column_by_name("created_at")
        .and_then(|c| c.as_any().downcast_ref::<Int64Array>());
    let distances = batch
        .column_by_name("_distance")
        .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

    let (ids, dbs, questions, sqls) = match (ids, dbs, questions, sqls) {
        (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
        _ => return Vec::new(),
    };

    let mut out = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        let tables_str = tables.map(|t| t.value(i).to_string()).unwrap_or_default();
        let tables_used: Vec<String> = tables_str
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        let score = if scores {
            distances
                .map(|d| score_from_distance(d.value(i)))
                .unwrap_or(0.0)
        } else {
            1.0
        };

        out.push(FewShotExample {
            id: ids.value(i).to_string(),
            db_name: dbs.value(i).to_string(),
            question: questions.value(i).to_string(),
            sql: sqls.value(i).to_string(),
            tables_used,
            explanation: explanations.map(|e| e.value(i).to_string()).unwrap_or_default(),
            message_id: message_ids.map(|m| m.value(i).to_string()).unwrap_or_default(),
            created_at: created.map(|c| c.value(i)).unwrap_or(0),
            score,
        });
    }
    out
}

async fn search_similar(
    table: &Table,
    query_embedding: Vec<f32>,
    db_name: &str,
    top_k: usize,
    min_score: f32,
) -> Result<Vec<FewShotExample>, String> {
    let mut stream = table
        .query()
        .nearest_to(query_embedding)
        .map_err(|e| format!("Failed to create few-shot query: {}", e))?
        .only_if(format!("db_name = '{}'", escape_filter_value(db_name)))
        .limit(top_k)
        .execute()
        .await
        .map_err(|e| format!("Failed to execute few-shot query: {}", e))?;

    let mut examples = Vec::new();
    while let Some(batch_result) = stream.next().await {
        if let Ok(batch) = batch_result {
            examples.extend(parse_examples(&batch, true));
        }
    }

    examples.retain(|e| e.score >= min_score);
    examples.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(examples)
}

async fn insert(
    table: &Table,
    example: FewShotExample,
    embedding: Vec<f32>,
    duplicate_threshold: f32,
) -> Result<String, String> {
    // Duplicate gate: the nearest existing example in the same database.
    let duplicates = search_similar(
        table,
        embedding.clone(),
        &example.db_name,
        1,
        duplicate_threshold,
    )
    .await?;

    if let Some(existing) = duplicates.first() {
        return Err(format!(
            "Duplicate example (score {:.3} >= {:.2}): existing id {}",
            existing.score, duplicate_threshold, existing.id
        ));
    }

    let batch = RecordBatch::try_new(
        few_shot_schema(),
        vec![
            Arc::new(StringArray::from(vec![example.id.clone()])),
            Arc::new(StringArray::from(vec![example.db_name.clone()])),
            Arc::new(StringArray::from(vec![example.question.clone()])),
            Arc::new(StringArray::from(vec![example.sql.clone()])),
            Arc::new(StringArray::from(vec![example.tables_used.join(",")])),
            Arc::new(StringArray::from(vec![example.explanation.clone()])),
            Arc::new(StringArray::from(vec![example.message_id.clone()])),
            Arc::new(Int64Array::from(vec![example.created_at])),
            Arc::new(vector_cell(&embedding)),
        ],
    )
    .map_err(|e| format!("Failed to create few-shot batch: {}", e))?;

    table
        .add(Box::new(RecordBatchIterator::new(
            vec![Ok(batch)],
            few_shot_schema(),
        )))
        .execute()
        .await
        .map_err(|e| format!("Failed to add few-shot example: {}", e))?;

    println!(
        "[FewShotActor] Stored example {} for db {}",
        example.id, example.db_name
    );
    Ok(example.id)
}

async fn list_by_db(
    table: &Table,
    db_name: &str,
    limit: usize,
) -> Result<Vec<FewShotExample>, String> {
    let mut stream = table
        .query()
        .only_if(format!("db_name = '{}'", escape_filter_value(db_name)))
        .limit(limit)
        .execute()
        .await
        .map_err(|e| format!("Failed to list examples: {}", e))?;

    let mut examples = Vec::new();
    while let Some(batch_result) = stream.next().await {
        if let Ok(batch) = batch_result {
            examples.extend(parse_examples(&batch, false));
        }
    }

    examples.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(examples)
}

async fn get_by_message_id(
    table: &Table,
    message_id: &str,
) -> Result<Option<FewShotExample>, String> {
    if message_id.is_empty() {
        return Ok(None);
    }

    let mut stream = table
        .query()
        .only_if(format!(
            "message_id = '{}'",
            escape_filter_value(message_id)
        ))
        .limit(1)
        .execute()
        .await
        .map_err(|e| format!("Failed to query examples: {}", e))?;

    while let Some(batch_result) = stream.next().await {
        if let Ok(batch) = batch_result {
            let mut parsed = parse_examples(&batch, false);
            if !parsed.is_empty() {
                return Ok(Some(parsed.remove(0)));
            }
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_few_shot_example_serde_roundtrip() {
        let example = FewShotExample {
            id: "fs-1".to_string(),
            db_name: "medical".to_string(),
            question: "How many patients were admitted this month?".to_string(),
            sql: "SELECT COUNT(*) FROM admission WHERE admit_date >= date('now','start of month')"
                .to_string(),
            tables_used: vec!["admission".to_string()],
            explanation: "Counts current-month admissions".to_string(),
            message_id: "msg-1".to_string(),
            created_at: 1_722_470_400,
            score: 0.0,
        };

        let json = serde_json::to_string(&example).unwrap();
        let parsed: FewShotExample = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.tables_used, vec!["admission"]);
        assert_eq!(parsed.created_at, example.created_at);
    }

    #[test]
    fn test_schema_field_count() {
        // id, db_name, question, sql, tables_used, explanation, message_id,
        // created_at, vector
        assert_eq!(few_shot_schema().fields().len(), 9);
    }
}
