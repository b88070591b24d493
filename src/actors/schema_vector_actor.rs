//! Schema Vector Store Actor - table and column embeddings in LanceDB.
//!
//! This actor handles:
//! - Upserting table and column embedding records
//! - kNN search over tables and columns, filtered by database and table set
//!
//! Scores are `1 / (1 + distance)` in descending order.

use arrow_array::{Array, BooleanArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use futures::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Table};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::lance::{
    ensure_table, escape_filter_value, in_list_filter, optional_string, score_from_distance,
    vector_cell, vector_field,
};

/// A table embedding record (vector supplied separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableEmbeddingRecord {
    pub id: String,
    pub db_name: String,
    pub table_name: String,
    pub chinese_name: Option<String>,
    pub description: Option<String>,
    pub domain: Option<String>,
    pub core_columns_text: String,
}

/// A column embedding record (vector supplied separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnEmbeddingRecord {
    pub id: String,
    pub db_name: String,
    pub table_name: String,
    pub column_name: String,
    pub chinese_name: Option<String>,
    pub data_type: String,
    pub is_pk: bool,
    pub is_fk: bool,
}

/// A table hit from kNN search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableHit {
    pub table_name: String,
    pub db_name: String,
    pub chinese_name: Option<String>,
    pub description: Option<String>,
    pub score: f32,
}

/// A column hit from kNN search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnHit {
    pub table_name: String,
    pub column_name: String,
    pub chinese_name: Option<String>,
    pub data_type: String,
    pub is_pk: bool,
    pub is_fk: bool,
    pub score: f32,
}

/// Messages for the Schema Vector Store Actor.
#[derive(Debug)]
pub enum SchemaVectorMsg {
    UpsertTable {
        record: TableEmbeddingRecord,
        embedding: Vec<f32>,
        respond_to: oneshot::Sender<Result<(), String>>,
    },
    UpsertColumn {
        record: ColumnEmbeddingRecord,
        embedding: Vec<f32>,
        respond_to: oneshot::Sender<Result<(), String>>,
    },
    SearchTables {
        query_embedding: Vec<f32>,
        db_name: Option<String>,
        limit: usize,
        respond_to: oneshot::Sender<Result<Vec<TableHit>, String>>,
    },
    SearchColumns {
        query_embedding: Vec<f32>,
        db_name: Option<String>,
        table_filter: Option<Vec<String>>,
        limit: usize,
        respond_to: oneshot::Sender<Result<Vec<ColumnHit>, String>>,
    },
}

fn tables_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("db_name", DataType::Utf8, false),
        Field::new("table_name", DataType::Utf8, false),
        Field::new("chinese_name", DataType::Utf8, true),
        Field::new("description", DataType::Utf8, true),
        Field::new("domain", DataType::Utf8, true),
        Field::new("core_columns_text", DataType::Utf8, false),
        vector_field(),
    ]))
}

fn columns_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("db_name", DataType::Utf8, false),
        Field::new("table_name", DataType::Utf8, false),
        Field::new("column_name", DataType::Utf8, false),
        Field::new("chinese_name", DataType::Utf8, true),
        Field::new("data_type", DataType::Utf8, false),
        Field::new("is_pk", DataType::Boolean, false),
        Field::new("is_fk", DataType::Boolean, false),
        vector_field(),
    ]))
}

/// Schema Vector Store Actor.
pub struct SchemaVectorActor {
    rx: mpsc::Receiver<SchemaVectorMsg>,
    tables: Table,
    columns: Table,
}

impl SchemaVectorActor {
    pub async fn new(rx: mpsc::Receiver<SchemaVectorMsg>, db_path: &str) -> Result<Self, String> {
        let db_connection = connect(db_path)
            .execute()
            .await
            .map_err(|e| format!("vector store unavailable: {}", e))?;

        let tables = ensure_table(&db_connection, "table_embeddings", tables_schema()).await?;
        let columns = ensure_table(&db_connection, "column_embeddings", columns_schema()).await?;

        Ok(Self {
            rx,
            tables,
            columns,
        })
    }

    /// Run the actor's message loop.
    pub async fn run(mut self) {
        println!("[SchemaVectorActor] Started");

        while let Some(msg) = self.rx.recv().await {
            let tables = self.tables.clone();
            let columns = self.columns.clone();

            tokio::spawn(async move {
                match msg {
                    SchemaVectorMsg::UpsertTable {
                        record,
                        embedding,
                        respond_to,
                    } => {
                        let _ = respond_to.send(upsert_table(&tables, &record, &embedding).await);
                    }
                    SchemaVectorMsg::UpsertColumn {
                        record,
                        embedding,
                        respond_to,
                    } => {
                        let _ = respond_to.send(upsert_column(&columns, &record, &embedding).await);
                    }
                    SchemaVectorMsg::SearchTables {
                        query_embedding,
                        db_name,
                        limit,
                        respond_to,
                    } => {
                        let _ = respond_to.send(
                            search_tables(&tables, query_embedding, db_name.as_deref(), limit)
                                .await,
                        );
                    }
                    SchemaVectorMsg::SearchColumns {
                        query_embedding,
                        db_name,
                        table_filter,
                        limit,
                        respond_to,
                    } => {
                        let _ = respond_to.send(
                            search_columns(
                                &columns,
                                query_embedding,
                                db_name.as_deref(),
                                table_filter.as_deref(),
                                limit,
                            )
                            .await,
                        );
                    }
                }
            });
        }

        println!("[SchemaVectorActor] Stopped");
    }
}

async fn upsert_table(
    table: &Table,
    record: &TableEmbeddingRecord,
    embedding: &[f32],
) -> Result<(), String> {
    let batch = RecordBatch::try_new(
        tables_schema(),
        vec![
            Arc::new(StringArray::from(vec![record.id.clone()])),
            Arc::new(StringArray::from(vec![record.db_name.clone()])),
            Arc::new(StringArray::from(vec![record.table_name.clone()])),
            Arc::new(StringArray::from(vec![record
                .chinese_name
                .clone()
                .unwrap_or_default()])),
            Arc::new(StringArray::from(vec![record
                .description
                .clone()
                .unwrap_or_default()])),
            Arc::new(StringArray::from(vec![record
                .domain
                .clone()
                .unwrap_or_default()])),
            Arc::new(StringArray::from(vec![record.core_columns_text.clone()])),
            Arc::new(vector_cell(embedding)),
        ],
    )
    .map_err(|e| format!("Failed to create batch: {}", e))?;

    let filter = format!("id = '{}'", escape_filter_value(&record.id));
    let _ = table.delete(&filter).await;

    table
        .add(Box::new(RecordBatchIterator::new(
            vec![Ok(batch)],
            tables_schema(),
        )))
        .execute()
        .await
        .map_err(|e| format!("Failed to add table embedding: {}", e))?;

    Ok(())
}

async fn upsert_column(
    table: &Table,
    record: &ColumnEmbeddingRecord,
    embedding: &[f32],
) -> Result<(), String> {
    let batch = RecordBatch::try_new(
        columns_schema(),
        vec![
            Arc::new(StringArray::from(vec![record.id.clone()])),
            Arc::new(StringArray::from(vec![record.db_name.clone()])),
            Arc::new(StringArray::from(vec![record.table_name.clone()])),
            Arc::new(StringArray::from(vec![record.column_name.clone()])),
            Arc::new(StringArray::from(vec![record
                .chinese_name
                .clone()
                .unwrap_or_default()])),
            Arc::new(StringArray::from(vec![record.data_type.clone()])),
            Arc::new(BooleanArray::from(vec![record.is_pk])),
            Arc::new(BooleanArray::from(vec![record.is_fk])),
            Arc::new(vector_cell(embedding)),
        ],
    )
    .map_err(|e| format!("Failed to create column batch: {}", e))?;

    let filter = format!("id = '{}'", escape_filter_value(&record.id));
    let _ = table.delete(&filter).await;

    table
        .add(Box::new(RecordBatchIterator::new(
            vec![Ok(batch)],
            columns_schema(),
        )))
        .execute()
        .await
        .map_err(|e| format!("Failed to add column embedding: {}", e))?;

    Ok(())
}

async fn search_tables(
    table: &Table,
    query_embedding: Vec<f32>,
    db_name: Option<&str>,
    limit: usize,
) -> Result<Vec<TableHit>, String> {
    let mut query = table
        .query()
        .nearest_to(query_embedding)
        .map_err(|e| format!("Failed to create vector query: {}", e))?;

    if let Some(db) = db_name {
        query = query.only_if(format!("db_name = '{}'", escape_filter_value(db)));
    }

    let mut stream = query
        .limit(limit)
        .execute()
        .await
        .map_err(|e| format!("Failed to execute vector query: {}", e))?;

    let mut hits = Vec::new();

    while let Some(batch_result) = stream.next().await {
        let batch = match batch_result {
            Ok(b) => b,
            Err(_) => continue,
        };

        let names = batch
            .column_by_name("table_name")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let dbs = batch
            .column_by_name("db_name")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let chinese = batch
            .column_by_name("chinese_name")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let descriptions = batch
            .column_by_name("description")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        if let (Some(names), Some(dbs)) = (names, dbs) {
            for i in 0..batch.num_rows() {
                let distance = distances.map(|d| d.value(i)).unwrap_or(0.0);
                hits.push(TableHit {
                    table_name: names.value(i).to_string(),
                    db_name: dbs.value(i).to_string(),
                    chinese_name: optional_string(chinese, i),
                    description: optional_string(descriptions, i),
                    score: score_from_distance(distance),
                });
            }
        }
    }

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(hits)
}

async fn search_columns(
    table: &Table,
    query_embedding: Vec<f32>,
    db_name: Option<&str>,
    table_filter: Option<&[String]>,
    limit: usize,
) -> Result<Vec<ColumnHit>, String> {
    let mut query = table
        .query()
        .nearest_to(query_embedding)
        .map_err(|e| format!("Failed to create column vector query: {}", e))?;

    let mut clauses = Vec::new();
    if let Some(db) = db_name {
        clauses.push(format!("db_name = '{}'", escape_filter_value(db)));
    }
    if let Some(tables) = table_filter {
        if !tables.is_empty() {
            clauses.push(in_list_filter("table_name", tables));
        }
    }
    if !clauses.is_empty() {
        query = query.only_if(clauses.join(" AND "));
    }

    let mut stream = query
        .limit(limit)
        .execute()
        .await
        .map_err(|e| format!("Failed to execute column vector query: {}", e))?;

    let mut hits = Vec::new();

    while let Some(batch_result) = stream.next().await {
        let batch = match batch_result {
            Ok(b) => b,
            Err(_) => continue,
        };

        let tables = batch
            .column_by_name("table_name")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let names = batch
            .column_by_name("column_name")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let chinese = batch
            .column_by_name("chinese_name")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let types = batch
            .column_by_name("data_type")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let pks = batch
            .column_by_name("is_pk")
            .and_then(|c| c.as_any().downcast_ref::<BooleanArray>());
        let fks = batch
            .column_by_name("is_fk")
            .and_then(|c| c.as_any().downcast_ref::<BooleanArray>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        if let (Some(tables), Some(names), Some(types)) = (tables, names, types) {
            for i in 0..batch.num_rows() {
                let distance = distances.map(|d| d.value(i)).unwrap_or(0.0);
                hits.push(ColumnHit {
                    table_name: tables.value(i).to_string(),
                    column_name: names.value(i).to_string(),
                    chinese_name: optional_string(chinese, i),
                    data_type: types.value(i).to_string(),
                    is_pk: pks.map(|p| p.value(i)).unwrap_or(false),
                    is_fk: fks.map(|f| f.value(i)).unwrap_or(false),
                    score: score_from_distance(distance),
                });
            }
        }
    }

    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    Ok(hits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_hit_serde() {
        let hit = TableHit {
            table_name: "patient".to_string(),
            db_name: "medical".to_string(),
            chinese_name: Some("患者".to_string()),
            description: Some("Patient master records".to_string()),
            score: 0.82,
        };

        let json = serde_json::to_string(&hit).unwrap();
        let parsed: TableHit = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.table_name, "patient");
        assert_eq!(parsed.chinese_name.as_deref(), Some("患者"));
    }

    #[test]
    fn test_column_hit_serde() {
        let hit = ColumnHit {
            table_name: "visit".to_string(),
            column_name: "visit_date".to_string(),
            chinese_name: None,
            data_type: "date".to_string(),
            is_pk: false,
            is_fk: false,
            score: 0.74,
        };

        let json = serde_json::to_string(&hit).unwrap();
        assert!(json.contains("visit_date"));
    }

    #[test]
    fn test_schemas_carry_vector_field() {
        assert!(tables_schema().field_with_name("vector").is_ok());
        assert!(columns_schema().field_with_name("vector").is_ok());
    }
}
