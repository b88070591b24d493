//! Shared LanceDB plumbing for the vector store actors.

use arrow_array::types::Float32Type;
use arrow_array::{FixedSizeListArray, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use lancedb::{Connection, Table};
use std::sync::Arc;

use crate::embeddings::EMBEDDING_DIM;

/// Arrow field for a fixed-size embedding vector.
pub fn vector_field() -> Field {
    Field::new(
        "vector",
        DataType::FixedSizeList(
            Arc::new(Field::new("item", DataType::Float32, true)),
            EMBEDDING_DIM,
        ),
        true,
    )
}

/// Wrap one embedding into a single-row FixedSizeList column.
pub fn vector_cell(embedding: &[f32]) -> FixedSizeListArray {
    let values = Float32Array::from(embedding.to_vec());
    FixedSizeListArray::from_iter_primitive::<Float32Type, _, _>(
        vec![Some(
            values.values().iter().map(|v| Some(*v)).collect::<Vec<_>>(),
        )],
        EMBEDDING_DIM,
    )
}

/// LanceDB reports squared distance; collapse it onto (0, 1].
pub fn score_from_distance(distance: f32) -> f32 {
    1.0 / (1.0 + distance)
}

/// Escape a value for use inside a LanceDB filter expression.
pub fn escape_filter_value(value: &str) -> String {
    value.replace('\'', "''")
}

/// Build an `IN (...)` filter clause over string values.
pub fn in_list_filter(column: &str, values: &[String]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("'{}'", escape_filter_value(v)))
        .collect();
    format!("{} IN ({})", column, quoted.join(", "))
}

/// Open a table, recreating it when the stored schema no longer matches.
pub async fn ensure_table(
    db_connection: &Connection,
    table_name: &str,
    expected_schema: Arc<Schema>,
) -> Result<Table, String> {
    match db_connection.open_table(table_name).execute().await {
        Ok(table) => match table.schema().await {
            Ok(existing) => {
                let existing_dim = existing
                    .field_with_name("vector")
                    .ok()
                    .and_then(|f| match f.data_type() {
                        DataType::FixedSizeList(_, dim) => Some(*dim),
                        _ => None,
                    });

                if existing.fields().len() != expected_schema.fields().len()
                    || existing_dim != Some(EMBEDDING_DIM)
                {
                    println!(
                        "[LanceStore] Table '{}' schema mismatch, recreating",
                        table_name
                    );
                    let _ = db_connection.drop_table(table_name, &[]).await;
                    create_empty_table(db_connection, table_name, expected_schema).await
                } else {
                    Ok(table)
                }
            }
            Err(_) => Ok(table),
        },
        Err(_) => create_empty_table(db_connection, table_name, expected_schema).await,
    }
}

async fn create_empty_table(
    db_connection: &Connection,
    name: &str,
    schema: Arc<Schema>,
) -> Result<Table, String> {
    println!("[LanceStore] Creating table '{}'", name);
    let batch = RecordBatch::new_empty(schema.clone());
    db_connection
        .create_table(
            name,
            RecordBatchIterator::new(vec![batch].into_iter().map(Ok), schema),
        )
        .execute()
        .await
        .map_err(|e| format!("Failed to create {} table: {}", name, e))
}

/// Read a string column cell, treating empty strings as absent.
pub fn optional_string(array: Option<&StringArray>, row: usize) -> Option<String> {
    array
        .map(|a| a.value(row).to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;

    #[test]
    fn test_score_from_distance_monotonic() {
        assert!(score_from_distance(0.0) > score_from_distance(0.5));
        assert!(score_from_distance(0.5) > score_from_distance(2.0));
        assert!((score_from_distance(0.0) - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_in_list_filter_escapes_quotes() {
        let filter = in_list_filter("table_name", &["patient".to_string(), "o'hare".to_string()]);
        assert_eq!(filter, "table_name IN ('patient', 'o''hare')");
    }

    #[test]
    fn test_vector_cell_dim() {
        let cell = vector_cell(&vec![0.0; EMBEDDING_DIM as usize]);
        assert_eq!(cell.len(), 1);
        assert_eq!(cell.value_length(), EMBEDDING_DIM);
    }
}
