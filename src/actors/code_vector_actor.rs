//! Code Context Store Actor - code-chunk embeddings in LanceDB.
//!
//! This actor handles:
//! - kNN search over code chunks with a score threshold and table hints
//! - Incremental sync: a per-project `{relative path -> content hash}` cache
//!   decides which files changed; changed files are deleted by file_path and
//!   re-upserted

use arrow_array::{Array, Float32Array, RecordBatch, RecordBatchIterator, StringArray};
use arrow_schema::{DataType, Field, Schema};
use futures::StreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Table};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::lance::{ensure_table, escape_filter_value, score_from_distance, vector_cell, vector_field};

/// Maximum stored chunk content length (canonical collection schema).
const MAX_CHUNK_CONTENT: usize = 16_000;

/// A code chunk ready for storage (vector supplied separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChunk {
    pub id: String,
    pub file_path: String,
    pub file_hash: String,
    pub language: String,
    pub content: String,
}

/// A code chunk hit from search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChunkHit {
    pub file_path: String,
    pub language: String,
    pub content: String,
    pub score: f32,
}

/// Messages for the Code Context Store Actor.
#[derive(Debug)]
pub enum CodeVectorMsg {
    SearchChunks {
        query_embedding: Vec<f32>,
        top_k: usize,
        score_threshold: f32,
        respond_to: oneshot::Sender<Result<Vec<CodeChunkHit>, String>>,
    },
    /// Replace all chunks of the named files, then record their hashes.
    SyncFiles {
        project_id: String,
        chunks: Vec<(CodeChunk, Vec<f32>)>,
        respond_to: oneshot::Sender<Result<usize, String>>,
    },
    /// Which of the given (path, hash) pairs changed since the last sync?
    ChangedFiles {
        project_id: String,
        files: Vec<(String, String)>,
        respond_to: oneshot::Sender<Result<Vec<String>, String>>,
    },
}

/// Hash file bytes for change detection.
pub fn hash_file_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn code_chunk_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::Utf8, false),
        Field::new("file_path", DataType::Utf8, false),
        Field::new("file_hash", DataType::Utf8, false),
        Field::new("language", DataType::Utf8, false),
        Field::new("content", DataType::Utf8, false),
        vector_field(),
    ]))
}

/// Code Context Store Actor.
pub struct CodeVectorActor {
    rx: mpsc::Receiver<CodeVectorMsg>,
    table: Table,
    /// project_id -> {relative path -> content hash}
    sync_cache: HashMap<String, HashMap<String, String>>,
    cache_path: PathBuf,
}

impl CodeVectorActor {
    pub async fn new(rx: mpsc::Receiver<CodeVectorMsg>, db_path: &str) -> Result<Self, String> {
        let db_connection = connect(db_path)
            .execute()
            .await
            .map_err(|e| format!("vector store unavailable: {}", e))?;

        let table = ensure_table(&db_connection, "code_chunks", code_chunk_schema()).await?;

        let cache_path = PathBuf::from(db_path).join("code_sync_cache.json");
        let sync_cache = Self::load_cache(&cache_path);

        Ok(Self {
            rx,
            table,
            sync_cache,
            cache_path,
        })
    }

    fn load_cache(path: &PathBuf) -> HashMap<String, HashMap<String, String>> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(_) => HashMap::new(),
        }
    }

    fn save_cache(&self) {
        if let Ok(serialized) = serde_json::to_string(&self.sync_cache) {
            let _ = std::fs::write(&self.cache_path, serialized);
        }
    }

    /// Run the actor's message loop.
    pub async fn run(mut self) {
        println!("[CodeVectorActor] Started");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                CodeVectorMsg::SearchChunks {
                    query_embedding,
                    top_k,
                    score_threshold,
                    respond_to,
                } => {
                    let result =
                        search_chunks(&self.table, query_embedding, top_k, score_threshold).await;
                    let _ = respond_to.send(result);
                }
                CodeVectorMsg::SyncFiles {
                    project_id,
                    chunks,
                    respond_to,
                } => {
                    let result = self.sync_files(&project_id, chunks).await;
                    let _ = respond_to.send(result);
                }
                CodeVectorMsg::ChangedFiles {
                    project_id,
                    files,
                    respond_to,
                } => {
                    let known = self.sync_cache.get(&project_id);
                    let changed: Vec<String> = files
                        .into_iter()
                        .filter(|(path, hash)| {
                            known.and_then(|m| m.get(path)).map(|h| h != hash).unwrap_or(true)
                        })
                        .map(|(path, _)| path)
                        .collect();
                    let _ = respond_to.send(Ok(changed));
                }
            }
        }

        println!("[CodeVectorActor] Stopped");
    }

    async fn sync_files(
        &mut self,
        project_id: &str,
        chunks: Vec<(CodeChunk, Vec<f32>)>,
    ) -> Result<usize, String> {
        if chunks.is_empty() {
            return Ok(0);
        }

        // Delete every existing chunk of the incoming files first.
        let mut file_paths: Vec<String> =
            chunks.iter().map(|(c, _)| c.file_path.clone()).collect();
        file_paths.sort();
        file_paths.dedup();

        let quoted: Vec<String> = file_paths
            .iter()
            .map(|p| format!("'{}'", escape_filter_value(p)))
            .collect();
        let filter = format!("file_path IN ({})", quoted.join(", "));
        let _ = self.table.delete(&filter).await;

        let mut written = 0;
        for (chunk, embedding) in &chunks {
            let mut content = chunk.content.clone();
            content.truncate(MAX_CHUNK_CONTENT);

            let batch = RecordBatch::try_new(
                code_chunk_schema(),
                vec![
                    Arc::new(StringArray::from(vec![chunk.id.clone()])),
                    Arc::new(StringArray::from(vec![chunk.file_path.clone()])),
                    Arc::new(StringArray::from(vec![chunk.file_hash.clone()])),
                    Arc::new(StringArray::from(vec![chunk.language.clone()])),
                    Arc::new(StringArray::from(vec![content])),
                    Arc::new(vector_cell(embedding)),
                ],
            )
            .map_err(|e| format!("Failed to create code chunk batch: {}", e))?;

            self.table
                .add(Box::new(RecordBatchIterator::new(
                    vec![Ok(batch)],
                    code_chunk_schema(),
                )))
                .execute()
                .await
                .map_err(|e| format!("Failed to add code chunk: {}", e))?;
            written += 1;
        }

        // Record the new hashes.
        let project_cache = self.sync_cache.entry(project_id.to_string()).or_default();
        for (chunk, _) in &chunks {
            project_cache.insert(chunk.file_path.clone(), chunk.file_hash.clone());
        }
        self.save_cache();

        println!(
            "[CodeVectorActor] Synced {} chunks across {} files for project {}",
            written,
            file_paths.len(),
            project_id
        );
        Ok(written)
    }
}

async fn search_chunks(
    table: &Table,
    query_embedding: Vec<f32>,
    top_k: usize,
    score_threshold: f32,
) -> Result<Vec<CodeChunkHit>, String> {
    let mut stream = table
        .query()
        .nearest_to(query_embedding)
        .map_err(|e| format!("Failed to create code query: {}", e))?
        .limit(top_k)
        .execute()
        .await
        .map_err(|e| format!("Failed to execute code query: {}", e))?;

    let mut hits = Vec::new();
    while let Some(batch_result) = stream.next().await {
        let batch = match batch_result {
            Ok(b) => b,
            Err(_) => continue,
        };

        let paths = batch
            .column_by_name("file_path")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let languages = batch
            .column_by_name("language")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let contents = batch
            .column_by_name("content")
            .and_then(|c| c.as_any().downcast_ref::<StringArray>());
        let distances = batch
            .column_by_name("_distance")
            .and_then(|c| c.as_any().downcast_ref::<Float32Array>());

        if let (Some(paths), Some(contents)) = (paths, contents) {
            for i in 0..batch.num_rows() {
                let score =
                    score_from_distance(distances.map(|d| d.value(i)).unwrap_or(0.0));
                if score < score_threshold {
                    continue;
                }
                hits.push(CodeChunkHit {
                    file_path: paths.value(i).to_string(),
                    language: languages.map(|l| l.value(i).to_string()).unwrap_or_default(),
                    content: contents.value(i).to_string(),
                    score,
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
    fn test_hash_file_bytes_is_stable_hex() {
        let a = hash_file_bytes(b"SELECT 1");
        let b = hash_file_bytes(b"SELECT 1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_hash_changes_with_content() {
        assert_ne!(hash_file_bytes(b"a"), hash_file_bytes(b"b"));
    }

    #[test]
    fn test_code_chunk_serde() {
        let chunk = CodeChunk {
            id: "svc/billing.py#0".to_string(),
            file_path: "svc/billing.py".to_string(),
            file_hash: hash_file_bytes(b"def bill(): pass"),
            language: "python".to_string(),
            content: "def bill(): pass".to_string(),
        };

        let json = serde_json::to_string(&chunk).unwrap();
        let parsed: CodeChunk = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.file_path, "svc/billing.py");
    }
}
