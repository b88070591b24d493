//! Schema retrieval pipeline.
//!
//! Composes the vector and graph store actors into tables-only schema
//! selection plus join enumeration:
//!
//! 1. kNN table search
//! 2. FK expansion
//! 3. Semantic filter (score threshold, core tables, direct hits, minimum)
//! 4. Bridge protection between the kNN winners
//! 5. Optional LLM pruning (selection intersected with the current set)
//! 6. Column fetch
//! 7. Semantic column search
//! 8. Join-path enumeration
//!
//! Steps 1/2/6/8 are fatal; 3/4/5/7 degrade gracefully and record the
//! failure in `stats`.

use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::actors::graph_store_actor::{ColumnMeta, GraphStoreMsg, JoinEdge, TableMeta};
use crate::actors::llm_gateway_actor::{LlmMsg, ModelPurpose};
use crate::actors::schema_vector_actor::{ColumnHit, SchemaVectorMsg};
use crate::embeddings::EmbeddingService;
use crate::protocol::ChatMessage;
use crate::settings::RetrievalSettings;

/// A pre-scored table hint seeding the pipeline (skips the kNN search).
#[derive(Debug, Clone)]
pub struct InitialTable {
    pub name: String,
    pub score: f32,
    pub chinese_name: Option<String>,
    pub description: Option<String>,
}

/// Immutable outcome of one retrieval run.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct RetrievalResult {
    pub tables: Vec<String>,
    pub table_columns: HashMap<String, Vec<ColumnMeta>>,
    pub table_metadata: HashMap<String, TableMeta>,
    pub semantic_columns: Vec<ColumnHit>,
    pub join_paths: Vec<JoinEdge>,
    pub stats: Value,
}

/// Reasons recorded by the semantic filter.
const REASON_MUST_KEEP: &str = "must_keep";
const REASON_KEPT_BY_SCORE: &str = "kept_by_score";

/// Outcome of the pure semantic filter.
#[derive(Debug, Clone)]
pub struct SemanticFilterOutcome {
    pub kept: Vec<String>,
    pub kept_reasons: Vec<(String, &'static str)>,
    pub removed: Vec<String>,
}

/// Keep a table iff its score clears the threshold OR it is a core table OR
/// it was a direct kNN hit. Backfill the highest-scoring removals until the
/// minimum table count is met.
pub fn semantic_filter(
    tables: &[String],
    scores: &HashMap<String, f32>,
    direct_hits: &HashSet<String>,
    core_tables: &[String],
    threshold: f32,
    min_tables: usize,
) -> SemanticFilterOutcome {
    let core: HashSet<&str> = core_tables.iter().map(|s| s.as_str()).collect();

    let mut kept = Vec::new();
    let mut kept_reasons = Vec::new();
    let mut removed = Vec::new();

    for table in tables {
        let score = scores.get(table).copied();
        if core.contains(table.as_str()) || direct_hits.contains(table) {
            kept.push(table.clone());
            kept_reasons.push((table.clone(), REASON_MUST_KEEP));
        } else if score.map(|s| s >= threshold).unwrap_or(false) {
            kept.push(table.clone());
            kept_reasons.push((table.clone(), REASON_KEPT_BY_SCORE));
        } else {
            removed.push(table.clone());
        }
    }

    if kept.len() < min_tables && !removed.is_empty() {
        let mut backfill: Vec<String> = removed.clone();
        backfill.sort_by(|a, b| {
            let sa = scores.get(a).copied().unwrap_or(f32::MIN);
            let sb = scores.get(b).copied().unwrap_or(f32::MIN);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        for table in backfill {
            if kept.len() >= min_tables {
                break;
            }
            removed.retain(|t| t != &table);
            kept_reasons.push((table.clone(), REASON_KEPT_BY_SCORE));
            kept.push(table);
        }
    }

    SemanticFilterOutcome {
        kept,
        kept_reasons,
        removed,
    }
}

/// Schema retrieval service over the store actors.
pub struct SchemaRetrievalService {
    graph_tx: mpsc::Sender<GraphStoreMsg>,
    vector_tx: mpsc::Sender<SchemaVectorMsg>,
    llm_tx: Option<mpsc::Sender<LlmMsg>>,
    embeddings: Arc<EmbeddingService>,
    config: RetrievalSettings,
}

impl SchemaRetrievalService {
    pub fn new(
        graph_tx: mpsc::Sender<GraphStoreMsg>,
        vector_tx: mpsc::Sender<SchemaVectorMsg>,
        llm_tx: Option<mpsc::Sender<LlmMsg>>,
        embeddings: Arc<EmbeddingService>,
        config: RetrievalSettings,
    ) -> Self {
        Self {
            graph_tx,
            vector_tx,
            llm_tx,
            embeddings,
            config,
        }
    }

    pub async fn retrieve(
        &self,
        question: &str,
        db_name: Option<&str>,
        initial_tables: Option<Vec<InitialTable>>,
    ) -> Result<RetrievalResult, String> {
        let mut stats = serde_json::Map::new();
        let mut scores: HashMap<String, f32> = HashMap::new();

        // Step 1: kNN tables (or the pre-scored hint set).
        let (mut tables, direct_hits) = match initial_tables {
            Some(initial) if !initial.is_empty() => {
                let names: Vec<String> = initial.iter().map(|t| t.name.clone()).collect();
                for t in &initial {
                    scores.insert(t.name.clone(), t.score);
                }
                stats.insert(
                    "initial_tables".to_string(),
                    json!({ "count": names.len() }),
                );
                let hits: HashSet<String> = names.iter().cloned().collect();
                (names, hits)
            }
            _ => {
                if question.trim().is_empty() {
                    return Ok(RetrievalResult {
                        stats: json!({ "milvus_search": { "count": 0 } }),
                        ..Default::default()
                    });
                }

                let embedding = self.embeddings.encode(question).await?;
                let (tx, rx) = oneshot::channel();
                self.vector_tx
                    .send(SchemaVectorMsg::SearchTables {
                        query_embedding: embedding,
                        db_name: db_name.map(|s| s.to_string()),
                        limit: self.config.search_top_k,
                        respond_to: tx,
                    })
                    .await
                    .map_err(|_| "schema vector store unavailable".to_string())?;
                let hits = rx
                    .await
                    .map_err(|_| "schema vector store died".to_string())??;

                let mut score_map = serde_json::Map::new();
                for hit in &hits {
                    scores.insert(hit.table_name.clone(), hit.score);
                    score_map.insert(hit.table_name.clone(), json!(hit.score));
                }
                stats.insert(
                    "milvus_search".to_string(),
                    json!({ "count": hits.len(), "scores": score_map }),
                );

                let names: Vec<String> = hits.iter().map(|h| h.table_name.clone()).collect();
                let direct: HashSet<String> = names.iter().cloned().collect();
                (names, direct)
            }
        };

        if tables.is_empty() {
            println!("[Retrieval] No tables matched '{}'", truncate(question, 60));
            return Ok(RetrievalResult {
                stats: Value::Object(stats),
                ..Default::default()
            });
        }

        // Step 2: FK expansion (fatal).
        if self.config.expand_fk {
            let before = tables.len();
            let (tx, rx) = oneshot::channel();
            self.graph_tx
                .send(GraphStoreMsg::ExpandWithRelated {
                    tables: tables.clone(),
                    max_depth: self.config.expand_max_depth,
                    db_name: db_name.map(|s| s.to_string()),
                    respond_to: tx,
                })
                .await
                .map_err(|_| "graph store unavailable".to_string())?;
            tables = rx.await.map_err(|_| "graph store died".to_string())??;
            stats.insert(
                "fk_expansion".to_string(),
                json!({ "before": before, "after": tables.len() }),
            );
        }

        // Step 3: semantic filter (graceful; pure once the inputs exist).
        if self.config.semantic_filter_enabled {
            let outcome = semantic_filter(
                &tables,
                &scores,
                &direct_hits,
                &self.config.core_tables,
                self.config.semantic_threshold,
                self.config.semantic_min_tables,
            );
            let reasons: serde_json::Map<String, Value> = outcome
                .kept_reasons
                .iter()
                .map(|(t, r)| (t.clone(), json!(r)))
                .collect();
            stats.insert(
                "semantic_filter".to_string(),
                json!({
                    "before": tables.len(),
                    "after": outcome.kept.len(),
                    "removed": outcome.removed,
                    "kept": reasons,
                }),
            );
            tables = outcome.kept;
        }

        // Step 4: bridge protection between the kNN winners (graceful).
        if self.config.bridge_protection_enabled && direct_hits.len() >= 2 {
            let anchors: Vec<String> = tables
                .iter()
                .filter(|t| direct_hits.contains(*t))
                .cloned()
                .collect();
            let (tx, rx) = oneshot::channel();
            let sent = self
                .graph_tx
                .send(GraphStoreMsg::FindBridgeTables {
                    high_score: anchors,
                    max_hops: self.config.bridge_max_hops,
                    db_name: db_name.map(|s| s.to_string()),
                    respond_to: tx,
                })
                .await;

            let bridges = match sent {
                Ok(()) => match rx.await {
                    Ok(Ok(bridges)) => Some(bridges),
                    Ok(Err(e)) => {
                        println!("[Retrieval] Bridge discovery failed: {}", e);
                        None
                    }
                    Err(_) => None,
                },
                Err(_) => None,
            };

            match bridges {
                Some(bridges) => {
                    let added: Vec<String> = bridges
                        .into_iter()
                        .filter(|b| !tables.contains(b))
                        .collect();
                    stats.insert(
                        "bridge_protection".to_string(),
                        json!({ "bridges_added": added.clone() }),
                    );
                    tables.extend(added);
                }
                None => {
                    stats.insert(
                        "bridge_protection".to_string(),
                        json!({ "skipped": "bridge discovery failed" }),
                    );
                }
            }
        }

        // Step 5: LLM pruning (graceful).
        if self.config.llm_filter_enabled && tables.len() > self.config.llm_filter_max_tables {
            match self.llm_prune(question, &tables).await {
                Ok(Some((selection, model))) => {
                    stats.insert(
                        "llm_filter".to_string(),
                        json!({
                            "before": tables.len(),
                            "after": selection.len(),
                            "model": model,
                        }),
                    );
                    tables = selection;
                }
                Ok(None) => {
                    stats.insert("llm_filter".to_string(), json!({ "skipped": "empty selection" }));
                }
                Err(e) => {
                    println!("[Retrieval] LLM pruning failed: {}", e);
                    stats.insert("llm_filter".to_string(), json!({ "skipped": e }));
                }
            }
        }

        // Step 6: column fetch (fatal). Done after join enumeration would
        // be too late for intermediate tables, so join paths come first
        // here and any endpoint they introduce joins the table set.
        let (tx, rx) = oneshot::channel();
        self.graph_tx
            .send(GraphStoreMsg::FindJoinPaths {
                tables: tables.clone(),
                max_hops: self.config.bridge_max_hops,
                db_name: db_name.map(|s| s.to_string()),
                respond_to: tx,
            })
            .await
            .map_err(|_| "graph store unavailable".to_string())?;
        let join_paths = rx.await.map_err(|_| "graph store died".to_string())??;

        // Invariant: every join-path endpoint appears in `tables`.
        for edge in &join_paths {
            for endpoint in [&edge.fk_table, &edge.pk_table] {
                if !tables.contains(endpoint) {
                    tables.push(endpoint.clone());
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.graph_tx
            .send(GraphStoreMsg::GetTableColumns {
                tables: tables.clone(),
                db_name: db_name.map(|s| s.to_string()),
                respond_to: tx,
            })
            .await
            .map_err(|_| "graph store unavailable".to_string())?;
        let table_columns = rx.await.map_err(|_| "graph store died".to_string())??;

        let (tx, rx) = oneshot::channel();
        let table_metadata = match self
            .graph_tx
            .send(GraphStoreMsg::GetTableMetadata {
                tables: tables.clone(),
                db_name: db_name.map(|s| s.to_string()),
                respond_to: tx,
            })
            .await
        {
            Ok(()) => rx.await.ok().and_then(|r| r.ok()).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };

        // Step 7: semantic columns (graceful).
        let semantic_columns = match self.search_semantic_columns(question, db_name, &tables).await
        {
            Ok(hits) => hits,
            Err(e) => {
                println!("[Retrieval] Semantic column search failed: {}", e);
                stats.insert("semantic_columns".to_string(), json!({ "skipped": e }));
                Vec::new()
            }
        };

        println!(
            "[Retrieval] '{}' -> {} tables, {} join paths",
            truncate(question, 60),
            tables.len(),
            join_paths.len()
        );

        Ok(RetrievalResult {
            tables,
            table_columns,
            table_metadata,
            semantic_columns,
            join_paths,
            stats: Value::Object(stats),
        })
    }

    async fn search_semantic_columns(
        &self,
        question: &str,
        db_name: Option<&str>,
        tables: &[String],
    ) -> Result<Vec<ColumnHit>, String> {
        let embedding = self.embeddings.encode(question).await?;
        let (tx, rx) = oneshot::channel();
        self.vector_tx
            .send(SchemaVectorMsg::SearchColumns {
                query_embedding: embedding,
                db_name: db_name.map(|s| s.to_string()),
                table_filter: Some(tables.to_vec()),
                limit: 20,
                respond_to: tx,
            })
            .await
            .map_err(|_| "schema vector store unavailable".to_string())?;
        rx.await.map_err(|_| "schema vector store died".to_string())?
    }

    /// Ask the LLM to pick at most `llm_filter_max_tables` tables. The
    /// selection is intersected with the current set; an empty intersection
    /// leaves the set unchanged.
    async fn llm_prune(
        &self,
        question: &str,
        tables: &[String],
    ) -> Result<Option<(Vec<String>, String)>, String> {
        let llm_tx = self
            .llm_tx
            .as_ref()
            .ok_or_else(|| "no LLM configured".to_string())?;

        let schema = json!({
            "type": "object",
            "title": "TableSelection",
            "properties": {
                "tables": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["tables"]
        });

        let prompt = format!(
            "Select at most {} tables needed to answer the question.\n\n\
             Question: {}\n\nCandidate tables:\n{}\n\n\
             Reply with JSON: {{\"tables\": [\"...\"]}}",
            self.config.llm_filter_max_tables,
            question,
            tables
                .iter()
                .map(|t| format!("- {}", t))
                .collect::<Vec<_>>()
                .join("\n")
        );

        let (tx, rx) = oneshot::channel();
        llm_tx
            .send(LlmMsg::Chat {
                purpose: ModelPurpose::Planning,
                messages: vec![
                    ChatMessage::system(
                        "You narrow a candidate table list for SQL generation. Reply with JSON only.",
                    ),
                    ChatMessage::user(prompt),
                ],
                tools: None,
                response_schema: Some(schema),
                token_tx: None,
                cancel_rx: None,
                respond_to: tx,
            })
            .await
            .map_err(|_| "llm gateway unavailable".to_string())?;
        let response = rx.await.map_err(|_| "llm gateway died".to_string())??;

        let selection: Vec<String> = response
            .structured
            .as_ref()
            .and_then(|v| v.get("tables"))
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        // Conservative: only tables already in the set survive.
        let current: HashSet<&String> = tables.iter().collect();
        let intersected: Vec<String> = selection
            .into_iter()
            .filter(|t| current.contains(t))
            .take(self.config.llm_filter_max_tables)
            .collect();

        if intersected.is_empty() {
            return Ok(None);
        }
        Ok(Some((intersected, "planning".to_string())))
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        text.to_string()
    } else {
        let prefix: String = text.chars().take(max_len).collect();
        format!("{}...", prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores(pairs: &[(&str, f32)]) -> HashMap<String, f32> {
        pairs.iter().map(|(n, s)| (n.to_string(), *s)).collect()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_semantic_filter_threshold_and_direct_hits() {
        let tables = names(&["patient", "visit", "audit_log"]);
        let table_scores = scores(&[("patient", 0.8), ("visit", 0.2)]);
        let direct: HashSet<String> = ["patient".to_string()].into_iter().collect();

        let outcome = semantic_filter(&tables, &table_scores, &direct, &[], 0.4, 0);

        assert_eq!(outcome.kept, names(&["patient"]));
        assert!(outcome.removed.contains(&"visit".to_string()));
        assert!(outcome.removed.contains(&"audit_log".to_string()));
        assert_eq!(outcome.kept_reasons[0].1, "must_keep");
    }

    #[test]
    fn test_semantic_filter_core_tables_always_survive() {
        let tables = names(&["patient", "department"]);
        let table_scores = scores(&[("patient", 0.9)]);
        let direct: HashSet<String> = ["patient".to_string()].into_iter().collect();

        let outcome = semantic_filter(
            &tables,
            &table_scores,
            &direct,
            &["department".to_string()],
            0.4,
            0,
        );

        assert_eq!(outcome.kept, names(&["patient", "department"]));
        assert!(outcome.removed.is_empty());
    }

    #[test]
    fn test_semantic_filter_backfills_to_minimum() {
        let tables = names(&["patient", "visit", "prescription", "fee_record"]);
        let table_scores = scores(&[
            ("patient", 0.9),
            ("visit", 0.35),
            ("prescription", 0.3),
            ("fee_record", 0.1),
        ]);
        let direct: HashSet<String> = ["patient".to_string()].into_iter().collect();

        let outcome = semantic_filter(&tables, &table_scores, &direct, &[], 0.4, 3);

        assert_eq!(outcome.kept.len(), 3);
        // Highest-scoring removals come back first.
        assert!(outcome.kept.contains(&"visit".to_string()));
        assert!(outcome.kept.contains(&"prescription".to_string()));
        assert!(!outcome.kept.contains(&"fee_record".to_string()));
        assert_eq!(outcome.removed, names(&["fee_record"]));
    }

    #[test]
    fn test_semantic_filter_kept_by_score_reason() {
        let tables = names(&["visit"]);
        let table_scores = scores(&[("visit", 0.7)]);
        let direct = HashSet::new();

        let outcome = semantic_filter(&tables, &table_scores, &direct, &[], 0.4, 0);
        assert_eq!(outcome.kept_reasons[0], ("visit".to_string(), "kept_by_score"));
    }
}
