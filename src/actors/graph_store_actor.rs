//! Schema Graph Store Actor - read side of the schema metadata graph.
//!
//! This actor handles:
//! - Column lookups for a set of tables (ordered by ordinal position)
//! - FK-neighborhood expansion up to a hop budget
//! - Bridge-table discovery between high-score tables
//! - Join-edge enumeration for the final table set
//!
//! Metadata lives in a rusqlite database (`meta_tables` / `meta_columns` /
//! `meta_foreign_keys`). Graph traversals run in-process over an adjacency
//! map with sorted neighbor visitation so results are deterministic.

use rusqlite::Connection;

use crate::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use tokio::sync::{mpsc, oneshot};

/// Column attributes as stored in the metadata graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnMeta {
    pub name: String,
    pub chinese_name: Option<String>,
    pub data_type: String,
    pub base_type: Option<String>,
    pub is_pk: bool,
    pub is_fk: bool,
    pub is_nullable: bool,
    pub is_indexed: bool,
    pub is_unique: bool,
    pub description: Option<String>,
    pub ordinal_position: i64,
}

/// Table-level metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMeta {
    pub name: String,
    pub db_name: String,
    pub chinese_name: Option<String>,
    pub description: Option<String>,
    pub domain: Option<String>,
}

/// One FK edge on a join path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinEdge {
    pub fk_table: String,
    pub fk_column: String,
    pub pk_table: String,
    pub pk_column: String,
}

/// Seed payload for one table (used by `seed-demo` and tests; ingestion
/// proper is an external writer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSeed {
    pub meta: TableMeta,
    pub columns: Vec<ColumnMeta>,
    /// (from_column, to_table, to_column)
    pub foreign_keys: Vec<(String, String, String)>,
}

/// Messages for the Schema Graph Store Actor.
#[derive(Debug)]
pub enum GraphStoreMsg {
    GetTableColumns {
        tables: Vec<String>,
        db_name: Option<String>,
        respond_to: oneshot::Sender<Result<HashMap<String, Vec<ColumnMeta>>, String>>,
    },
    GetTableMetadata {
        tables: Vec<String>,
        db_name: Option<String>,
        respond_to: oneshot::Sender<Result<HashMap<String, TableMeta>, String>>,
    },
    ExpandWithRelated {
        tables: Vec<String>,
        max_depth: usize,
        db_name: Option<String>,
        respond_to: oneshot::Sender<Result<Vec<String>, String>>,
    },
    FindBridgeTables {
        high_score: Vec<String>,
        max_hops: usize,
        db_name: Option<String>,
        respond_to: oneshot::Sender<Result<Vec<String>, String>>,
    },
    FindJoinPaths {
        tables: Vec<String>,
        max_hops: usize,
        db_name: Option<String>,
        respond_to: oneshot::Sender<Result<Vec<JoinEdge>, String>>,
    },
    GetTableCount {
        respond_to: oneshot::Sender<Result<usize, String>>,
    },
    SeedSchema {
        tables: Vec<TableSeed>,
        respond_to: oneshot::Sender<Result<(), String>>,
    },
}

/// One undirected adjacency entry, remembering the stored FK direction.
#[derive(Debug, Clone)]
struct FkEdge {
    from_table: String,
    from_column: String,
    to_table: String,
    to_column: String,
}

/// Schema Graph Store Actor.
pub struct GraphStoreActor {
    rx: mpsc::Receiver<GraphStoreMsg>,
    conn: Connection,
}

impl GraphStoreActor {
    /// Open (or create) the metadata database at `path`. `:memory:` is
    /// accepted for tests.
    pub fn new(rx: mpsc::Receiver<GraphStoreMsg>, path: &str) -> Result<Self, String> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            Connection::open(path)
        }
        .map_err(|e| EngineError::store("graph store", e.to_string()).to_string())?;

        Self::init_schema(&conn)?;
        Ok(Self { rx, conn })
    }

    fn init_schema(conn: &Connection) -> Result<(), String> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS meta_tables (
                db_name TEXT NOT NULL,
                name TEXT NOT NULL,
                chinese_name TEXT,
                description TEXT,
                domain TEXT,
                PRIMARY KEY (db_name, name)
            );
            CREATE TABLE IF NOT EXISTS meta_columns (
                db_name TEXT NOT NULL,
                table_name TEXT NOT NULL,
                name TEXT NOT NULL,
                chinese_name TEXT,
                data_type TEXT NOT NULL,
                base_type TEXT,
                is_pk INTEGER NOT NULL DEFAULT 0,
                is_fk INTEGER NOT NULL DEFAULT 0,
                is_nullable INTEGER NOT NULL DEFAULT 1,
                is_indexed INTEGER NOT NULL DEFAULT 0,
                is_unique INTEGER NOT NULL DEFAULT 0,
                description TEXT,
                ordinal_position INTEGER NOT NULL,
                PRIMARY KEY (db_name, table_name, name)
            );
            CREATE TABLE IF NOT EXISTS meta_foreign_keys (
                db_name TEXT NOT NULL,
                from_table TEXT NOT NULL,
                from_column TEXT NOT NULL,
                to_table TEXT NOT NULL,
                to_column TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_meta_columns_table
                ON meta_columns (db_name, table_name);
            CREATE INDEX IF NOT EXISTS idx_meta_fks_db
                ON meta_foreign_keys (db_name);
            "#,
        )
        .map_err(|e| format!("graph store unavailable: {}", e))
    }

    /// Run the actor's message loop.
    pub async fn run(mut self) {
        println!("[GraphStoreActor] Started");

        while let Some(msg) = self.rx.recv().await {
            match msg {
                GraphStoreMsg::GetTableColumns {
                    tables,
                    db_name,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.get_table_columns(&tables, db_name.as_deref()));
                }
                GraphStoreMsg::GetTableMetadata {
                    tables,
                    db_name,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.get_table_metadata(&tables, db_name.as_deref()));
                }
                GraphStoreMsg::ExpandWithRelated {
                    tables,
                    max_depth,
                    db_name,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.expand_with_related(
                        &tables,
                        max_depth,
                        db_name.as_deref(),
                    ));
                }
                GraphStoreMsg::FindBridgeTables {
                    high_score,
                    max_hops,
                    db_name,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.find_bridge_tables(
                        &high_score,
                        max_hops,
                        db_name.as_deref(),
                    ));
                }
                GraphStoreMsg::FindJoinPaths {
                    tables,
                    max_hops,
                    db_name,
                    respond_to,
                } => {
                    let _ = respond_to.send(self.find_join_paths(
                        &tables,
                        max_hops,
                        db_name.as_deref(),
                    ));
                }
                GraphStoreMsg::GetTableCount { respond_to } => {
                    let _ = respond_to.send(self.get_table_count());
                }
                GraphStoreMsg::SeedSchema { tables, respond_to } => {
                    let _ = respond_to.send(self.seed_schema(&tables));
                }
            }
        }

        println!("[GraphStoreActor] Stopped");
    }

    fn get_table_columns(
        &self,
        tables: &[String],
        db_name: Option<&str>,
    ) -> Result<HashMap<String, Vec<ColumnMeta>>, String> {
        if tables.is_empty() {
            return Ok(HashMap::new());
        }

        let mut out: HashMap<String, Vec<ColumnMeta>> = HashMap::new();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name, chinese_name, data_type, base_type, is_pk, is_fk, is_nullable,
                        is_indexed, is_unique, description, ordinal_position
                 FROM meta_columns
                 WHERE table_name = ?1 AND (?2 IS NULL OR db_name = ?2)
                 ORDER BY ordinal_position",
            )
            .map_err(|e| format!("graph store unavailable: {}", e))?;

        for table in tables {
            let rows = stmt
                .query_map(rusqlite::params![table, db_name], |row| {
                    Ok(ColumnMeta {
                        name: row.get(0)?,
                        chinese_name: row.get(1)?,
                        data_type: row.get(2)?,
                        base_type: row.get(3)?,
                        is_pk: row.get::<_, i64>(4)? != 0,
                        is_fk: row.get::<_, i64>(5)? != 0,
                        is_nullable: row.get::<_, i64>(6)? != 0,
                        is_indexed: row.get::<_, i64>(7)? != 0,
                        is_unique: row.get::<_, i64>(8)? != 0,
                        description: row.get(9)?,
                        ordinal_position: row.get(10)?,
                    })
                })
                .map_err(|e| format!("graph store query failed: {}", e))?;

            let columns: Vec<ColumnMeta> = rows
                .collect::<Result<_, _>>()
                .map_err(|e| format!("graph store query failed: {}", e))?;
            if !columns.is_empty() {
                out.insert(table.clone(), columns);
            }
        }

        Ok(out)
    }

    fn get_table_metadata(
        &self,
        tables: &[String],
        db_name: Option<&str>,
    ) -> Result<HashMap<String, TableMeta>, String> {
        if tables.is_empty() {
            return Ok(HashMap::new());
        }

        let mut out = HashMap::new();
        let mut stmt = self
            .conn
            .prepare(
                "SELECT db_name, name, chinese_name, description, domain
                 FROM meta_tables
                 WHERE name = ?1 AND (?2 IS NULL OR db_name = ?2)",
            )
            .map_err(|e| format!("graph store unavailable: {}", e))?;

        for table in tables {
            let meta = stmt
                .query_row(rusqlite::params![table, db_name], |row| {
                    Ok(TableMeta {
                        db_name: row.get(0)?,
                        name: row.get(1)?,
                        chinese_name: row.get(2)?,
                        description: row.get(3)?,
                        domain: row.get(4)?,
                    })
                })
                .ok();
            if let Some(meta) = meta {
                out.insert(table.clone(), meta);
            }
        }

        Ok(out)
    }

    /// Load the undirected FK adjacency for one database, neighbors sorted.
    fn load_adjacency(
        &self,
        db_name: Option<&str>,
    ) -> Result<HashMap<String, Vec<(String, FkEdge)>>, String> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT from_table, from_column, to_table, to_column
                 FROM meta_foreign_keys
                 WHERE (?1 IS NULL OR db_name = ?1)",
            )
            .map_err(|e| format!("graph store unavailable: {}", e))?;

        let edges: Vec<FkEdge> = stmt
            .query_map(rusqlite::params![db_name], |row| {
                Ok(FkEdge {
                    from_table: row.get(0)?,
                    from_column: row.get(1)?,
                    to_table: row.get(2)?,
                    to_column: row.get(3)?,
                })
            })
            .map_err(|e| format!("graph store query failed: {}", e))?
            .collect::<Result<_, _>>()
            .map_err(|e| format!("graph store query failed: {}", e))?;

        let mut adjacency: HashMap<String, Vec<(String, FkEdge)>> = HashMap::new();
        for edge in edges {
            adjacency
                .entry(edge.from_table.clone())
                .or_default()
                .push((edge.to_table.clone(), edge.clone()));
            adjacency
                .entry(edge.to_table.clone())
                .or_default()
                .push((edge.from_table.clone(), edge.clone()));
        }

        for neighbors in adjacency.values_mut() {
            neighbors.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.from_column.cmp(&b.1.from_column)));
        }

        Ok(adjacency)
    }

    fn expand_with_related(
        &self,
        tables: &[String],
        max_depth: usize,
        db_name: Option<&str>,
    ) -> Result<Vec<String>, String> {
        if tables.is_empty() {
            return Ok(Vec::new());
        }

        let adjacency = self.load_adjacency(db_name)?;

        let mut expanded: Vec<String> = tables.to_vec();
        let mut seen: HashSet<String> = tables.iter().cloned().collect();
        let mut frontier: Vec<String> = tables.to_vec();

        for _ in 0..max_depth {
            let mut next_frontier = Vec::new();
            for table in &frontier {
                if let Some(neighbors) = adjacency.get(table) {
                    for (neighbor, _) in neighbors {
                        if seen.insert(neighbor.clone()) {
                            expanded.push(neighbor.clone());
                            next_frontier.push(neighbor.clone());
                        }
                    }
                }
            }
            if next_frontier.is_empty() {
                break;
            }
            frontier = next_frontier;
        }

        Ok(expanded)
    }

    /// Shortest undirected FK path between two tables, at most `max_hops`
    /// edges. Returns the node sequence including both endpoints.
    fn shortest_path(
        adjacency: &HashMap<String, Vec<(String, FkEdge)>>,
        start: &str,
        goal: &str,
        max_hops: usize,
    ) -> Option<Vec<String>> {
        if start == goal {
            return Some(vec![start.to_string()]);
        }

        let mut prev: HashMap<String, String> = HashMap::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        visited.insert(start.to_string());
        queue.push_back((start.to_string(), 0));

        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_hops {
                continue;
            }
            if let Some(neighbors) = adjacency.get(&node) {
                for (neighbor, _) in neighbors {
                    if visited.insert(neighbor.clone()) {
                        prev.insert(neighbor.clone(), node.clone());
                        if neighbor == goal {
                            let mut path = vec![goal.to_string()];
                            let mut cursor = goal.to_string();
                            while let Some(p) = prev.get(&cursor) {
                                path.push(p.clone());
                                cursor = p.clone();
                            }
                            path.reverse();
                            return Some(path);
                        }
                        queue.push_back((neighbor.clone(), depth + 1));
                    }
                }
            }
        }

        None
    }

    fn find_bridge_tables(
        &self,
        high_score: &[String],
        max_hops: usize,
        db_name: Option<&str>,
    ) -> Result<Vec<String>, String> {
        if high_score.len() < 2 {
            return Ok(Vec::new());
        }

        let adjacency = self.load_adjacency(db_name)?;
        let anchors: HashSet<&String> = high_score.iter().collect();
        let mut bridges: BTreeSet<String> = BTreeSet::new();

        for i in 0..high_score.len() {
            for j in (i + 1)..high_score.len() {
                if let Some(path) =
                    Self::shortest_path(&adjacency, &high_score[i], &high_score[j], max_hops)
                {
                    for node in &path[1..path.len().saturating_sub(1)] {
                        if !anchors.contains(node) {
                            bridges.insert(node.clone());
                        }
                    }
                }
            }
        }

        if !bridges.is_empty() && crate::is_verbose_logging_enabled() {
            println!(
                "[GraphStoreActor] Found {} bridge tables for {:?}",
                bridges.len(),
                high_score
            );
        }

        Ok(bridges.into_iter().collect())
    }

    fn find_join_paths(
        &self,
        tables: &[String],
        max_hops: usize,
        db_name: Option<&str>,
    ) -> Result<Vec<JoinEdge>, String> {
        if tables.len() < 2 {
            return Ok(Vec::new());
        }

        let adjacency = self.load_adjacency(db_name)?;
        let mut seen: HashSet<(String, String, String)> = HashSet::new();
        let mut edges: Vec<JoinEdge> = Vec::new();

        for i in 0..tables.len() {
            for j in (i + 1)..tables.len() {
                let path = match Self::shortest_path(&adjacency, &tables[i], &tables[j], max_hops)
                {
                    Some(p) => p,
                    None => continue,
                };

                for window in path.windows(2) {
                    let (a, b) = (&window[0], &window[1]);
                    // Recover the stored FK direction for this hop.
                    let edge = adjacency
                        .get(a)
                        .and_then(|ns| ns.iter().find(|(n, _)| n == b))
                        .map(|(_, e)| e.clone());
                    if let Some(edge) = edge {
                        let key = (
                            edge.from_table.clone(),
                            edge.to_table.clone(),
                            edge.from_column.clone(),
                        );
                        if seen.insert(key) {
                            edges.push(JoinEdge {
                                fk_table: edge.from_table,
                                fk_column: edge.from_column,
                                pk_table: edge.to_table,
                                pk_column: edge.to_column,
                            });
                        }
                    }
                }
            }
        }

        Ok(edges)
    }

    fn get_table_count(&self) -> Result<usize, String> {
        self.conn
            .query_row("SELECT COUNT(*) FROM meta_tables", [], |row| {
                row.get::<_, i64>(0)
            })
            .map(|n| n as usize)
            .map_err(|e| format!("graph store query failed: {}", e))
    }

    fn seed_schema(&mut self, tables: &[TableSeed]) -> Result<(), String> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| format!("graph store unavailable: {}", e))?;

        for seed in tables {
            tx.execute(
                "INSERT OR REPLACE INTO meta_tables (db_name, name, chinese_name, description, domain)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                rusqlite::params![
                    seed.meta.db_name,
                    seed.meta.name,
                    seed.meta.chinese_name,
                    seed.meta.description,
                    seed.meta.domain,
                ],
            )
            .map_err(|e| format!("seed failed: {}", e))?;

            for col in &seed.columns {
                tx.execute(
                    "INSERT OR REPLACE INTO meta_columns
                     (db_name, table_name, name, chinese_name, data_type, base_type, is_pk, is_fk,
                      is_nullable, is_indexed, is_unique, description, ordinal_position)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    rusqlite::params![
                        seed.meta.db_name,
                        seed.meta.name,
                        col.name,
                        col.chinese_name,
                        col.data_type,
                        col.base_type,
                        col.is_pk as i64,
                        col.is_fk as i64,
                        col.is_nullable as i64,
                        col.is_indexed as i64,
                        col.is_unique as i64,
                        col.description,
                        col.ordinal_position,
                    ],
                )
                .map_err(|e| format!("seed failed: {}", e))?;
            }

            for (from_column, to_table, to_column) in &seed.foreign_keys {
                tx.execute(
                    "INSERT INTO meta_foreign_keys (db_name, from_table, from_column, to_table, to_column)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![
                        seed.meta.db_name,
                        seed.meta.name,
                        from_column,
                        to_table,
                        to_column,
                    ],
                )
                .map_err(|e| format!("seed failed: {}", e))?;
            }
        }

        tx.commit().map_err(|e| format!("seed failed: {}", e))?;
        println!("[GraphStoreActor] Seeded {} tables", tables.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(name: &str, position: i64) -> ColumnMeta {
        ColumnMeta {
            name: name.to_string(),
            chinese_name: None,
            data_type: "integer".to_string(),
            base_type: Some("int".to_string()),
            is_pk: position == 0,
            is_fk: false,
            is_nullable: true,
            is_indexed: false,
            is_unique: false,
            description: None,
            ordinal_position: position,
        }
    }

    fn seed(name: &str, columns: Vec<ColumnMeta>, fks: Vec<(&str, &str, &str)>) -> TableSeed {
        TableSeed {
            meta: TableMeta {
                name: name.to_string(),
                db_name: "medical".to_string(),
                chinese_name: None,
                description: None,
                domain: None,
            },
            columns,
            foreign_keys: fks
                .into_iter()
                .map(|(a, b, c)| (a.to_string(), b.to_string(), c.to_string()))
                .collect(),
        }
    }

    /// patient <- visit -> department, visit -> prescription (fk from
    /// prescription), forming a small star with one chain.
    fn seeded_actor() -> GraphStoreActor {
        let (_tx, rx) = mpsc::channel(8);
        let mut actor = GraphStoreActor::new(rx, ":memory:").unwrap();
        actor
            .seed_schema(&[
                seed(
                    "patient",
                    vec![column("patient_id", 0), column("name", 1)],
                    vec![],
                ),
                seed(
                    "visit",
                    vec![
                        column("visit_id", 0),
                        column("patient_id", 1),
                        column("department_id", 2),
                    ],
                    vec![
                        ("patient_id", "patient", "patient_id"),
                        ("department_id", "department", "department_id"),
                    ],
                ),
                seed("department", vec![column("department_id", 0)], vec![]),
                seed(
                    "prescription",
                    vec![column("prescription_id", 0), column("visit_id", 1)],
                    vec![("visit_id", "visit", "visit_id")],
                ),
            ])
            .unwrap();
        actor
    }

    #[test]
    fn test_get_table_columns_ordered_by_position() {
        let actor = seeded_actor();
        let cols = actor
            .get_table_columns(&["visit".to_string()], Some("medical"))
            .unwrap();
        let names: Vec<&str> = cols["visit"].iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["visit_id", "patient_id", "department_id"]);
    }

    #[test]
    fn test_expand_preserves_input_order_and_appends_discoveries() {
        let actor = seeded_actor();
        let expanded = actor
            .expand_with_related(&["patient".to_string()], 1, Some("medical"))
            .unwrap();
        assert_eq!(expanded[0], "patient");
        assert!(expanded.contains(&"visit".to_string()));
        assert!(!expanded.contains(&"department".to_string()));

        let expanded2 = actor
            .expand_with_related(&["patient".to_string()], 2, Some("medical"))
            .unwrap();
        assert!(expanded2.contains(&"department".to_string()));
        assert!(expanded2.contains(&"prescription".to_string()));
    }

    #[test]
    fn test_bridge_tables_exclude_endpoints() {
        let actor = seeded_actor();
        let bridges = actor
            .find_bridge_tables(
                &["patient".to_string(), "department".to_string()],
                3,
                Some("medical"),
            )
            .unwrap();
        assert_eq!(bridges, vec!["visit".to_string()]);
    }

    #[test]
    fn test_bridge_tables_needs_two_anchors() {
        let actor = seeded_actor();
        let bridges = actor
            .find_bridge_tables(&["patient".to_string()], 3, Some("medical"))
            .unwrap();
        assert!(bridges.is_empty());
    }

    #[test]
    fn test_join_paths_dedup_and_direction() {
        let actor = seeded_actor();
        let edges = actor
            .find_join_paths(
                &[
                    "patient".to_string(),
                    "visit".to_string(),
                    "department".to_string(),
                ],
                3,
                Some("medical"),
            )
            .unwrap();

        // Exactly the two FK edges, each once, in stored direction.
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.fk_table == "visit"));
        assert!(edges
            .iter()
            .any(|e| e.pk_table == "patient" && e.fk_column == "patient_id"));
        assert!(edges
            .iter()
            .any(|e| e.pk_table == "department" && e.fk_column == "department_id"));
    }

    #[test]
    fn test_join_paths_repeatable() {
        let actor = seeded_actor();
        let tables = vec![
            "patient".to_string(),
            "visit".to_string(),
            "prescription".to_string(),
        ];
        let a = actor.find_join_paths(&tables, 3, Some("medical")).unwrap();
        let b = actor.find_join_paths(&tables, 3, Some("medical")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_hop_budget_limits_paths() {
        let actor = seeded_actor();
        // patient -> visit -> prescription is 2 hops; budget 1 finds nothing.
        let bridges = actor
            .find_bridge_tables(
                &["patient".to_string(), "prescription".to_string()],
                1,
                Some("medical"),
            )
            .unwrap();
        assert!(bridges.is_empty());
    }
}
