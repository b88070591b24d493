//! Typed context merging for follow-up turns.
//!
//! When a follow-up reuses the prior cached context, the previously scoped
//! tables are merged with the newly retrieved ones. The merge operates on
//! the typed cached `RetrievalResult`, not on rendered prompt text, so no
//! string marker couples the merger to the schema renderer.

use crate::retrieval::RetrievalResult;

/// Union of cached and new tables: cached order first, then new tables in
/// their own order.
pub fn merge_tables(cached: Option<&RetrievalResult>, new_tables: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::new();

    if let Some(cached) = cached {
        merged.extend(cached.tables.iter().cloned());
    }

    for table in new_tables {
        if !merged.contains(table) {
            merged.push(table.clone());
        }
    }

    if let Some(cached) = cached {
        println!(
            "[ContextMerger] Merged tables: {} cached + {} new = {} total",
            cached.tables.len(),
            new_tables.len(),
            merged.len()
        );
    }

    merged
}

/// Merge a fresh retrieval into the cached one, keeping the union of
/// tables and preferring fresh columns/joins where present.
pub fn merge_results(cached: &RetrievalResult, fresh: &RetrievalResult) -> RetrievalResult {
    let tables = merge_tables(Some(cached), &fresh.tables);

    let mut table_columns = cached.table_columns.clone();
    for (table, columns) in &fresh.table_columns {
        table_columns.insert(table.clone(), columns.clone());
    }

    let mut table_metadata = cached.table_metadata.clone();
    for (table, meta) in &fresh.table_metadata {
        table_metadata.insert(table.clone(), meta.clone());
    }

    let mut join_paths = cached.join_paths.clone();
    for edge in &fresh.join_paths {
        if !join_paths.contains(edge) {
            join_paths.push(edge.clone());
        }
    }

    RetrievalResult {
        tables,
        table_columns,
        table_metadata,
        semantic_columns: fresh.semantic_columns.clone(),
        join_paths,
        stats: fresh.stats.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result_with(tables: &[&str]) -> RetrievalResult {
        RetrievalResult {
            tables: tables.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_merge_no_cache_passes_through() {
        let merged = merge_tables(None, &["patient".to_string()]);
        assert_eq!(merged, vec!["patient"]);
    }

    #[test]
    fn test_merge_unions_preserving_cached_order() {
        let cached = result_with(&["patient", "visit"]);
        let merged = merge_tables(
            Some(&cached),
            &["visit".to_string(), "prescription".to_string()],
        );
        assert_eq!(merged, vec!["patient", "visit", "prescription"]);
    }

    #[test]
    fn test_merge_results_prefers_fresh_columns() {
        let mut cached = result_with(&["patient"]);
        cached.table_columns.insert("patient".to_string(), vec![]);

        let mut fresh = result_with(&["visit"]);
        fresh.table_columns.insert(
            "visit".to_string(),
            vec![crate::actors::graph_store_actor::ColumnMeta {
                name: "visit_id".to_string(),
                chinese_name: None,
                data_type: "integer".to_string(),
                base_type: None,
                is_pk: true,
                is_fk: false,
                is_nullable: false,
                is_indexed: false,
                is_unique: false,
                description: None,
                ordinal_position: 0,
            }],
        );

        let merged = merge_results(&cached, &fresh);
        assert_eq!(merged.tables, vec!["patient", "visit"]);
        assert!(merged.table_columns.contains_key("patient"));
        assert!(merged.table_columns.contains_key("visit"));
    }
}
