//! Column profiling from a bounded result sample.

use serde_json::Value;

use super::schemas::ColumnDataType;
use super::VizInput;

pub const LOW_CARDINALITY_THRESHOLD: usize = 10;
pub const HIGH_CARDINALITY_THRESHOLD: usize = 50;
pub const MAX_SAMPLE_ROWS: usize = 200;

/// Semantic refinement of the base type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SemanticType {
    Number,
    String,
    Date,
    Boolean,
    Unknown,
    CategoricalNumeric,
}

/// Profile of one result column.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ColumnProfile {
    pub name: String,
    pub base_type: ColumnDataType,
    pub distinct_count: usize,
    pub sample: Vec<String>,
    pub semantic_type: SemanticType,
    pub is_high_cardinality: bool,
}

fn is_number(value: &Value) -> bool {
    match value {
        Value::Number(_) => true,
        Value::Bool(_) => false,
        Value::String(s) => s.trim().parse::<f64>().is_ok(),
        _ => false,
    }
}

fn looks_like_date(value: &Value) -> bool {
    match value {
        Value::String(s) => {
            let has_marker = s.contains('-') || s.contains('/') || s.contains('T') || s.contains(':');
            // Pure numbers with separators like "3/4" still count; real
            // dates dominate in practice.
            has_marker && s.chars().any(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}

/// Infer the base type of a column from its non-null values.
pub fn infer_column_type(values: &[&Value]) -> ColumnDataType {
    let non_null: Vec<&&Value> = values.iter().filter(|v| !v.is_null()).collect();
    if non_null.is_empty() {
        return ColumnDataType::Unknown;
    }

    if non_null.iter().all(|v| is_number(v)) {
        return ColumnDataType::Number;
    }

    if non_null.iter().all(|v| v.is_boolean()) {
        return ColumnDataType::Boolean;
    }

    if non_null.iter().all(|v| looks_like_date(v)) {
        return ColumnDataType::Date;
    }

    ColumnDataType::String
}

fn semantic_type(base: ColumnDataType, distinct_count: usize) -> SemanticType {
    if base == ColumnDataType::Number && distinct_count <= LOW_CARDINALITY_THRESHOLD {
        return SemanticType::CategoricalNumeric;
    }
    match base {
        ColumnDataType::Number => SemanticType::Number,
        ColumnDataType::String => SemanticType::String,
        ColumnDataType::Date => SemanticType::Date,
        ColumnDataType::Boolean => SemanticType::Boolean,
        ColumnDataType::Unknown => SemanticType::Unknown,
    }
}

fn high_cardinality(base: ColumnDataType, distinct_count: usize, row_count: usize) -> bool {
    if base != ColumnDataType::String || row_count == 0 {
        return false;
    }
    let threshold = HIGH_CARDINALITY_THRESHOLD.max((0.2 * row_count as f64) as usize);
    distinct_count >= threshold
}

/// Build per-column profiles from the first `MAX_SAMPLE_ROWS` rows.
pub fn build_profiles(input: &VizInput) -> Vec<ColumnProfile> {
    let sample_rows: Vec<&Vec<Value>> = input.rows.iter().take(MAX_SAMPLE_ROWS).collect();

    input
        .columns
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let values: Vec<&Value> = sample_rows
                .iter()
                .filter_map(|row| row.get(idx))
                .collect();

            let distinct: std::collections::HashSet<String> = values
                .iter()
                .filter(|v| !v.is_null())
                .map(|v| v.to_string())
                .collect();
            let distinct_count = distinct.len();

            let sample: Vec<String> = values
                .iter()
                .filter(|v| !v.is_null())
                .take(5)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect();

            let base_type = infer_column_type(&values);

            ColumnProfile {
                name: name.clone(),
                base_type,
                distinct_count,
                sample,
                semantic_type: semantic_type(base_type, distinct_count),
                is_high_cardinality: high_cardinality(
                    base_type,
                    distinct_count,
                    input.row_count,
                ),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input(columns: &[&str], rows: Vec<Vec<Value>>) -> VizInput {
        let row_count = rows.len();
        VizInput {
            question: None,
            sql: None,
            columns: columns.iter().map(|s| s.to_string()).collect(),
            rows,
            row_count,
        }
    }

    #[test]
    fn test_infer_number_from_mixed_representations() {
        let values = [json!(1), json!("2.5"), json!(3)];
        let refs: Vec<&Value> = values.iter().collect();
        assert_eq!(infer_column_type(&refs), ColumnDataType::Number);
    }

    #[test]
    fn test_infer_date_from_strings() {
        let values = [json!("2026-01-01"), json!("2026-02-01")];
        let refs: Vec<&Value> = values.iter().collect();
        assert_eq!(infer_column_type(&refs), ColumnDataType::Date);
    }

    #[test]
    fn test_infer_boolean_and_string() {
        let bools = [json!(true), json!(false)];
        let refs: Vec<&Value> = bools.iter().collect();
        assert_eq!(infer_column_type(&refs), ColumnDataType::Boolean);

        let strings = [json!("theft"), json!("battery")];
        let refs: Vec<&Value> = strings.iter().collect();
        assert_eq!(infer_column_type(&refs), ColumnDataType::String);
    }

    #[test]
    fn test_all_null_is_unknown() {
        let values = [Value::Null, Value::Null];
        let refs: Vec<&Value> = values.iter().collect();
        assert_eq!(infer_column_type(&refs), ColumnDataType::Unknown);
    }

    #[test]
    fn test_categorical_numeric_detection() {
        let rows: Vec<Vec<Value>> = (0..20).map(|i| vec![json!(i % 3)]).collect();
        let profiles = build_profiles(&input(&["rating"], rows));
        assert_eq!(profiles[0].base_type, ColumnDataType::Number);
        assert_eq!(profiles[0].semantic_type, SemanticType::CategoricalNumeric);
    }

    #[test]
    fn test_high_cardinality_flag() {
        // 300 rows of distinct strings: distinct >= max(50, 60).
        let rows: Vec<Vec<Value>> = (0..300).map(|i| vec![json!(format!("case-{}", i))]).collect();
        let profiles = build_profiles(&input(&["case_number"], rows));
        // Profiling samples the first 200 rows; 200 distinct >= 60.
        assert!(profiles[0].is_high_cardinality);

        let rows: Vec<Vec<Value>> = (0..300).map(|i| vec![json!(format!("t-{}", i % 5))]).collect();
        let profiles = build_profiles(&input(&["category"], rows));
        assert!(!profiles[0].is_high_cardinality);
    }
}
