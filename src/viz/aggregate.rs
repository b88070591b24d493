//! Deterministic aggregation of a result set against a chart intent.
//!
//! Grouping key: the group-by column, a time-grain truncation of a date
//! column, or a numeric bin. Values aggregate by count/sum/avg/min/max.
//! Ordering is stable: ties keep the first-seen category order.

use serde_json::Value;
use std::collections::HashMap;

use super::schemas::{AggType, ChartIntent, SortDirection, TimeGrain};
use super::VizInput;

/// One aggregated data point.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DataPoint {
    pub category: String,
    pub value: f64,
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn value_as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "(null)".to_string(),
        other => other.to_string(),
    }
}

/// Truncate an ISO-ish date string to the requested grain.
pub fn truncate_to_grain(date: &str, grain: TimeGrain) -> String {
    let date = date.trim();
    match grain {
        TimeGrain::Day => date.chars().take(10).collect(),
        TimeGrain::Month => date.chars().take(7).collect(),
        TimeGrain::Year => date.chars().take(4).collect(),
        TimeGrain::Quarter => {
            let year: String = date.chars().take(4).collect();
            let month: String = date.chars().skip(5).take(2).collect();
            let quarter = match month.parse::<u32>() {
                Ok(m) if (1..=12).contains(&m) => (m - 1) / 3 + 1,
                _ => return date.to_string(),
            };
            format!("{}-Q{}", year, quarter)
        }
        TimeGrain::Week => {
            // Without a calendar library the day-level key is the honest
            // stand-in; renderers bucket further if needed.
            date.chars().take(10).collect()
        }
    }
}

fn bin_label(value: f64, bin_size: i64) -> String {
    let size = bin_size.max(1) as f64;
    let lower = (value / size).floor() * size;
    format!("{}-{}", lower as i64, (lower + size) as i64)
}

struct Accumulator {
    count: usize,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }

    fn push(&mut self, value: Option<f64>) {
        self.count += 1;
        if let Some(v) = value {
            self.sum += v;
            self.min = self.min.min(v);
            self.max = self.max.max(v);
        }
    }

    fn finish(&self, agg: AggType) -> f64 {
        match agg {
            AggType::Count => self.count as f64,
            AggType::Sum => self.sum,
            AggType::Avg => {
                if self.count == 0 {
                    0.0
                } else {
                    self.sum / self.count as f64
                }
            }
            AggType::Min => {
                if self.min.is_finite() {
                    self.min
                } else {
                    0.0
                }
            }
            AggType::Max => {
                if self.max.is_finite() {
                    self.max
                } else {
                    0.0
                }
            }
        }
    }
}

/// Aggregate the rows for one intent. Returns None when the intent has no
/// aggregatable shape (e.g. scatter or metric intents are rendered from
/// raw values instead).
pub fn aggregate(intent: &ChartIntent, input: &VizInput) -> Option<Vec<DataPoint>> {
    let column_index: HashMap<&str, usize> = input
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| (name.as_str(), i))
        .collect();

    // Resolve the grouping key extractor.
    let key_for_row: Box<dyn Fn(&Vec<Value>) -> Option<String>> =
        if let Some(time_grain) = &intent.time_grain {
            let idx = *column_index.get(time_grain.field.as_str())?;
            let grain = time_grain.grain;
            Box::new(move |row| {
                row.get(idx)
                    .map(|v| truncate_to_grain(&value_as_string(v), grain))
            })
        } else if let Some(binning) = &intent.binning {
            let idx = *column_index.get(binning.field.as_str())?;
            let bin_size = binning.bin_size.unwrap_or(10);
            Box::new(move |row| {
                row.get(idx)
                    .and_then(value_as_f64)
                    .map(|v| bin_label(v, bin_size))
            })
        } else if let Some(group_by) = &intent.group_by {
            let idx = *column_index.get(group_by.as_str())?;
            Box::new(move |row| row.get(idx).map(value_as_string))
        } else {
            return None;
        };

    let agg = intent.agg.unwrap_or(AggType::Count);
    let value_idx = intent
        .value_field
        .as_ref()
        .and_then(|f| column_index.get(f.as_str()).copied());

    // First-seen order makes the sort stable on ties.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Accumulator> = HashMap::new();

    for row in &input.rows {
        let key = match key_for_row(row) {
            Some(key) => key,
            None => continue,
        };
        if !groups.contains_key(&key) {
            order.push(key.clone());
        }
        let value = value_idx.and_then(|idx| row.get(idx)).and_then(value_as_f64);
        groups.entry(key).or_insert_with(Accumulator::new).push(value);
    }

    let mut points: Vec<DataPoint> = order
        .into_iter()
        .map(|category| {
            let value = groups
                .get(&category)
                .map(|acc| acc.finish(agg))
                .unwrap_or(0.0);
            DataPoint { category, value }
        })
        .collect();

    match intent.sort {
        Some(SortDirection::Ascending) => {
            points.sort_by(|a, b| a.value.partial_cmp(&b.value).unwrap_or(std::cmp::Ordering::Equal));
        }
        Some(SortDirection::Descending) => {
            points.sort_by(|a, b| b.value.partial_cmp(&a.value).unwrap_or(std::cmp::Ordering::Equal));
        }
        _ => {}
    }

    if let Some(top_n) = intent.top_n {
        points.truncate(top_n.max(0) as usize);
    }

    Some(points)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viz::schemas::{ChartType, TimeGrainConfig};
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

    fn sum_intent(group_by: &str, value_field: &str) -> ChartIntent {
        let mut intent = ChartIntent::new(ChartType::Bar, "t");
        intent.group_by = Some(group_by.to_string());
        intent.value_field = Some(value_field.to_string());
        intent.agg = Some(AggType::Sum);
        intent
    }

    #[test]
    fn test_sum_grouping() {
        let data = input(
            &["category", "amount"],
            vec![
                vec![json!("a"), json!(10)],
                vec![json!("b"), json!(5)],
                vec![json!("a"), json!(7)],
            ],
        );

        let points = aggregate(&sum_intent("category", "amount"), &data).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], DataPoint { category: "a".to_string(), value: 17.0 });
        assert_eq!(points[1].category, "b");
    }

    #[test]
    fn test_count_without_value_field() {
        let data = input(
            &["category"],
            vec![vec![json!("x")], vec![json!("x")], vec![json!("y")]],
        );

        let mut intent = ChartIntent::new(ChartType::Bar, "t");
        intent.group_by = Some("category".to_string());
        let points = aggregate(&intent, &data).unwrap();
        assert_eq!(points[0].value, 2.0);
        assert_eq!(points[1].value, 1.0);
    }

    #[test]
    fn test_sort_desc_and_top_n() {
        let data = input(
            &["category", "amount"],
            vec![
                vec![json!("a"), json!(1)],
                vec![json!("b"), json!(9)],
                vec![json!("c"), json!(5)],
            ],
        );

        let mut intent = sum_intent("category", "amount");
        intent.sort = Some(SortDirection::Descending);
        intent.top_n = Some(2);

        let points = aggregate(&intent, &data).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].category, "b");
        assert_eq!(points[1].category, "c");
    }

    #[test]
    fn test_stable_on_ties() {
        let data = input(
            &["category", "amount"],
            vec![
                vec![json!("first"), json!(5)],
                vec![json!("second"), json!(5)],
            ],
        );

        let mut intent = sum_intent("category", "amount");
        intent.sort = Some(SortDirection::Descending);
        let points = aggregate(&intent, &data).unwrap();
        assert_eq!(points[0].category, "first");
    }

    #[test]
    fn test_time_grain_truncation() {
        assert_eq!(truncate_to_grain("2026-03-15", TimeGrain::Month), "2026-03");
        assert_eq!(truncate_to_grain("2026-03-15", TimeGrain::Year), "2026");
        assert_eq!(truncate_to_grain("2026-03-15", TimeGrain::Quarter), "2026-Q1");
        assert_eq!(truncate_to_grain("2026-11-15", TimeGrain::Quarter), "2026-Q4");
    }

    #[test]
    fn test_time_grain_grouping() {
        let data = input(
            &["day", "orders"],
            vec![
                vec![json!("2026-01-05"), json!(2)],
                vec![json!("2026-01-20"), json!(3)],
                vec![json!("2026-02-01"), json!(4)],
            ],
        );

        let mut intent = ChartIntent::new(ChartType::Line, "t");
        intent.time_grain = Some(TimeGrainConfig {
            field: "day".to_string(),
            grain: TimeGrain::Month,
            alias: None,
        });
        intent.value_field = Some("orders".to_string());
        intent.agg = Some(AggType::Sum);

        let points = aggregate(&intent, &data).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0], DataPoint { category: "2026-01".to_string(), value: 5.0 });
    }

    #[test]
    fn test_binning() {
        let data = input(
            &["age", "n"],
            vec![
                vec![json!(12), json!(1)],
                vec![json!(17), json!(1)],
                vec![json!(25), json!(1)],
            ],
        );

        let mut intent = ChartIntent::new(ChartType::Bar, "t");
        intent.binning = Some(crate::viz::schemas::BinningConfig {
            field: "age".to_string(),
            bin_size: Some(10),
            bins: None,
            alias: None,
        });

        let points = aggregate(&intent, &data).unwrap();
        assert_eq!(points[0].category, "10-20");
        assert_eq!(points[0].value, 2.0);
        assert_eq!(points[1].category, "20-30");
    }

    #[test]
    fn test_avg_min_max() {
        let data = input(
            &["g", "v"],
            vec![
                vec![json!("a"), json!(2)],
                vec![json!("a"), json!(6)],
            ],
        );

        for (agg, expected) in [
            (AggType::Avg, 4.0),
            (AggType::Min, 2.0),
            (AggType::Max, 6.0),
        ] {
            let mut intent = sum_intent("g", "v");
            intent.agg = Some(agg);
            let points = aggregate(&intent, &data).unwrap();
            assert_eq!(points[0].value, expected, "agg {:?}", agg);
        }
    }
}
