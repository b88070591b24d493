//! Visualization planning schemas: the structured output contract for the
//! chart-planning LLM call, camelCase on the wire.

use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChartType {
    Bar,
    Line,
    Pie,
    Scatter,
    Area,
    HorizontalBar,
    Donut,
    GroupedBar,
    StackedBar,
    StackedArea,
    MetricCard,
}

impl ChartType {
    /// Chart families that must carry axis labels.
    pub fn requires_axis_labels(&self) -> bool {
        matches!(
            self,
            ChartType::Bar
                | ChartType::Line
                | ChartType::Area
                | ChartType::HorizontalBar
                | ChartType::GroupedBar
                | ChartType::StackedBar
                | ChartType::StackedArea
                | ChartType::Scatter
        )
    }

    pub fn is_pie_like(&self) -> bool {
        matches!(self, ChartType::Pie | ChartType::Donut)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggType {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggType {
    pub fn needs_numeric_value(&self) -> bool {
        !matches!(self, AggType::Count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Ascending,
    Descending,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutType {
    Single,
    Grid,
    Tabs,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeGrain {
    Day,
    Week,
    Month,
    Quarter,
    Year,
}

/// Inferred base type of a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnDataType {
    Number,
    String,
    Date,
    Boolean,
    Unknown,
}

/// Binning of numeric values into ranges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinningConfig {
    pub field: String,
    #[serde(default)]
    pub bin_size: Option<i64>,
    #[serde(default)]
    pub bins: Option<i64>,
    #[serde(default)]
    pub alias: Option<String>,
}

impl BinningConfig {
    pub fn derived_alias(&self) -> String {
        self.alias
            .clone()
            .unwrap_or_else(|| format!("{}_bin", self.field))
    }
}

/// Time-grain grouping of a date column.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeGrainConfig {
    pub field: String,
    pub grain: TimeGrain,
    #[serde(default)]
    pub alias: Option<String>,
}

impl TimeGrainConfig {
    pub fn derived_alias(&self) -> String {
        self.alias.clone().unwrap_or_else(|| {
            format!(
                "{}_{}",
                self.field,
                serde_json::to_value(self.grain)
                    .ok()
                    .and_then(|v| v.as_str().map(|s| s.to_string()))
                    .unwrap_or_default()
            )
        })
    }
}

/// One chart the planner wants rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartIntent {
    pub chart_type: ChartType,
    pub title: String,
    #[serde(default)]
    pub group_by: Option<String>,
    #[serde(default)]
    pub value_field: Option<String>,
    #[serde(default)]
    pub series_field: Option<String>,
    #[serde(default)]
    pub x_field: Option<String>,
    #[serde(default)]
    pub y_field: Option<String>,
    #[serde(default)]
    pub agg: Option<AggType>,
    #[serde(default)]
    pub sort: Option<SortDirection>,
    #[serde(default)]
    pub top_n: Option<i64>,
    #[serde(default)]
    pub x_axis_label: Option<String>,
    #[serde(default)]
    pub y_axis_label: Option<String>,
    #[serde(default)]
    pub x_unit: Option<String>,
    #[serde(default)]
    pub y_unit: Option<String>,
    #[serde(default)]
    pub show_percentage: Option<bool>,
    #[serde(default)]
    pub binning: Option<BinningConfig>,
    #[serde(default)]
    pub time_grain: Option<TimeGrainConfig>,
}

impl ChartIntent {
    pub fn new(chart_type: ChartType, title: impl Into<String>) -> Self {
        Self {
            chart_type,
            title: title.into(),
            group_by: None,
            value_field: None,
            series_field: None,
            x_field: None,
            y_field: None,
            agg: None,
            sort: None,
            top_n: None,
            x_axis_label: None,
            y_axis_label: None,
            x_unit: None,
            y_unit: None,
            show_percentage: None,
            binning: None,
            time_grain: None,
        }
    }

    /// Fill axis labels from the fields they describe when absent.
    pub fn with_default_axis_labels(mut self) -> Self {
        if self.chart_type.requires_axis_labels() {
            if self.x_axis_label.is_none() {
                self.x_axis_label = self
                    .group_by
                    .clone()
                    .or_else(|| self.x_field.clone())
                    .or(Some("category".to_string()));
            }
            if self.y_axis_label.is_none() {
                self.y_axis_label = self
                    .value_field
                    .clone()
                    .or_else(|| self.y_field.clone())
                    .or(Some("value".to_string()));
            }
        }
        self
    }
}

/// The planner's full answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VizPlan {
    pub suitable: bool,
    #[serde(default)]
    pub charts: Vec<ChartIntent>,
    #[serde(default)]
    pub layout: Option<LayoutType>,
    #[serde(default)]
    pub narrative: Option<Vec<String>>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

impl VizPlan {
    pub fn unsuitable(reason: impl Into<String>) -> Self {
        Self {
            suitable: false,
            charts: Vec::new(),
            layout: Some(LayoutType::Single),
            narrative: None,
            reasoning: Some(reason.into()),
        }
    }
}

/// JSON Schema handed to the LLM as the structured-output contract.
pub fn viz_plan_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "title": "VizPlan",
        "properties": {
            "suitable": { "type": "boolean" },
            "charts": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "chartType": {
                            "type": "string",
                            "enum": ["bar", "line", "pie", "scatter", "area",
                                     "horizontal_bar", "donut", "grouped_bar",
                                     "stacked_bar", "stacked_area", "metric_card"]
                        },
                        "title": { "type": "string", "minLength": 1 },
                        "groupBy": { "type": ["string", "null"] },
                        "valueField": { "type": ["string", "null"] },
                        "seriesField": { "type": ["string", "null"] },
                        "xField": { "type": ["string", "null"] },
                        "yField": { "type": ["string", "null"] },
                        "agg": { "type": ["string", "null"], "enum": ["count", "sum", "avg", "min", "max", null] },
                        "sort": { "type": ["string", "null"], "enum": ["ascending", "descending", "none", null] },
                        "topN": { "type": ["integer", "null"], "minimum": 1 },
                        "xAxisLabel": { "type": ["string", "null"] },
                        "yAxisLabel": { "type": ["string", "null"] },
                        "xUnit": { "type": ["string", "null"] },
                        "yUnit": { "type": ["string", "null"] },
                        "showPercentage": { "type": ["boolean", "null"] },
                        "binning": { "type": ["object", "null"] },
                        "timeGrain": { "type": ["object", "null"] }
                    },
                    "required": ["chartType", "title"]
                }
            },
            "layout": { "type": ["string", "null"], "enum": ["single", "grid", "tabs", null] },
            "narrative": { "type": ["array", "null"], "items": { "type": "string" } },
            "reasoning": { "type": ["string", "null"] }
        },
        "required": ["suitable", "charts"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chart_intent_camel_case_wire_format() {
        let intent = ChartIntent {
            group_by: Some("month".to_string()),
            value_field: Some("orders".to_string()),
            agg: Some(AggType::Sum),
            top_n: Some(7),
            ..ChartIntent::new(ChartType::Line, "Orders by month")
        };

        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["chartType"], "line");
        assert_eq!(json["groupBy"], "month");
        assert_eq!(json["valueField"], "orders");
        assert_eq!(json["topN"], 7);
        assert!(json.get("group_by").is_none());
    }

    #[test]
    fn test_plan_parses_llm_shape() {
        let raw = r#"{
            "suitable": true,
            "charts": [{
                "chartType": "horizontal_bar",
                "title": "Top categories",
                "groupBy": "category",
                "valueField": "amount",
                "agg": "sum",
                "sort": "descending",
                "topN": 10,
                "xAxisLabel": "Amount",
                "yAxisLabel": "Category"
            }],
            "layout": "single",
            "reasoning": "many categories"
        }"#;

        let plan: VizPlan = serde_json::from_str(raw).unwrap();
        assert!(plan.suitable);
        assert_eq!(plan.charts[0].chart_type, ChartType::HorizontalBar);
        assert_eq!(plan.charts[0].agg, Some(AggType::Sum));
    }

    #[test]
    fn test_axis_label_requirements() {
        assert!(ChartType::Bar.requires_axis_labels());
        assert!(ChartType::Scatter.requires_axis_labels());
        assert!(!ChartType::Pie.requires_axis_labels());
        assert!(!ChartType::MetricCard.requires_axis_labels());
    }

    #[test]
    fn test_time_grain_alias_derivation() {
        let config = TimeGrainConfig {
            field: "order_date".to_string(),
            grain: TimeGrain::Month,
            alias: None,
        };
        assert_eq!(config.derived_alias(), "order_date_month");
    }
}
