//! Plan validation with deterministic fallback.
//!
//! Each intent is checked against the actual columns and types; invalid
//! intents are dropped. When nothing survives (or no plan exists at all) a
//! deterministic fallback chart is selected from the column profiles.

use super::preprocess::ColumnProfile;
use super::schemas::{
    AggType, ChartIntent, ChartType, ColumnDataType, LayoutType, SortDirection, VizPlan,
};

pub const PIE_MAX_CATEGORIES: i64 = 7;
pub const TOP_N_DEFAULT: i64 = 10;
const PIE_DISTINCT_LIMIT: usize = 7;
const HORIZONTAL_BAR_DISTINCT: usize = 20;

fn profile<'a>(profiles: &'a [ColumnProfile], name: &str) -> Option<&'a ColumnProfile> {
    profiles.iter().find(|p| p.name == name)
}

fn column_type(profiles: &[ColumnProfile], name: &str) -> ColumnDataType {
    profile(profiles, name)
        .map(|p| p.base_type)
        .unwrap_or(ColumnDataType::Unknown)
}

fn has_column(profiles: &[ColumnProfile], name: &str) -> bool {
    profile(profiles, name).is_some()
}

fn needs_group_by(intent: &ChartIntent) -> bool {
    if matches!(intent.chart_type, ChartType::MetricCard | ChartType::Scatter) {
        return false;
    }
    intent.binning.is_none() && intent.time_grain.is_none()
}

/// Validate one intent, normalizing recoverable gaps in place. Returns the
/// list of defects that make it unusable.
pub fn validate_intent(intent: &mut ChartIntent, profiles: &[ColumnProfile]) -> Vec<String> {
    let mut errors = Vec::new();

    // Tolerate the common x/y-for-groupBy confusion.
    if intent.group_by.is_none() {
        if intent.chart_type == ChartType::HorizontalBar {
            if let Some(y) = intent.y_field.clone() {
                intent.group_by = Some(y);
            }
        } else if matches!(
            intent.chart_type,
            ChartType::Bar
                | ChartType::Line
                | ChartType::Area
                | ChartType::GroupedBar
                | ChartType::StackedBar
                | ChartType::StackedArea
                | ChartType::Pie
                | ChartType::Donut
        ) {
            if let Some(x) = intent.x_field.clone() {
                intent.group_by = Some(x);
            }
        }
    }

    if intent.title.trim().is_empty() {
        errors.push("title is required".to_string());
    }

    if intent.chart_type.requires_axis_labels() {
        if intent.x_axis_label.as_deref().unwrap_or("").is_empty() {
            errors.push("xAxisLabel is required for axis charts".to_string());
        }
        if intent.y_axis_label.as_deref().unwrap_or("").is_empty() {
            errors.push("yAxisLabel is required for axis charts".to_string());
        }
    }

    if let Some(group_by) = &intent.group_by {
        if !has_column(profiles, group_by) {
            let derived_ok = intent
                .binning
                .as_ref()
                .map(|b| b.derived_alias() == *group_by)
                .unwrap_or(false)
                || intent
                    .time_grain
                    .as_ref()
                    .map(|t| t.derived_alias() == *group_by)
                    .unwrap_or(false);
            if !derived_ok {
                errors.push(format!("groupBy not found: {}", group_by));
            }
        }
    } else if needs_group_by(intent) {
        errors.push("groupBy is required for this chartType".to_string());
    }

    if let Some(value_field) = &intent.value_field {
        if !has_column(profiles, value_field) {
            errors.push(format!("valueField not found: {}", value_field));
        }
    }

    if let Some(series_field) = &intent.series_field {
        if !has_column(profiles, series_field) {
            errors.push(format!("seriesField not found: {}", series_field));
        }
    }

    if intent.chart_type == ChartType::Scatter {
        match (&intent.x_field, &intent.y_field) {
            (Some(x), Some(y)) => {
                if !has_column(profiles, x) {
                    errors.push(format!("xField not found: {}", x));
                }
                if !has_column(profiles, y) {
                    errors.push(format!("yField not found: {}", y));
                }
            }
            _ => errors.push("scatter requires xField and yField".to_string()),
        }
    }

    if let Some(agg) = intent.agg {
        if agg.needs_numeric_value() {
            match &intent.value_field {
                None => errors.push("valueField required for numeric aggregation".to_string()),
                Some(value_field) => {
                    if column_type(profiles, value_field) != ColumnDataType::Number {
                        errors.push(
                            "valueField must be numeric for selected aggregation".to_string(),
                        );
                    }
                }
            }
        }
    }

    if let Some(binning) = &intent.binning {
        if !has_column(profiles, &binning.field) {
            errors.push(format!("binning field not found: {}", binning.field));
        }
        if binning.bin_size.map(|s| s <= 0).unwrap_or(false) {
            errors.push("binSize must be positive".to_string());
        }
        if binning.bins.map(|b| b <= 0).unwrap_or(false) {
            errors.push("bins must be positive".to_string());
        }
    }

    if let Some(time_grain) = &intent.time_grain {
        if !has_column(profiles, &time_grain.field) {
            errors.push(format!("timeGrain field not found: {}", time_grain.field));
        }
    }

    if intent.top_n.map(|n| n <= 0).unwrap_or(false) {
        errors.push("topN must be positive".to_string());
    }

    errors
}

/// Cap pie/donut categories at the readable maximum.
pub fn enforce_pie_top_n(intent: &mut ChartIntent, profiles: &[ColumnProfile]) {
    if !intent.chart_type.is_pie_like() {
        return;
    }
    let group_by = match &intent.group_by {
        Some(g) => g,
        None => return,
    };
    let distinct = match profile(profiles, group_by) {
        Some(p) => p.distinct_count,
        None => return,
    };
    if distinct <= PIE_DISTINCT_LIMIT {
        return;
    }
    if intent.top_n.map(|n| n > PIE_MAX_CATEGORIES).unwrap_or(true) {
        intent.top_n = Some(PIE_MAX_CATEGORIES);
    }
}

fn humanize(name: &str) -> String {
    name.replace(['_', '-'], " ")
        .split_whitespace()
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn fallback_title(
    x_col: Option<&str>,
    y_col: Option<&str>,
    agg: Option<AggType>,
    question: Option<&str>,
) -> String {
    if let Some(question) = question {
        let trimmed = question.trim();
        if !trimmed.is_empty() {
            if trimmed.chars().count() <= 60 {
                return trimmed.to_string();
            }
            let prefix: String = trimmed.chars().take(57).collect();
            return format!("{}...", prefix.trim_end());
        }
    }

    match (x_col, y_col) {
        (Some(x), Some(y)) => match agg {
            Some(agg) if agg != AggType::Count => format!(
                "{} of {} by {}",
                format!("{:?}", agg).to_uppercase(),
                humanize(y),
                humanize(x)
            ),
            _ => format!("{} by {}", humanize(y), humanize(x)),
        },
        (None, Some(y)) => format!("Total {}", humanize(y)),
        (Some(x), None) => format!("{} Count", humanize(x)),
        (None, None) => "Data Overview".to_string(),
    }
}

/// Deterministic fallback selection per the planning table:
/// date+numeric → line; low-cardinality string+numeric → pie; >20 distinct
/// → horizontal bar; string+numeric → bar; string only → count bar;
/// ≥2 numeric → scatter; 1 numeric → metric card; else unsuitable.
pub fn fallback_plan(profiles: &[ColumnProfile], question: Option<&str>) -> VizPlan {
    let numeric: Vec<&ColumnProfile> = profiles
        .iter()
        .filter(|p| p.base_type == ColumnDataType::Number)
        .collect();
    let strings: Vec<&ColumnProfile> = profiles
        .iter()
        .filter(|p| p.base_type == ColumnDataType::String)
        .collect();
    let dates: Vec<&ColumnProfile> = profiles
        .iter()
        .filter(|p| p.base_type == ColumnDataType::Date)
        .collect();

    if let (Some(date), Some(num)) = (dates.first(), numeric.first()) {
        let mut intent = ChartIntent::new(
            ChartType::Line,
            fallback_title(Some(&date.name), Some(&num.name), Some(AggType::Sum), question),
        );
        intent.group_by = Some(date.name.clone());
        intent.value_field = Some(num.name.clone());
        intent.agg = Some(AggType::Sum);
        let intent = intent.with_default_axis_labels();
        return VizPlan {
            suitable: true,
            charts: vec![intent],
            layout: Some(LayoutType::Single),
            narrative: None,
            reasoning: Some(format!(
                "Fallback: time series {} vs {}",
                date.name, num.name
            )),
        };
    }

    if let (Some(string_col), Some(num)) = (strings.first(), numeric.first()) {
        let distinct = string_col.distinct_count;
        let chart_type = if distinct <= PIE_DISTINCT_LIMIT {
            ChartType::Pie
        } else if distinct > HORIZONTAL_BAR_DISTINCT {
            ChartType::HorizontalBar
        } else {
            ChartType::Bar
        };

        let top_n = match chart_type {
            ChartType::Pie => Some(PIE_MAX_CATEGORIES),
            _ if distinct > TOP_N_DEFAULT as usize => Some(TOP_N_DEFAULT),
            _ => None,
        };

        let mut intent = ChartIntent::new(
            chart_type,
            fallback_title(
                Some(&string_col.name),
                Some(&num.name),
                Some(AggType::Sum),
                question,
            ),
        );
        intent.group_by = Some(string_col.name.clone());
        intent.value_field = Some(num.name.clone());
        intent.agg = Some(AggType::Sum);
        intent.sort = Some(SortDirection::Descending);
        intent.top_n = top_n;
        let intent = intent.with_default_axis_labels();
        return VizPlan {
            suitable: true,
            charts: vec![intent],
            layout: Some(LayoutType::Single),
            narrative: None,
            reasoning: Some(format!(
                "Fallback: {:?} chart ({} categories)",
                chart_type, distinct
            )),
        };
    }

    if let Some(string_col) = strings.first() {
        let mut intent = ChartIntent::new(
            ChartType::Bar,
            fallback_title(Some(&string_col.name), None, Some(AggType::Count), question),
        );
        intent.group_by = Some(string_col.name.clone());
        intent.agg = Some(AggType::Count);
        intent.sort = Some(SortDirection::Descending);
        let intent = intent.with_default_axis_labels();
        return VizPlan {
            suitable: true,
            charts: vec![intent],
            layout: Some(LayoutType::Single),
            narrative: None,
            reasoning: Some("Fallback: bar chart with count".to_string()),
        };
    }

    if numeric.len() >= 2 {
        let mut intent = ChartIntent::new(
            ChartType::Scatter,
            fallback_title(
                Some(&numeric[0].name),
                Some(&numeric[1].name),
                None,
                question,
            ),
        );
        intent.x_field = Some(numeric[0].name.clone());
        intent.y_field = Some(numeric[1].name.clone());
        let intent = intent.with_default_axis_labels();
        return VizPlan {
            suitable: true,
            charts: vec![intent],
            layout: Some(LayoutType::Single),
            narrative: None,
            reasoning: Some(format!(
                "Fallback: scatter plot {} vs {}",
                numeric[0].name, numeric[1].name
            )),
        };
    }

    if let Some(num) = numeric.first() {
        let mut intent = ChartIntent::new(
            ChartType::MetricCard,
            fallback_title(None, Some(&num.name), Some(AggType::Sum), question),
        );
        intent.value_field = Some(num.name.clone());
        intent.agg = Some(AggType::Sum);
        return VizPlan {
            suitable: true,
            charts: vec![intent],
            layout: Some(LayoutType::Single),
            narrative: None,
            reasoning: Some("Fallback: metric card".to_string()),
        };
    }

    VizPlan::unsuitable("No suitable columns for visualization")
}

/// Validate a plan intent-by-intent; fall back deterministically when
/// nothing survives.
pub fn validate_plan(
    plan: Option<VizPlan>,
    profiles: &[ColumnProfile],
    question: Option<&str>,
) -> (VizPlan, Vec<String>, bool) {
    let mut errors: Vec<String> = Vec::new();

    let mut plan = match plan {
        Some(plan) if !plan.charts.is_empty() => plan,
        _ => {
            errors.push("No plan provided; fallback applied.".to_string());
            return (fallback_plan(profiles, question), errors, true);
        }
    };

    let mut valid_charts = Vec::new();
    for mut intent in plan.charts.drain(..) {
        let intent_errors = validate_intent(&mut intent, profiles);
        if !intent_errors.is_empty() {
            errors.extend(intent_errors);
            continue;
        }
        enforce_pie_top_n(&mut intent, profiles);
        valid_charts.push(intent);
    }

    if valid_charts.is_empty() {
        errors.push("No valid charts after validation; fallback applied.".to_string());
        return (fallback_plan(profiles, question), errors, true);
    }

    plan.charts = valid_charts;
    if !errors.is_empty() && plan.reasoning.is_none() {
        plan.reasoning = Some(errors[..errors.len().min(3)].join("; "));
    }

    (plan, errors, false)
}
