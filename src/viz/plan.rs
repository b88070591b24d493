//! LLM chart planning with error-correction retries.

use serde_json::json;
use tokio::sync::{mpsc, oneshot};

use super::preprocess::ColumnProfile;
use super::schemas::{viz_plan_schema, VizPlan};
use super::VizInput;
use crate::actors::llm_gateway_actor::{LlmMsg, ModelPurpose};
use crate::protocol::ChatMessage;

pub const MAX_RETRIES: usize = 2;

const VIZ_SYSTEM_PROMPT: &str = r#"You are a data visualization planner. Given a SQL result profile, propose the chart(s) that best answer the user's question.

Chart selection guide:
- bar: compare values across categories (1 categorical + 1 numeric)
- horizontal_bar: categories with long names or more than 20 of them
- line / area: trends over a date column
- pie / donut: proportions, at most 7 categories
- scatter: correlation between two numeric columns
- metric_card: a single important number
- grouped_bar / stacked_bar / stacked_area: a second categorical dimension

Hard requirements:
- title is REQUIRED and non-empty on every chart
- axis charts (bar, line, area, horizontal_bar, grouped_bar, stacked_bar, stacked_area, scatter) REQUIRE xAxisLabel and yAxisLabel
- groupBy / valueField / seriesField must be real column names from the profile
- topN, when present, must be a positive integer
- pie/donut with many categories must set topN to at most 7

If the data does not suit any chart, return {"suitable": false, "charts": []}."#;

fn build_user_prompt(input: &VizInput, profiles: &[ColumnProfile]) -> String {
    let profile_json = serde_json::to_string(profiles).unwrap_or_else(|_| "[]".to_string());
    let sample: Vec<&Vec<serde_json::Value>> = input.rows.iter().take(10).collect();
    let sample_json = serde_json::to_string(&json!({
        "columns": input.columns,
        "rows": sample,
    }))
    .unwrap_or_default();

    format!(
        "Question: {}\nSQL: {}\nRow count: {}\n\nColumn profiles:\n{}\n\nSample rows:\n{}\n\n\
         Produce the VizPlan JSON.",
        input.question.as_deref().unwrap_or("(not provided)"),
        input.sql.as_deref().unwrap_or("(not provided)"),
        input.row_count,
        profile_json,
        sample_json
    )
}

/// Pre-validation mirroring the hard requirements above; runs before the
/// plan is accepted so a retry can correct specific defects.
pub fn pre_validate(plan: &VizPlan, columns: &[String]) -> Vec<String> {
    let mut errors = Vec::new();

    if plan.charts.is_empty() {
        if plan.suitable {
            errors.push("suitable=true but no charts".to_string());
        }
        return errors;
    }

    for (i, intent) in plan.charts.iter().enumerate() {
        let prefix = format!("Chart {}", i + 1);

        if intent.title.trim().is_empty() {
            errors.push(format!("{}: title is required but empty", prefix));
        }

        if intent.chart_type.requires_axis_labels() {
            if intent.x_axis_label.as_deref().unwrap_or("").is_empty() {
                errors.push(format!("{}: xAxisLabel is required for axis charts", prefix));
            }
            if intent.y_axis_label.as_deref().unwrap_or("").is_empty() {
                errors.push(format!("{}: yAxisLabel is required for axis charts", prefix));
            }
        }

        for (label, field) in [
            ("groupBy", &intent.group_by),
            ("valueField", &intent.value_field),
            ("seriesField", &intent.series_field),
        ] {
            if let Some(name) = field {
                let derived = intent
                    .binning
                    .as_ref()
                    .map(|b| b.derived_alias() == *name)
                    .unwrap_or(false)
                    || intent
                        .time_grain
                        .as_ref()
                        .map(|t| t.derived_alias() == *name)
                        .unwrap_or(false);
                if !derived && !columns.contains(name) {
                    errors.push(format!("{}: {} '{}' not in columns", prefix, label, name));
                }
            }
        }

        if intent.top_n.map(|n| n <= 0).unwrap_or(false) {
            errors.push(format!("{}: topN must be positive", prefix));
        }
    }

    errors
}

/// Ask the planning model for a VizPlan, retrying with the specific
/// validation errors appended. Returns (plan, attempt errors).
pub async fn plan_with_llm(
    llm_tx: &mpsc::Sender<LlmMsg>,
    input: &VizInput,
    profiles: &[ColumnProfile],
) -> (Option<VizPlan>, Vec<String>) {
    let mut messages = vec![
        ChatMessage::system(VIZ_SYSTEM_PROMPT),
        ChatMessage::user(build_user_prompt(input, profiles)),
    ];

    let mut all_errors: Vec<String> = Vec::new();

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            if let Some(last) = all_errors.last().cloned() {
                println!("[VizPlan] Retry {}/{}: {}", attempt, MAX_RETRIES, last);
                messages.push(ChatMessage::assistant("(previous attempt failed)"));
                messages.push(ChatMessage::user(format!(
                    "Your previous plan was rejected: {}\n\n\
                     Produce a corrected VizPlan JSON fixing exactly these problems.",
                    last
                )));
            }
        }

        let (tx, rx) = oneshot::channel();
        let sent = llm_tx
            .send(LlmMsg::Chat {
                purpose: ModelPurpose::Planning,
                messages: messages.clone(),
                tools: None,
                response_schema: Some(viz_plan_schema()),
                token_tx: None,
                cancel_rx: None,
                respond_to: tx,
            })
            .await;

        if sent.is_err() {
            all_errors.push(format!("Attempt {}: llm gateway unavailable", attempt + 1));
            break;
        }

        let response = match rx.await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                all_errors.push(format!("Attempt {}: {}", attempt + 1, e));
                continue;
            }
            Err(_) => {
                all_errors.push(format!("Attempt {}: llm gateway died", attempt + 1));
                break;
            }
        };

        let plan: VizPlan = match response
            .structured
            .clone()
            .and_then(|v| serde_json::from_value(v).ok())
        {
            Some(plan) => plan,
            None => {
                all_errors.push(format!(
                    "Attempt {}: response did not match VizPlan schema",
                    attempt + 1
                ));
                continue;
            }
        };

        let validation_errors = pre_validate(&plan, &input.columns);
        if !validation_errors.is_empty() {
            all_errors.push(format!(
                "Attempt {} validation: {}",
                attempt + 1,
                validation_errors.join("; ")
            ));
            continue;
        }

        return (Some(plan), all_errors);
    }

    println!(
        "[VizPlan] Planning failed after {} attempt(s): {:?}",
        MAX_RETRIES + 1,
        all_errors
    );
    (None, all_errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::viz::schemas::{ChartIntent, ChartType};

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pre_validate_catches_missing_title_and_labels() {
        let mut intent = ChartIntent::new(ChartType::Bar, "");
        intent.group_by = Some("category".to_string());

        let plan = VizPlan {
            suitable: true,
            charts: vec![intent],
            layout: None,
            narrative: None,
            reasoning: None,
        };

        let errors = pre_validate(&plan, &columns(&["category", "amount"]));
        assert!(errors.iter().any(|e| e.contains("title")));
        assert!(errors.iter().any(|e| e.contains("xAxisLabel")));
    }

    #[test]
    fn test_pre_validate_checks_column_membership() {
        let mut intent = ChartIntent::new(ChartType::Pie, "Shares");
        intent.group_by = Some("ghost".to_string());

        let plan = VizPlan {
            suitable: true,
            charts: vec![intent],
            layout: None,
            narrative: None,
            reasoning: None,
        };

        let errors = pre_validate(&plan, &columns(&["category"]));
        assert!(errors.iter().any(|e| e.contains("ghost")));
    }

    #[test]
    fn test_pre_validate_accepts_derived_alias() {
        let mut intent = ChartIntent::new(ChartType::Pie, "By month");
        intent.time_grain = Some(crate::viz::schemas::TimeGrainConfig {
            field: "order_date".to_string(),
            grain: crate::viz::schemas::TimeGrain::Month,
            alias: None,
        });
        intent.group_by = Some("order_date_month".to_string());

        let plan = VizPlan {
            suitable: true,
            charts: vec![intent],
            layout: None,
            narrative: None,
            reasoning: None,
        };

        let errors = pre_validate(&plan, &columns(&["order_date", "total"]));
        assert!(errors.is_empty(), "{:?}", errors);
    }

    #[test]
    fn test_pre_validate_unsuitable_plan_passes() {
        let plan = VizPlan::unsuitable("nothing to chart");
        assert!(pre_validate(&plan, &columns(&["a"])).is_empty());
    }
}
