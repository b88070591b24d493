//! Context builder.
//!
//! Assembles the system and user prompts from a retrieval result and
//! auxiliary inputs. Sections are independent renderers ordered by
//! priority; each is truncated to its own token budget before the prompts
//! are joined.
//!
//! Token estimation contract: CJK characters count as 1/1.5 tokens, all
//! other characters as 1/4. Consumers must not assume tokenizer exactness.

pub mod db_rules;
pub mod sections;
pub mod templates;

use serde_json::{json, Value};

use crate::actors::code_vector_actor::CodeChunkHit;
use crate::actors::few_shot_actor::FewShotExample;
use crate::retrieval::RetrievalResult;
use crate::settings::DatabaseKind;
use templates::PromptTemplate;

pub const TRUNCATION_MARKER: &str = "\n... (truncated)";

/// Estimate token count for mixed CJK/ASCII text.
pub fn estimate_tokens(text: &str) -> usize {
    let cjk = text
        .chars()
        .filter(|c| ('\u{4e00}'..='\u{9fff}').contains(c))
        .count() as f64;
    let other = (text.chars().count() as f64) - cjk;
    (cjk / 1.5 + other / 4.0) as usize
}

/// Configuration for one section slot.
#[derive(Debug, Clone)]
pub struct SectionConfig {
    pub enabled: bool,
    pub priority: i32,
    pub max_tokens: Option<usize>,
}

impl Default for SectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 0,
            max_tokens: None,
        }
    }
}

impl SectionConfig {
    pub fn priority(priority: i32) -> Self {
        Self {
            priority,
            ..Default::default()
        }
    }
}

/// Result of rendering one section.
#[derive(Debug, Clone)]
pub struct SectionContent {
    pub name: String,
    pub content: String,
    pub token_count: usize,
    pub metadata: Value,
}

/// Everything a section may draw from.
#[derive(Debug, Clone, Default)]
pub struct ContextInput {
    pub question: String,
    pub retrieval_result: RetrievalResult,
    pub db_name: Option<String>,
    pub dialect: Option<DatabaseKind>,
    pub few_shot_examples: Vec<FewShotExample>,
    pub code_context: Vec<CodeChunkHit>,
}

/// Final prompts ready for the LLM.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ContextOutput {
    pub system_prompt: String,
    pub user_prompt: String,
    pub total_tokens: usize,
    pub metadata: Value,
}

/// A renderer for one kind of prompt content.
pub trait ContextSection: Send + Sync {
    fn name(&self) -> &'static str;
    fn render(&self, input: &ContextInput) -> SectionContent;
}

/// Orchestrates sections into the final prompts.
pub struct ContextBuilder {
    sections: Vec<(Box<dyn ContextSection>, SectionConfig)>,
    template: PromptTemplate,
}

impl ContextBuilder {
    pub fn new(template: PromptTemplate) -> Self {
        Self {
            sections: Vec::new(),
            template,
        }
    }

    pub fn add_section(
        mut self,
        section: Box<dyn ContextSection>,
        config: SectionConfig,
    ) -> Self {
        self.sections.push((section, config));
        self
    }

    /// Schema + join paths, the minimum useful context.
    pub fn default_sections() -> Self {
        Self::new(PromptTemplate::default())
            .add_section(
                Box::new(sections::SchemaSection::default()),
                SectionConfig::priority(0),
            )
            .add_section(
                Box::new(sections::JoinPathSection::default()),
                SectionConfig::priority(10),
            )
    }

    /// The full stack: schema, joins, few-shot, code context, dialect rules.
    pub fn full() -> Self {
        Self::default_sections()
            .add_section(
                Box::new(sections::FewShotSection::default()),
                SectionConfig::priority(20),
            )
            .add_section(
                Box::new(sections::CodeContextSection::default()),
                SectionConfig::priority(30),
            )
            .add_section(
                Box::new(sections::DbRulesSection),
                SectionConfig::priority(40),
            )
    }

    pub fn build(&self, input: &ContextInput) -> ContextOutput {
        let mut ordered: Vec<&(Box<dyn ContextSection>, SectionConfig)> =
            self.sections.iter().filter(|(_, c)| c.enabled).collect();
        ordered.sort_by_key(|(_, c)| c.priority);

        let mut rendered: Vec<SectionContent> = Vec::new();
        for (section, config) in ordered {
            let mut content = section.render(input);
            if let Some(max_tokens) = config.max_tokens {
                if content.token_count > max_tokens {
                    content = truncate_section(content, max_tokens);
                }
            }
            if !content.content.trim().is_empty() {
                rendered.push(content);
            }
        }

        let system_prompt = self.template.render_system();
        let user_prompt = self.template.render_user(&rendered, &input.question);
        let total_tokens = estimate_tokens(&system_prompt) + estimate_tokens(&user_prompt);

        ContextOutput {
            system_prompt,
            user_prompt,
            total_tokens,
            metadata: json!({
                "section_count": rendered.len(),
                "sections": rendered.iter().map(|s| s.name.clone()).collect::<Vec<_>>(),
                "tables": input.retrieval_result.tables,
            }),
        }
    }
}

fn truncate_section(content: SectionContent, max_tokens: usize) -> SectionContent {
    // Character-level truncation against the same estimate the budget uses.
    let mut kept = String::new();
    let mut estimate = 0.0f64;
    for c in content.content.chars() {
        estimate += if ('\u{4e00}'..='\u{9fff}').contains(&c) {
            1.0 / 1.5
        } else {
            0.25
        };
        if estimate as usize >= max_tokens {
            break;
        }
        kept.push(c);
    }

    let truncated = format!("{}{}", kept, TRUNCATION_MARKER);
    let token_count = estimate_tokens(&truncated);
    let mut metadata = content.metadata;
    if let Some(obj) = metadata.as_object_mut() {
        obj.insert("truncated".to_string(), json!(true));
    }

    SectionContent {
        name: content.name,
        content: truncated,
        token_count,
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actors::graph_store_actor::JoinEdge;
    use std::collections::HashMap;

    fn sample_input() -> ContextInput {
        let mut table_columns = HashMap::new();
        table_columns.insert(
            "patient".to_string(),
            vec![crate::actors::graph_store_actor::ColumnMeta {
                name: "patient_id".to_string(),
                chinese_name: Some("患者ID".to_string()),
                data_type: "integer".to_string(),
                base_type: None,
                is_pk: true,
                is_fk: false,
                is_nullable: false,
                is_indexed: true,
                is_unique: true,
                description: Some("primary identifier".to_string()),
                ordinal_position: 0,
            }],
        );

        ContextInput {
            question: "list patients".to_string(),
            retrieval_result: RetrievalResult {
                tables: vec!["patient".to_string()],
                table_columns,
                join_paths: vec![JoinEdge {
                    fk_table: "visit".to_string(),
                    fk_column: "patient_id".to_string(),
                    pk_table: "patient".to_string(),
                    pk_column: "patient_id".to_string(),
                }],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_estimate_tokens_mixed_text() {
        // 4 ASCII chars ~ 1 token
        assert_eq!(estimate_tokens("abcd"), 1);
        // 3 CJK chars ~ 2 tokens
        assert_eq!(estimate_tokens("患者表"), 2);
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_build_orders_sections_and_ends_with_instruction() {
        let builder = ContextBuilder::default_sections();
        let output = builder.build(&sample_input());

        let schema_pos = output.user_prompt.find("Relevant tables").unwrap();
        let join_pos = output.user_prompt.find("Join paths").unwrap();
        assert!(schema_pos < join_pos);
        assert!(output.user_prompt.trim_end().ends_with("Generate the SQL query:"));
        assert!(output.total_tokens > 0);
    }

    #[test]
    fn test_section_truncation_appends_marker() {
        let long_content = "x".repeat(4000);
        let content = SectionContent {
            name: "schema".to_string(),
            content: long_content,
            token_count: 1000,
            metadata: json!({}),
        };

        let truncated = truncate_section(content, 100);
        assert!(truncated.content.ends_with(TRUNCATION_MARKER));
        assert!(truncated.token_count <= 110);
        assert_eq!(truncated.metadata["truncated"], true);
    }
}
