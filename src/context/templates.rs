//! Prompt templates for the context builder.

use super::SectionContent;

pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a SQL expert translating natural-language questions into SQL.

Rules:
1. Use ONLY the tables and columns provided below; never assume others exist.
2. If a required table or column is missing, answer `-- missing table: <name>` instead of guessing.
3. Use standard SQL and the provided foreign-key relationships for joins.
4. Use LIKE for fuzzy text matching.
5. Return the SQL statement only, without explanations.
6. Never emit parameter placeholders such as %s, :name or ?; produce directly executable SQL.
7. When the question carries concrete values (ids, dates), inline them; otherwise do not invent filters."#;

pub const DEFAULT_USER_TEMPLATE: &str = "{sections}\n\n---\n\n**Question**: {question}\n\nGenerate the SQL query:";

/// Template pair rendering the final prompts.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    pub system_template: String,
    pub user_template: String,
    pub section_separator: String,
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self {
            system_template: DEFAULT_SYSTEM_PROMPT.to_string(),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
            section_separator: "\n\n".to_string(),
        }
    }
}

impl PromptTemplate {
    pub fn render_system(&self) -> String {
        self.system_template.clone()
    }

    pub fn render_user(&self, sections: &[SectionContent], question: &str) -> String {
        let section_text = sections
            .iter()
            .filter(|s| !s.content.trim().is_empty())
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join(&self.section_separator);

        self.user_template
            .replace("{sections}", &section_text)
            .replace("{question}", question)
    }
}
