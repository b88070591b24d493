//! Context sections: schema, join paths, few-shot examples, code context,
//! and dialect rules.

use serde_json::json;
use std::collections::HashSet;

use super::{db_rules, estimate_tokens, ContextInput, ContextSection, SectionContent};
use crate::actors::graph_store_actor::ColumnMeta;

/// Output style for the schema section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaFormat {
    /// One bullet line per column (token-efficient).
    List,
    /// Markdown table per table (more readable).
    Table,
}

/// Renders the retrieved table structures.
pub struct SchemaSection {
    pub format: SchemaFormat,
    pub include_descriptions: bool,
    pub include_constraints: bool,
    pub max_columns_per_table: usize,
    pub highlight_semantic_columns: bool,
}

impl Default for SchemaSection {
    fn default() -> Self {
        Self {
            format: SchemaFormat::List,
            include_descriptions: true,
            include_constraints: true,
            max_columns_per_table: 50,
            highlight_semantic_columns: true,
        }
    }
}

impl SchemaSection {
    fn constraint_tags(col: &ColumnMeta) -> Vec<&'static str> {
        let mut tags = Vec::new();
        if col.is_pk {
            tags.push("PK");
        }
        if col.is_fk {
            tags.push("FK");
        }
        if col.is_unique && !col.is_pk {
            tags.push("UQ");
        }
        if col.is_indexed && !col.is_pk {
            tags.push("IDX");
        }
        tags
    }

    fn render_list(
        &self,
        table: &str,
        columns: &[ColumnMeta],
        semantic: &HashSet<String>,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        for col in columns {
            let mut parts = Vec::new();
            let qualified = format!("{}.{}", table, col.name);

            if self.highlight_semantic_columns && semantic.contains(&qualified) {
                parts.push(format!("**{}**", col.name));
            } else {
                parts.push(col.name.clone());
            }

            parts.push(format!(": {}", col.data_type));

            if self.include_constraints {
                let tags = Self::constraint_tags(col);
                if !tags.is_empty() {
                    parts.push(format!(" ({})", tags.join(", ")));
                }
            }

            if self.include_descriptions {
                let description = col
                    .chinese_name
                    .clone()
                    .filter(|s| !s.is_empty())
                    .or_else(|| col.description.clone().filter(|s| !s.is_empty()));
                if let Some(text) = description {
                    parts.push(format!(" - {}", text));
                }
            }

            lines.push(format!("- {}", parts.concat()));
        }
        lines
    }

    fn render_table(
        &self,
        table: &str,
        columns: &[ColumnMeta],
        semantic: &HashSet<String>,
    ) -> Vec<String> {
        let mut lines = vec![
            "| column | type | description | constraints |".to_string(),
            "|--------|------|-------------|-------------|".to_string(),
        ];
        for col in columns {
            let qualified = format!("{}.{}", table, col.name);
            let name = if self.highlight_semantic_columns && semantic.contains(&qualified) {
                format!("**{}**", col.name)
            } else {
                col.name.clone()
            };
            let description = col
                .chinese_name
                .clone()
                .or_else(|| col.description.clone())
                .unwrap_or_else(|| "-".to_string());
            let tags = Self::constraint_tags(col);
            lines.push(format!(
                "| {} | {} | {} | {} |",
                name,
                col.data_type,
                description,
                if tags.is_empty() {
                    "-".to_string()
                } else {
                    tags.join(", ")
                }
            ));
        }
        lines
    }
}

impl ContextSection for SchemaSection {
    fn name(&self) -> &'static str {
        "schema"
    }

    fn render(&self, input: &ContextInput) -> SectionContent {
        let result = &input.retrieval_result;
        if result.tables.is_empty() {
            return SectionContent {
                name: self.name().to_string(),
                content: String::new(),
                token_count: 0,
                metadata: json!({ "reason": "no tables" }),
            };
        }

        let semantic: HashSet<String> = result
            .semantic_columns
            .iter()
            .map(|c| format!("{}.{}", c.table_name, c.column_name))
            .collect();

        let mut lines = vec!["## Relevant tables".to_string(), String::new()];

        for table in &result.tables {
            let chinese = result
                .table_metadata
                .get(table)
                .and_then(|m| m.chinese_name.clone())
                .filter(|s| !s.is_empty());
            match chinese {
                Some(cn) => lines.push(format!("### {} ({})", table, cn)),
                None => lines.push(format!("### {}", table)),
            }

            let columns = result.table_columns.get(table);
            match columns {
                Some(columns) if !columns.is_empty() => {
                    let display = &columns[..columns.len().min(self.max_columns_per_table)];
                    let rendered = match self.format {
                        SchemaFormat::List => self.render_list(table, display, &semantic),
                        SchemaFormat::Table => self.render_table(table, display, &semantic),
                    };
                    lines.extend(rendered);
                    if columns.len() > self.max_columns_per_table {
                        lines.push(format!(
                            "... {} more columns omitted",
                            columns.len() - self.max_columns_per_table
                        ));
                    }
                }
                _ => lines.push("(no column information)".to_string()),
            }
            lines.push(String::new());
        }

        let content = lines.join("\n");
        let token_count = estimate_tokens(&content);
        SectionContent {
            name: self.name().to_string(),
            content,
            token_count,
            metadata: json!({
                "tables": result.tables.len(),
                "total_columns": result
                    .table_columns
                    .values()
                    .map(|c| c.len())
                    .sum::<usize>(),
            }),
        }
    }
}

/// Renders join edges, one line per FK hop.
pub struct JoinPathSection {
    pub include_instructions: bool,
}

impl Default for JoinPathSection {
    fn default() -> Self {
        Self {
            include_instructions: true,
        }
    }
}

impl ContextSection for JoinPathSection {
    fn name(&self) -> &'static str {
        "join_paths"
    }

    fn render(&self, input: &ContextInput) -> SectionContent {
        let paths = &input.retrieval_result.join_paths;
        if paths.is_empty() {
            return SectionContent {
                name: self.name().to_string(),
                content: String::new(),
                token_count: 0,
                metadata: json!({ "reason": "no join paths" }),
            };
        }

        let mut lines = vec!["## Join paths".to_string()];
        if self.include_instructions {
            lines.push("Join tables along these foreign-key edges:".to_string());
        }
        for edge in paths {
            lines.push(format!(
                "- {}.{} = {}.{}",
                edge.fk_table, edge.fk_column, edge.pk_table, edge.pk_column
            ));
        }

        let content = lines.join("\n");
        let token_count = estimate_tokens(&content);
        SectionContent {
            name: self.name().to_string(),
            content,
            token_count,
            metadata: json!({ "edges": paths.len() }),
        }
    }
}

/// Renders similar past question/SQL pairs.
pub struct FewShotSection {
    pub max_examples: usize,
}

impl Default for FewShotSection {
    fn default() -> Self {
        Self { max_examples: 3 }
    }
}

impl ContextSection for FewShotSection {
    fn name(&self) -> &'static str {
        "few_shot"
    }

    fn render(&self, input: &ContextInput) -> SectionContent {
        if input.few_shot_examples.is_empty() {
            return SectionContent {
                name: self.name().to_string(),
                content: String::new(),
                token_count: 0,
                metadata: json!({ "reason": "no examples" }),
            };
        }

        let mut lines = vec!["## Similar validated examples".to_string()];
        for (i, example) in input
            .few_shot_examples
            .iter()
            .take(self.max_examples)
            .enumerate()
        {
            lines.push(format!("### Example {}", i + 1));
            lines.push(format!("Question: {}", example.question));
            lines.push("```sql".to_string());
            lines.push(example.sql.clone());
            lines.push("```".to_string());
            if !example.explanation.is_empty() {
                lines.push(format!("Notes: {}", example.explanation));
            }
        }

        let content = lines.join("\n");
        let token_count = estimate_tokens(&content);
        SectionContent {
            name: self.name().to_string(),
            content,
            token_count,
            metadata: json!({
                "examples": input.few_shot_examples.len().min(self.max_examples)
            }),
        }
    }
}

/// Renders retrieved code snippets as labeled fences.
pub struct CodeContextSection {
    pub max_snippets: usize,
}

impl Default for CodeContextSection {
    fn default() -> Self {
        Self { max_snippets: 3 }
    }
}

impl ContextSection for CodeContextSection {
    fn name(&self) -> &'static str {
        "code_context"
    }

    fn render(&self, input: &ContextInput) -> SectionContent {
        if input.code_context.is_empty() {
            return SectionContent {
                name: self.name().to_string(),
                content: String::new(),
                token_count: 0,
                metadata: json!({ "reason": "no code context" }),
            };
        }

        let mut lines = vec!["## Related business logic".to_string()];
        for chunk in input.code_context.iter().take(self.max_snippets) {
            lines.push(format!("### {}", chunk.file_path));
            lines.push(format!("```{}", chunk.language));
            lines.push(chunk.content.clone());
            lines.push("```".to_string());
        }

        let content = lines.join("\n");
        let token_count = estimate_tokens(&content);
        SectionContent {
            name: self.name().to_string(),
            content,
            token_count,
            metadata: json!({
                "snippets": input.code_context.len().min(self.max_snippets)
            }),
        }
    }
}

/// Renders dialect-specific authoring rules.
pub struct DbRulesSection;

impl ContextSection for DbRulesSection {
    fn name(&self) -> &'static str {
        "db_specific_rules"
    }

    fn render(&self, input: &ContextInput) -> SectionContent {
        let rules = db_rules::db_specific_rules(input.dialect);
        let token_count = estimate_tokens(rules);
        SectionContent {
            name: self.name().to_string(),
            content: rules.to_string(),
            token_count,
            metadata: json!({
                "dialect": input.dialect.map(|d| d.dialect_name()),
            }),
        }
    }
}
