//! Built-in tools bound to the SQL agent.

pub mod search_objects;
pub mod validate_sql;

use serde_json::json;

use crate::protocol::ToolSpec;

pub use search_objects::SearchObjectsExecutor;
pub use validate_sql::ValidateSqlExecutor;

/// Tool specifications offered to the model in agent mode.
pub fn agent_tool_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "validate_sql".to_string(),
            description: "Validate a SQL statement by executing it with LIMIT 1. \
                          Returns SUCCESS if the SQL is valid and executable, or ERROR \
                          with details. Always validate your SQL before returning it."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "sql": { "type": "string", "description": "The SQL statement to validate" }
                },
                "required": ["sql"]
            }),
        },
        ToolSpec {
            name: "search_objects".to_string(),
            description: "Search live database objects by pattern. Use when a column or \
                          table name in your SQL turned out not to exist."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "object_type": {
                        "type": "string",
                        "enum": ["table", "column", "index"],
                        "description": "Kind of object to search"
                    },
                    "pattern": {
                        "type": "string",
                        "description": "SQL LIKE pattern, e.g. 'user%' or '%date%'"
                    },
                    "detail_level": {
                        "type": "string",
                        "enum": ["names", "summary", "full"],
                        "description": "How much detail to return"
                    }
                },
                "required": ["object_type", "pattern"]
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_specs_shape() {
        let specs = agent_tool_specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].name, "validate_sql");
        assert_eq!(specs[1].name, "search_objects");
        assert_eq!(specs[0].parameters["required"][0], "sql");
    }
}
