//! Dialect-specific SQL authoring rules injected into generation prompts.

use crate::settings::DatabaseKind;

/// Rules for the given dialect, empty when the target is unknown.
pub fn db_specific_rules(kind: Option<DatabaseKind>) -> &'static str {
    match kind {
        Some(DatabaseKind::Postgresql) => POSTGRESQL_RULES,
        Some(DatabaseKind::Mysql) => MYSQL_RULES,
        Some(DatabaseKind::Oracle) => ORACLE_RULES,
        Some(DatabaseKind::Sqlserver) => SQLSERVER_RULES,
        Some(DatabaseKind::Sqlite) => SQLITE_RULES,
        None => "",
    }
}

const POSTGRESQL_RULES: &str = r#"### PostgreSQL rules
1. Date subtraction yields an INTERVAL; never compare it to an integer.
   - Wrong: `date1 - date2 > 7`
   - Right: `date1 - date2 > INTERVAL '7 days'` or `EXTRACT(DAY FROM date1 - date2) > 7`
2. String concatenation: `||` or `CONCAT()`.
3. Native BOOLEAN with TRUE/FALSE.
4. Pagination: `LIMIT n OFFSET m`.
5. Identifiers fold to lowercase; double-quote `"Name"` to preserve case.
6. JSON access: `->` (object) and `->>` (text)."#;

const MYSQL_RULES: &str = r#"### MySQL rules
1. Day difference: `DATEDIFF(date1, date2) > 7`; raw date subtraction is wrong.
2. String concatenation: `CONCAT()` (`||` is OR by default).
3. Booleans are TINYINT(1): 0/1.
4. Pagination: `LIMIT m, n` or `LIMIT n OFFSET m`.
5. Quote identifiers with backticks `` `name` ``.
6. GROUP BY must list every non-aggregated column."#;

const ORACLE_RULES: &str = r#"### Oracle rules
1. Date subtraction returns days as a number: `date1 - date2 > 7` is valid.
2. String concatenation: `||`.
3. Empty string is NULL.
4. Pagination: `FETCH FIRST n ROWS ONLY` (12c+) or `WHERE ROWNUM <= n`.
5. SELECT requires FROM; use `FROM DUAL` for scalar queries.
6. Quote identifiers with double quotes to preserve case."#;

const SQLSERVER_RULES: &str = r#"### SQL Server rules
1. Day difference: `DATEDIFF(day, date1, date2) > 7`.
2. String concatenation: `+` or `CONCAT()`.
3. Row limiting: `SELECT TOP n ...` or `OFFSET m ROWS FETCH NEXT n ROWS ONLY`.
4. Quote identifiers with brackets `[Name]`.
5. Booleans are BIT (0/1)."#;

const SQLITE_RULES: &str = r#"### SQLite rules
1. Date math via functions: `julianday(date1) - julianday(date2) > 7`.
2. String concatenation: `||`.
3. Pagination: `LIMIT n OFFSET m`.
4. Booleans are integers 0/1."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rules_cover_every_dialect() {
        for kind in [
            DatabaseKind::Postgresql,
            DatabaseKind::Mysql,
            DatabaseKind::Oracle,
            DatabaseKind::Sqlserver,
            DatabaseKind::Sqlite,
        ] {
            assert!(!db_specific_rules(Some(kind)).is_empty());
        }
        assert!(db_specific_rules(None).is_empty());
    }

    #[test]
    fn test_dialect_limit_guidance() {
        assert!(db_specific_rules(Some(DatabaseKind::Sqlserver)).contains("TOP n"));
        assert!(db_specific_rules(Some(DatabaseKind::Oracle)).contains("FETCH FIRST"));
        assert!(db_specific_rules(Some(DatabaseKind::Mysql)).contains("DATEDIFF"));
        assert!(db_specific_rules(Some(DatabaseKind::Postgresql)).contains("INTERVAL"));
    }
}
