//! Embedded medical demo schema.
//!
//! Seeds a small hospital schema (patients, visits, prescriptions, fees)
//! into the embedded SQLite database and the schema metadata graph, so the
//! engine can answer questions out of the box and the integration tests
//! have a realistic fixture.

use rusqlite::Connection;
use std::path::Path;

use crate::actors::graph_store_actor::{ColumnMeta, TableMeta, TableSeed};

pub const DEMO_DB_NAME: &str = "medical";

pub const MEDICAL_DEMO_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS patient (
    patient_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    gender TEXT,
    birth_date TEXT,
    phone TEXT
);
CREATE TABLE IF NOT EXISTS department (
    department_id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    floor INTEGER
);
CREATE TABLE IF NOT EXISTS employee (
    employee_id INTEGER PRIMARY KEY,
    department_id INTEGER REFERENCES department(department_id),
    name TEXT NOT NULL,
    role TEXT
);
CREATE TABLE IF NOT EXISTS visit (
    visit_id INTEGER PRIMARY KEY,
    patient_id INTEGER NOT NULL REFERENCES patient(patient_id),
    department_id INTEGER REFERENCES department(department_id),
    employee_id INTEGER REFERENCES employee(employee_id),
    visit_date TEXT NOT NULL,
    create_time TEXT NOT NULL,
    diagnosis TEXT
);
CREATE TABLE IF NOT EXISTS prescription (
    prescription_id INTEGER PRIMARY KEY,
    visit_id INTEGER NOT NULL REFERENCES visit(visit_id),
    issued_at TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS prescription_detail (
    detail_id INTEGER PRIMARY KEY,
    prescription_id INTEGER NOT NULL REFERENCES prescription(prescription_id),
    drug_name TEXT NOT NULL,
    quantity INTEGER NOT NULL,
    unit_price REAL NOT NULL
);
CREATE TABLE IF NOT EXISTS fee_record (
    fee_id INTEGER PRIMARY KEY,
    visit_id INTEGER NOT NULL REFERENCES visit(visit_id),
    amount REAL NOT NULL,
    fee_type TEXT,
    paid_at TEXT
);

INSERT OR IGNORE INTO patient VALUES
    (1, 'Alice Chen', 'F', '1988-04-12', '555-0101'),
    (2, 'Bob Liu', 'M', '1975-11-02', '555-0102'),
    (3, 'Carol Wang', 'F', '1992-07-30', '555-0103');
INSERT OR IGNORE INTO department VALUES
    (1, 'Cardiology', 3),
    (2, 'Pediatrics', 2);
INSERT OR IGNORE INTO employee VALUES
    (1, 1, 'Dr. Zhang', 'physician'),
    (2, 2, 'Dr. Zhou', 'physician');
INSERT OR IGNORE INTO visit VALUES
    (1, 1, 1, 1, '2025-06-01', '2025-05-30 09:12:00', 'hypertension'),
    (2, 2, 1, 1, '2025-06-15', '2025-06-14 16:40:00', 'arrhythmia'),
    (3, 3, 2, 2, '2025-07-02', '2025-07-02 08:05:00', 'flu');
INSERT OR IGNORE INTO prescription VALUES
    (1, 1, '2025-06-01'),
    (2, 3, '2025-07-02');
INSERT OR IGNORE INTO prescription_detail VALUES
    (1, 1, 'amlodipine', 30, 0.45),
    (2, 2, 'oseltamivir', 10, 2.10);
INSERT OR IGNORE INTO fee_record VALUES
    (1, 1, 86.50, 'outpatient', '2025-06-01'),
    (2, 2, 120.00, 'outpatient', '2025-06-15'),
    (3, 3, 45.30, 'outpatient', '2025-07-02');
"#;

/// Create (or refresh) the demo SQLite database. Returns the table count.
pub fn create_demo_database(path: &Path) -> Result<usize, String> {
    if let Some(parent) = path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let conn =
        Connection::open(path).map_err(|e| format!("Failed to open demo database: {}", e))?;
    conn.execute_batch(MEDICAL_DEMO_DDL)
        .map_err(|e| format!("Failed to seed demo database: {}", e))?;

    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
            [],
            |row| row.get(0),
        )
        .map_err(|e| e.to_string())?;

    println!("[DemoSchema] Demo database ready at {:?} ({} tables)", path, count);
    Ok(count as usize)
}

fn col(
    name: &str,
    data_type: &str,
    position: i64,
    is_pk: bool,
    is_fk: bool,
    description: &str,
) -> ColumnMeta {
    ColumnMeta {
        name: name.to_string(),
        chinese_name: None,
        data_type: data_type.to_string(),
        base_type: Some(data_type.split('(').next().unwrap_or(data_type).to_string()),
        is_pk,
        is_fk,
        is_nullable: !is_pk,
        is_indexed: is_pk || is_fk,
        is_unique: is_pk,
        description: if description.is_empty() {
            None
        } else {
            Some(description.to_string())
        },
        ordinal_position: position,
    }
}

fn table(
    name: &str,
    description: &str,
    columns: Vec<ColumnMeta>,
    fks: Vec<(&str, &str, &str)>,
) -> TableSeed {
    TableSeed {
        meta: TableMeta {
            name: name.to_string(),
            db_name: DEMO_DB_NAME.to_string(),
            chinese_name: None,
            description: Some(description.to_string()),
            domain: Some("hospital".to_string()),
        },
        columns,
        foreign_keys: fks
            .into_iter()
            .map(|(a, b, c)| (a.to_string(), b.to_string(), c.to_string()))
            .collect(),
    }
}

/// Schema metadata seeds mirroring the demo database.
pub fn medical_schema_seeds() -> Vec<TableSeed> {
    vec![
        table(
            "patient",
            "Patient master records",
            vec![
                col("patient_id", "integer", 0, true, false, "patient identifier"),
                col("name", "text", 1, false, false, "patient name"),
                col("gender", "text", 2, false, false, "gender code"),
                col("birth_date", "text", 3, false, false, "date of birth"),
                col("phone", "text", 4, false, false, ""),
            ],
            vec![],
        ),
        table(
            "department",
            "Hospital departments",
            vec![
                col("department_id", "integer", 0, true, false, ""),
                col("name", "text", 1, false, false, "department name"),
                col("floor", "integer", 2, false, false, ""),
            ],
            vec![],
        ),
        table(
            "employee",
            "Hospital staff",
            vec![
                col("employee_id", "integer", 0, true, false, ""),
                col("department_id", "integer", 1, false, true, ""),
                col("name", "text", 2, false, false, "employee name"),
                col("role", "text", 3, false, false, ""),
            ],
            vec![("department_id", "department", "department_id")],
        ),
        table(
            "visit",
            "Outpatient visits",
            vec![
                col("visit_id", "integer", 0, true, false, ""),
                col("patient_id", "integer", 1, false, true, "visiting patient"),
                col("department_id", "integer", 2, false, true, ""),
                col("employee_id", "integer", 3, false, true, "attending physician"),
                col("visit_date", "text", 4, false, false, "date of the visit"),
                col("create_time", "text", 5, false, false, "record creation time"),
                col("diagnosis", "text", 6, false, false, ""),
            ],
            vec![
                ("patient_id", "patient", "patient_id"),
                ("department_id", "department", "department_id"),
                ("employee_id", "employee", "employee_id"),
            ],
        ),
        table(
            "prescription",
            "Prescriptions issued during visits",
            vec![
                col("prescription_id", "integer", 0, true, false, ""),
                col("visit_id", "integer", 1, false, true, ""),
                col("issued_at", "text", 2, false, false, ""),
            ],
            vec![("visit_id", "visit", "visit_id")],
        ),
        table(
            "prescription_detail",
            "Drug line items of a prescription",
            vec![
                col("detail_id", "integer", 0, true, false, ""),
                col("prescription_id", "integer", 1, false, true, ""),
                col("drug_name", "text", 2, false, false, "drug name"),
                col("quantity", "integer", 3, false, false, ""),
                col("unit_price", "real", 4, false, false, ""),
            ],
            vec![("prescription_id", "prescription", "prescription_id")],
        ),
        table(
            "fee_record",
            "Fees charged per visit",
            vec![
                col("fee_id", "integer", 0, true, false, ""),
                col("visit_id", "integer", 1, false, true, ""),
                col("amount", "real", 2, false, false, "amount charged"),
                col("fee_type", "text", 3, false, false, ""),
                col("paid_at", "text", 4, false, false, ""),
            ],
            vec![("visit_id", "visit", "visit_id")],
        ),
    ]
}

/// Text embedded for a table record: name, description, and core columns.
pub fn table_embedding_text(seed: &TableSeed) -> String {
    let columns: Vec<&str> = seed
        .columns
        .iter()
        .take(10)
        .map(|c| c.name.as_str())
        .collect();
    format!(
        "{} {} columns: {}",
        seed.meta.name,
        seed.meta.description.as_deref().unwrap_or(""),
        columns.join(", ")
    )
}

/// Text embedded for one column record.
pub fn column_embedding_text(table_name: &str, column: &ColumnMeta) -> String {
    format!(
        "{}.{} {} {}",
        table_name,
        column.name,
        column.data_type,
        column.description.as_deref().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeds_reference_existing_tables() {
        let seeds = medical_schema_seeds();
        let names: Vec<&str> = seeds.iter().map(|s| s.meta.name.as_str()).collect();

        for seed in &seeds {
            for (_, to_table, _) in &seed.foreign_keys {
                assert!(
                    names.contains(&to_table.as_str()),
                    "FK target {} missing",
                    to_table
                );
            }
        }
    }

    #[test]
    fn test_visit_has_two_time_columns() {
        // The clarification scenario depends on visit carrying both a
        // business date and a record-creation time.
        let seeds = medical_schema_seeds();
        let visit = seeds.iter().find(|s| s.meta.name == "visit").unwrap();
        let names: Vec<&str> = visit.columns.iter().map(|c| c.name.as_str()).collect();
        assert!(names.contains(&"visit_date"));
        assert!(names.contains(&"create_time"));
    }

    #[test]
    fn test_demo_database_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("medical.db");
        let tables = create_demo_database(&path).unwrap();
        assert_eq!(tables, 7);

        let conn = Connection::open(&path).unwrap();
        let patients: i64 = conn
            .query_row("SELECT COUNT(*) FROM patient", [], |r| r.get(0))
            .unwrap();
        assert_eq!(patients, 3);

        // Idempotent re-seed.
        create_demo_database(&path).unwrap();
        let patients_again: i64 = conn
            .query_row("SELECT COUNT(*) FROM patient", [], |r| r.get(0))
            .unwrap();
        assert_eq!(patients_again, 3);
    }

    #[test]
    fn test_embedding_texts() {
        let seeds = medical_schema_seeds();
        let patient = &seeds[0];
        let text = table_embedding_text(patient);
        assert!(text.contains("patient"));
        assert!(text.contains("patient_id"));

        let col_text = column_embedding_text("patient", &patient.columns[1]);
        assert!(col_text.contains("patient.name"));
    }
}
