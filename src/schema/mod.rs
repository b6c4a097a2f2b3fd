//! # Schema Contract
//!
//! Compares the host database's live schema against the tables, columns,
//! constraints and vector widths the engine relies on. Runs at startup and at
//! the start of every cycle, since the host can be upgraded while the mirror
//! keeps running. Every problem found is reported at once.

pub mod contract;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use sea_orm::{ConnectionTrait, DbErr, FromQueryResult, Statement};
use tracing::info;

use crate::config::SchemaExpectations;
use crate::error::{MirrorError, map_db_err};
use contract::{
    CASCADE_CHILDREN, INSERT_TABLES, REQUIRED_COLUMNS, UNIQUE_CONSTRAINTS, VECTOR_COLUMNS,
    VectorKind, inserted_columns, required_tables,
};

/// One discrepancy between the live schema and the contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaProblem {
    MissingTable(String),
    MissingColumn { table: String, column: String },
    UnsuppliedRequiredColumn { table: String, column: String },
    MissingCascade { child: String },
    MissingUniqueConstraint { table: String, columns: Vec<String> },
    VectorDimensionMismatch {
        table: String,
        column: String,
        expected: u32,
        found: String,
    },
}

impl fmt::Display for SchemaProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingTable(table) => write!(f, "missing table '{table}'"),
            Self::MissingColumn { table, column } => {
                write!(f, "missing column '{table}'.'{column}'")
            }
            Self::UnsuppliedRequiredColumn { table, column } => write!(
                f,
                "new required column '{table}'.'{column}' has no default and is not supplied on insert"
            ),
            Self::MissingCascade { child } => {
                write!(f, "missing ON DELETE CASCADE from 'asset' to '{child}'")
            }
            Self::MissingUniqueConstraint { table, columns } => write!(
                f,
                "missing unique constraint on '{table}' ({})",
                columns.join(", ")
            ),
            Self::VectorDimensionMismatch {
                table,
                column,
                expected,
                found,
            } => write!(
                f,
                "vector column '{table}'.'{column}' is {found}, expected vector({expected})"
            ),
        }
    }
}

/// Aggregated contract failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolations(pub Vec<SchemaProblem>);

impl fmt::Display for SchemaViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "host schema does not match the mirror's expectations ({} problem(s))",
            self.0.len()
        )?;
        for problem in &self.0 {
            write!(f, "\n  - {problem}")?;
        }
        Ok(())
    }
}

impl std::error::Error for SchemaViolations {}

/// What the live database currently looks like, restricted to contract tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaSnapshot {
    pub columns: BTreeMap<String, BTreeSet<String>>,
    /// NOT NULL columns with no default, identity or generation.
    pub required_without_default: BTreeMap<String, BTreeSet<String>>,
    pub cascade_children: BTreeSet<String>,
    pub unique_constraints: BTreeMap<String, Vec<BTreeSet<String>>>,
    /// `format_type` output keyed by (table, column).
    pub vector_types: BTreeMap<(String, String), String>,
}

impl SchemaSnapshot {
    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.columns
            .get(table)
            .is_some_and(|cols| cols.contains(column))
    }
}

#[derive(Debug, FromQueryResult)]
struct ColumnRow {
    table_name: String,
    column_name: String,
}

#[derive(Debug, FromQueryResult)]
struct CascadeRow {
    child_table: String,
}

#[derive(Debug, FromQueryResult)]
struct ConstraintRow {
    table_name: String,
    columns: String,
}

#[derive(Debug, FromQueryResult)]
struct VectorRow {
    table_name: String,
    column_name: String,
    data_type: String,
}

/// Reads the live schema for every contract table.
pub async fn load_snapshot<C: ConnectionTrait>(conn: &C) -> Result<SchemaSnapshot, DbErr> {
    let backend = conn.get_database_backend();
    let tables = required_tables();
    let insert_tables: Vec<String> = INSERT_TABLES.iter().map(|t| (*t).to_string()).collect();
    let mut snapshot = SchemaSnapshot::default();

    let rows = ColumnRow::find_by_statement(Statement::from_sql_and_values(
        backend,
        r#"
        SELECT table_name::text AS table_name, column_name::text AS column_name
        FROM information_schema.columns
        WHERE table_schema = 'public'
          AND table_name = ANY($1)
        "#,
        [tables.into()],
    ))
    .all(conn)
    .await?;
    for row in rows {
        snapshot
            .columns
            .entry(row.table_name)
            .or_default()
            .insert(row.column_name);
    }

    let rows = ColumnRow::find_by_statement(Statement::from_sql_and_values(
        backend,
        r#"
        SELECT table_name::text AS table_name, column_name::text AS column_name
        FROM information_schema.columns
        WHERE table_schema = 'public'
          AND table_name = ANY($1)
          AND is_nullable = 'NO'
          AND column_default IS NULL
          AND is_identity = 'NO'
          AND is_generated = 'NEVER'
        "#,
        [insert_tables.into()],
    ))
    .all(conn)
    .await?;
    for row in rows {
        snapshot
            .required_without_default
            .entry(row.table_name)
            .or_default()
            .insert(row.column_name);
    }

    let rows = CascadeRow::find_by_statement(Statement::from_string(
        backend,
        r#"
        SELECT child.relname::text AS child_table
        FROM pg_constraint con
        JOIN pg_class child ON con.conrelid = child.oid
        JOIN pg_class parent ON con.confrelid = parent.oid
        JOIN pg_namespace n ON n.oid = parent.relnamespace
        WHERE parent.relname = 'asset'
          AND n.nspname = 'public'
          AND con.contype = 'f'
          AND con.confdeltype = 'c'
        "#,
    ))
    .all(conn)
    .await?;
    snapshot.cascade_children = rows.into_iter().map(|row| row.child_table).collect();

    let constraint_tables: Vec<String> = UNIQUE_CONSTRAINTS
        .iter()
        .map(|(table, _)| (*table).to_string())
        .collect();
    let rows = ConstraintRow::find_by_statement(Statement::from_sql_and_values(
        backend,
        r#"
        SELECT cl.relname::text AS table_name,
               string_agg(a.attname::text, ',' ORDER BY a.attnum) AS columns
        FROM pg_constraint con
        JOIN pg_class cl ON con.conrelid = cl.oid
        JOIN pg_namespace n ON n.oid = cl.relnamespace
        JOIN pg_attribute a ON a.attrelid = cl.oid AND a.attnum = ANY(con.conkey)
        WHERE cl.relname = ANY($1)
          AND n.nspname = 'public'
          AND con.contype IN ('p', 'u')
        GROUP BY con.oid, cl.relname
        "#,
        [constraint_tables.into()],
    ))
    .all(conn)
    .await?;
    for row in rows {
        let columns = row.columns.split(',').map(str::to_string).collect();
        snapshot
            .unique_constraints
            .entry(row.table_name)
            .or_default()
            .push(columns);
    }

    let rows = VectorRow::find_by_statement(Statement::from_string(
        backend,
        r#"
        SELECT c.relname::text AS table_name,
               a.attname::text AS column_name,
               format_type(a.atttypid, a.atttypmod) AS data_type
        FROM pg_attribute a
        JOIN pg_class c ON c.oid = a.attrelid
        JOIN pg_namespace n ON n.oid = c.relnamespace
        WHERE n.nspname = 'public'
          AND NOT a.attisdropped
          AND a.attnum > 0
          AND (c.relname, a.attname) IN (('smart_search', 'embedding'), ('face_search', 'embedding'))
        "#,
    ))
    .all(conn)
    .await?;
    for row in rows {
        snapshot
            .vector_types
            .insert((row.table_name, row.column_name), row.data_type);
    }

    Ok(snapshot)
}

/// Checks a snapshot against the contract. Pure, so it is unit tested directly.
pub fn evaluate(snapshot: &SchemaSnapshot, expectations: &SchemaExpectations) -> Vec<SchemaProblem> {
    let mut problems = Vec::new();

    for (table, columns) in REQUIRED_COLUMNS {
        let Some(live) = snapshot.columns.get(*table) else {
            problems.push(SchemaProblem::MissingTable((*table).to_string()));
            continue;
        };
        for column in *columns {
            if !live.contains(*column) {
                problems.push(SchemaProblem::MissingColumn {
                    table: (*table).to_string(),
                    column: (*column).to_string(),
                });
            }
        }
    }

    for table in INSERT_TABLES {
        let Some(required) = snapshot.required_without_default.get(*table) else {
            continue;
        };
        let supplied = inserted_columns(table).unwrap_or_default();
        for column in required {
            if !supplied.contains(&column.as_str()) {
                problems.push(SchemaProblem::UnsuppliedRequiredColumn {
                    table: (*table).to_string(),
                    column: column.clone(),
                });
            }
        }
    }

    for child in CASCADE_CHILDREN {
        if !snapshot.cascade_children.contains(*child) {
            problems.push(SchemaProblem::MissingCascade {
                child: (*child).to_string(),
            });
        }
    }

    for (table, columns) in UNIQUE_CONSTRAINTS {
        if !snapshot.columns.contains_key(*table) {
            continue;
        }
        let wanted: BTreeSet<String> = columns.iter().map(|c| (*c).to_string()).collect();
        let present = snapshot
            .unique_constraints
            .get(*table)
            .is_some_and(|sets| sets.iter().any(|set| *set == wanted));
        if !present {
            problems.push(SchemaProblem::MissingUniqueConstraint {
                table: (*table).to_string(),
                columns: wanted.into_iter().collect(),
            });
        }
    }

    for (table, column, kind) in VECTOR_COLUMNS {
        let expected = match kind {
            VectorKind::Clip => expectations.clip_dimension,
            VectorKind::Face => expectations.face_dimension,
        };
        if expected == 0 {
            continue;
        }
        let key = ((*table).to_string(), (*column).to_string());
        let Some(found) = snapshot.vector_types.get(&key) else {
            // Absence is already reported as a missing table or column.
            continue;
        };
        if vector_dimension(found) != Some(expected) {
            problems.push(SchemaProblem::VectorDimensionMismatch {
                table: key.0,
                column: key.1,
                expected,
                found: found.clone(),
            });
        }
    }

    problems
}

/// Parses `vector(512)` style type names.
fn vector_dimension(data_type: &str) -> Option<u32> {
    let inner = data_type
        .trim()
        .strip_prefix("vector(")?
        .strip_suffix(')')?;
    inner.trim().parse().ok()
}

/// Loads and evaluates the live schema, failing with every problem found.
pub async fn validate<C: ConnectionTrait>(
    conn: &C,
    expectations: &SchemaExpectations,
) -> Result<SchemaSnapshot, MirrorError> {
    let snapshot = load_snapshot(conn)
        .await
        .map_err(|err| map_db_err("reading host schema", err))?;

    let problems = evaluate(&snapshot, expectations);
    if !problems.is_empty() {
        return Err(SchemaViolations(problems).into());
    }

    info!(
        tables = REQUIRED_COLUMNS.len(),
        columns = REQUIRED_COLUMNS
            .iter()
            .map(|(_, cols)| cols.len())
            .sum::<usize>(),
        "Schema validation passed"
    );
    Ok(snapshot)
}
