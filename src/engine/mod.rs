//! # Reconciliation Engine
//!
//! Phase implementations and the orchestrator that runs them in order. All
//! SQL against host tables lives here; host columns are camelCase and always
//! quoted.

pub mod albums;
pub mod assets;
pub mod cleanup;
pub mod duplicates;
pub mod faces;
pub mod maintenance;
pub mod orchestrator;
pub mod persons;
pub mod preflight;

use sea_orm::{ConnectionTrait, Statement, Value};

pub use orchestrator::{CycleSummary, MirrorEngine};

/// Builds a Postgres statement for `conn`'s backend.
pub(crate) fn statement<C, I>(conn: &C, sql: &str, values: I) -> Statement
where
    C: ConnectionTrait,
    I: IntoIterator<Item = Value>,
{
    Statement::from_sql_and_values(conn.get_database_backend(), sql, values)
}

/// Builds a parameterless statement.
pub(crate) fn plain<C: ConnectionTrait>(conn: &C, sql: &str) -> Statement {
    Statement::from_string(conn.get_database_backend(), sql)
}

/// Double-quotes a host column name.
pub(crate) fn quoted(column: &str) -> String {
    format!("\"{column}\"")
}
