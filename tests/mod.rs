//! Database-backed integration tests for the mirror engine.
//!
//! Each test provisions its own database through `test_utils` and returns
//! early when no Postgres server is available.

pub mod integration;
pub mod test_utils;
