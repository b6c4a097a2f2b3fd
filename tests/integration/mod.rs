//! Integration tests module.
//!
//! These tests run the engine against a real Postgres holding a minimal
//! host schema fixture.

pub mod engine_tests;
