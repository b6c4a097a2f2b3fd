//! # Immich Mirror Library
//!
//! One-way mirror engine that replicates media records, derived files, faces
//! and persons from a source user's namespace into target namespaces of the
//! same host database.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod file_mirror;
pub mod host_api;
pub mod models;
pub mod repositories;
pub mod scheduler;
pub mod schema;
pub mod server;
pub mod telemetry;
pub use migration;
