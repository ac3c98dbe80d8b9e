//! Mock implementations and test utilities for the Cadence engine
//!
//! This crate provides the testing infrastructure shared across the
//! workspace:
//! - An in-memory entity store with SQLite-equivalent semantics
//! - Fluent builders for work items and dependency edges
//! - A pre-wired service stack and seeded hierarchies

pub mod builders;
pub mod fixtures;
pub mod repository;

pub use builders::{DependencyBuilder, WorkItemBuilder};
pub use fixtures::{flow_config, seeded_hierarchy, ServiceStack};
pub use repository::InMemoryEntityStore;
