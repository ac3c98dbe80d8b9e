//! SQLite persistence for the Cadence orchestration engine.
//!
//! Implements the `flow-core` repository traits over a pooled SQLite
//! connection: WAL mode for file databases, enforced foreign keys,
//! sequential migrations and transactional batch writes.
//!
//! # Usage
//!
//! ```rust,no_run
//! use database::SqliteEntityStore;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = SqliteEntityStore::new(":memory:").await?;
//!     store.migrate().await?;
//!     Ok(())
//! }
//! ```

mod common;
mod sqlite;

pub use common::{build_filter_query, sqlx_error_to_error};
pub use sqlite::SqliteEntityStore;

// Re-export the trait surface consumers wire against.
pub use flow_core::{
    error::{OrchestratorError, Result},
    repository::{
        DependencyRepository, EntityStore, SectionRepository, TransitionLogRepository,
        WorkItemRepository,
    },
};
