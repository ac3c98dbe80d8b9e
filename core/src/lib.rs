//! Flow Core Library
//!
//! Domain models, workflow semantics and service logic for the Cadence
//! work orchestration engine. All other crates depend on the types and
//! interfaces defined here.
//!
//! # Architecture
//!
//! - [`models`] - Work items, dependencies, sections, audit records
//! - [`error`] - Error taxonomy and result handling
//! - [`flow`] - Flow configuration: statuses, roles, flows, selection
//! - [`validation`] - Field-level validation utilities
//! - [`repository`] - Persistence traits ([`repository::EntityStore`])
//! - [`graph`] - Dependency graph analysis (cycles, ordering, critical path)
//! - [`lock`] - Per-entity cooperative locks
//! - [`transition`] - Trigger resolution and prerequisite gates
//! - [`executor`] - Transition orchestration
//! - [`cascade`] - Completion propagation and unblock detection
//! - [`batch`] - Atomic multi-entity writes
//! - [`protocol`] - Typed command surface and response envelope

pub mod batch;
pub mod cascade;
pub mod error;
pub mod executor;
pub mod flow;
pub mod graph;
pub mod lock;
pub mod models;
pub mod protocol;
pub mod repository;
pub mod transition;
pub mod validation;

// Re-export the types nearly every consumer touches.
pub use batch::{BatchCoordinator, BatchOutcome, ErrorMode, RejectedItem, UpdateSpec};
pub use cascade::{CascadeEngine, CascadeEvent, CascadeOutcome};
pub use error::{OrchestratorError, Result};
pub use executor::{ExecutorOptions, NextStatusInfo, TransitionExecutor, TransitionResult};
pub use flow::{Flow, FlowConfig};
pub use lock::{Lock, LockKey, LockManager, RenewStatus};
pub use models::{
    Dependency, DependencyType, Direction, EntityKind, KindData, NewDependency, NewWorkItem,
    Priority, Role, RoleTransitionRecord, Section, TimeRange, Trigger, UpdateWorkItem, WorkItem,
    WorkItemFilter, WorkItemHeader,
};
pub use protocol::{ProtocolHandler, ToolResponse};
pub use repository::{
    DependencyRepository, EntityStore, SectionRepository, TransitionLogRepository,
    WorkItemRepository,
};
pub use validation::ItemValidator;

/// Current version of the core crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Current crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_constants() {
        assert!(!VERSION.is_empty());
        assert_eq!(CRATE_NAME, "flow-core");
    }

    #[test]
    fn test_re_exports() {
        let role = Role::Review;
        assert_eq!(format!("{role}"), "review");

        let err = OrchestratorError::AlreadyTerminal;
        assert_eq!(err.error_code(), "ALREADY_TERMINAL");
    }
}
