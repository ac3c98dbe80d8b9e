use crate::models::{Blocker, DependencyType, EntityKind};
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for orchestration operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Error taxonomy for the workflow orchestration engine.
///
/// Every failure mode a caller can observe maps to one of these variants.
/// `error_code()` yields the machine-readable code used in the response
/// envelope; the `Display` rendering is the human-readable message.
///
/// # Examples
///
/// ```rust
/// use flow_core::error::OrchestratorError;
/// use flow_core::models::EntityKind;
/// use uuid::Uuid;
///
/// let err = OrchestratorError::not_found(EntityKind::Task, Uuid::nil());
/// assert!(err.is_not_found());
/// assert_eq!(err.error_code(), "RESOURCE_NOT_FOUND");
/// ```
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OrchestratorError {
    /// Malformed input: enum out of range, malformed UUID, missing required
    /// field, size bounds violated.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entity or dependency not found.
    #[error("{0}")]
    NotFound(String),

    /// Update rejected because the supplied version is stale.
    #[error("Version mismatch: expected version {expected}, current version is {actual}")]
    VersionMismatch { expected: i64, actual: i64 },

    /// Repeated version mismatch after bounded retry.
    #[error("Update contended after {0} attempts")]
    Contended(u32),

    /// Another session holds the entity lock.
    #[error("Entity is locked by session '{owner}' until {expires_at}")]
    LockConflict {
        owner: String,
        expires_at: DateTime<Utc>,
    },

    /// A dependency batch would create a cycle; `path` walks the offending
    /// loop in blocks-direction order.
    #[error("Dependency cycle detected: {path:?}")]
    CycleDetected { path: Vec<Uuid> },

    /// The edge already exists.
    #[error("Duplicate {dep_type} dependency from {from} to {to}")]
    DuplicateEdge {
        from: Uuid,
        to: Uuid,
        dep_type: DependencyType,
    },

    /// Task cannot move forward due to unsatisfied incoming blocks.
    #[error("Task is blocked by {} unresolved dependencies", .blockers.len())]
    BlockedBy { blockers: Vec<Blocker> },

    /// Terminal transition attempted without a summary.
    #[error("A non-empty summary is required before completion")]
    MissingSummary,

    /// Verification-gated completion attempted without a prior review.
    #[error("Verification is required before completion; no review stage has been recorded")]
    VerificationRequired,

    /// Forward trigger on an item already in a terminal status.
    #[error("Item is already in a terminal status")]
    AlreadyTerminal,

    /// Parent completion blocked by non-terminal children.
    #[error("Cannot complete: {} children are not yet terminal", .pending.len())]
    IncompleteChildren { pending: Vec<Uuid> },

    /// Delete without cascade on an item that still has descendants or
    /// dependency edges.
    #[error("Item has children or dependencies; delete them first or pass force")]
    HasChildren,

    /// Flow configuration malformed or referencing unknown statuses.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Storage-layer failure surfaced with the originating operation intact.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl OrchestratorError {
    /// Create a not found error for a work item.
    pub fn not_found(kind: EntityKind, id: Uuid) -> Self {
        Self::NotFound(format!("{kind} {id} not found"))
    }

    /// Create a not found error for a dependency edge.
    pub fn dependency_not_found(id: Uuid) -> Self {
        Self::NotFound(format!("dependency {id} not found"))
    }

    /// Create a validation error for an empty required field.
    pub fn empty_field(field: &str) -> Self {
        Self::Validation(format!("Field '{field}' cannot be empty"))
    }

    /// Create a validation error for a value outside its allowed range.
    pub fn out_of_range(field: &str, detail: &str) -> Self {
        Self::Validation(format!("Field '{field}' is out of range: {detail}"))
    }

    /// Check whether this error indicates a missing resource.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrchestratorError::NotFound(_))
    }

    /// Check whether this error indicates invalid input.
    pub fn is_validation(&self) -> bool {
        matches!(self, OrchestratorError::Validation(_))
    }

    /// Check whether this error is a concurrency conflict that a caller may
    /// resolve by re-reading and retrying.
    pub fn is_retryable_conflict(&self) -> bool {
        matches!(
            self,
            OrchestratorError::VersionMismatch { .. }
                | OrchestratorError::Contended(_)
                | OrchestratorError::LockConflict { .. }
        )
    }

    /// Machine-readable code for the response envelope. The set is closed;
    /// every variant maps to exactly one code.
    pub fn error_code(&self) -> &'static str {
        match self {
            OrchestratorError::Validation(_) => "VALIDATION_ERROR",
            OrchestratorError::NotFound(_) => "RESOURCE_NOT_FOUND",
            OrchestratorError::VersionMismatch { .. } => "VERSION_MISMATCH",
            OrchestratorError::Contended(_) => "CONTENDED",
            OrchestratorError::LockConflict { .. } => "LOCK_CONFLICT",
            OrchestratorError::CycleDetected { .. } => "CYCLE_DETECTED",
            OrchestratorError::DuplicateEdge { .. } => "DUPLICATE_EDGE",
            OrchestratorError::BlockedBy { .. } => "BLOCKED_BY",
            OrchestratorError::MissingSummary => "MISSING_SUMMARY",
            OrchestratorError::VerificationRequired => "VERIFICATION_REQUIRED",
            OrchestratorError::AlreadyTerminal => "ALREADY_TERMINAL",
            OrchestratorError::IncompleteChildren { .. } => "INCOMPLETE_CHILDREN",
            OrchestratorError::HasChildren => "HAS_CHILDREN",
            OrchestratorError::Configuration(_) => "CONFIGURATION_ERROR",
            OrchestratorError::Storage(_) => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;

    #[test]
    fn error_creation_and_codes() {
        let id = Uuid::new_v4();
        let err = OrchestratorError::not_found(EntityKind::Task, id);
        assert!(err.is_not_found());
        assert_eq!(err.error_code(), "RESOURCE_NOT_FOUND");
        assert!(format!("{err}").contains(&id.to_string()));

        let err = OrchestratorError::empty_field("title");
        assert!(err.is_validation());
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let err = OrchestratorError::VersionMismatch {
            expected: 5,
            actual: 6,
        };
        assert!(err.is_retryable_conflict());
        assert_eq!(err.error_code(), "VERSION_MISMATCH");
    }

    #[test]
    fn blocked_by_display_counts_blockers() {
        let err = OrchestratorError::BlockedBy {
            blockers: vec![
                Blocker {
                    task_id: Uuid::new_v4(),
                    role: Role::Queue,
                },
                Blocker {
                    task_id: Uuid::new_v4(),
                    role: Role::Work,
                },
            ],
        };
        assert_eq!(format!("{err}"), "Task is blocked by 2 unresolved dependencies");
        assert_eq!(err.error_code(), "BLOCKED_BY");
    }

    #[test]
    fn terminal_gate_errors() {
        assert_eq!(
            OrchestratorError::MissingSummary.error_code(),
            "MISSING_SUMMARY"
        );
        assert_eq!(
            OrchestratorError::AlreadyTerminal.error_code(),
            "ALREADY_TERMINAL"
        );
        assert_eq!(
            OrchestratorError::VerificationRequired.error_code(),
            "VERIFICATION_REQUIRED"
        );
    }
}
