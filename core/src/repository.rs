use crate::{
    error::Result,
    models::{
        Dependency, Direction, EntityKind, Role, RoleTransitionRecord, Section, TimeRange,
        UpdateWorkItem, WorkItem, WorkItemFilter,
    },
};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository trait for work item persistence.
///
/// Implementations must be thread-safe, enforce referential integrity and
/// treat every method as a single atomic transaction: partial success is
/// never observable.
#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    /// Fetch an item by kind and id.
    ///
    /// # Returns
    /// * `Ok(Some(item))` - The item, if it exists with that kind
    /// * `Ok(None)` - No such item
    /// * `Err(OrchestratorError::Storage)` - Storage failure
    async fn get(&self, kind: EntityKind, id: Uuid) -> Result<Option<WorkItem>>;

    /// Fetch an item by id alone. Used when following parent links, where
    /// the referencing row does not carry the parent's kind.
    async fn get_any(&self, id: Uuid) -> Result<Option<WorkItem>>;

    /// List items of one kind matching the filter, ordered by `modified_at`
    /// descending with id as tiebreak.
    async fn list(&self, kind: EntityKind, filter: WorkItemFilter) -> Result<Vec<WorkItem>>;

    /// Direct children of a container, any kind.
    async fn children_of(&self, parent_id: Uuid) -> Result<Vec<WorkItem>>;

    /// Persist a batch of fully-formed items atomically. Items must be
    /// ordered so that batch-internal parents precede their children.
    ///
    /// # Returns
    /// * `Ok(())` - All items committed
    /// * `Err(OrchestratorError::Validation)` - A referenced parent does not exist
    /// * `Err(OrchestratorError::Storage)` - Constraint violation or storage failure;
    ///   nothing is persisted
    async fn create_batch(&self, items: Vec<WorkItem>) -> Result<()>;

    /// Apply a version-checked patch.
    ///
    /// # Returns
    /// * `Ok(item)` - The updated item with `version = expected_version + 1`
    /// * `Err(OrchestratorError::NotFound)` - No such item
    /// * `Err(OrchestratorError::VersionMismatch)` - `expected_version` is stale
    async fn update(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: UpdateWorkItem,
    ) -> Result<WorkItem>;

    /// Apply several version-checked patches in one transaction. Any
    /// failure rolls the whole batch back.
    async fn update_batch(
        &self,
        updates: Vec<(Uuid, i64, UpdateWorkItem)>,
    ) -> Result<Vec<WorkItem>>;

    /// Delete an item.
    ///
    /// With `cascade`, descendants are removed along with their sections
    /// and any dependency edges touching the removed tasks. Without it the
    /// call fails with `HasChildren` when descendants or edges exist.
    ///
    /// # Returns
    /// * `Ok(true)` - The item existed and was deleted
    /// * `Ok(false)` - No such item
    async fn delete(&self, id: Uuid, cascade: bool) -> Result<bool>;

    /// Delete several items in one transaction; any failure (including a
    /// missing id) rolls the whole batch back. Returns the number of items
    /// removed, descendants included.
    async fn delete_batch(&self, ids: Vec<Uuid>, cascade: bool) -> Result<u64>;

    /// Whether the item has direct children, or (for tasks) dependency
    /// edges in either direction.
    async fn has_children(&self, id: Uuid) -> Result<bool>;
}

/// Repository trait for dependency edges between tasks.
#[async_trait]
pub trait DependencyRepository: Send + Sync {
    async fn get_dependency(&self, id: Uuid) -> Result<Option<Dependency>>;

    /// Persist a batch of edges atomically. Cycle and duplicate screening
    /// happens before this call; the unique `(from, to, type)` constraint
    /// is the storage-level backstop.
    async fn create_dependencies(&self, deps: Vec<Dependency>) -> Result<()>;

    /// # Returns
    /// * `Ok(true)` - The edge existed and was deleted
    /// * `Ok(false)` - No such edge
    async fn delete_dependency(&self, id: Uuid) -> Result<bool>;

    /// Edges touching a task. `Outgoing` matches `from_task_id`,
    /// `Incoming` matches `to_task_id`, `All` matches either.
    async fn find_by_task(&self, task_id: Uuid, direction: Direction) -> Result<Vec<Dependency>>;

    /// Every stored edge; the dependency graph service builds its snapshot
    /// from this.
    async fn all_dependencies(&self) -> Result<Vec<Dependency>>;

    /// Remove every edge touching a task. Returns the number removed.
    async fn delete_for_task(&self, task_id: Uuid) -> Result<u64>;
}

/// Repository trait for content sections attached to work items.
#[async_trait]
pub trait SectionRepository: Send + Sync {
    async fn create_sections(&self, sections: Vec<Section>) -> Result<()>;

    /// Sections of one entity ordered by `ordinal`.
    async fn sections_for(&self, entity_id: Uuid) -> Result<Vec<Section>>;

    /// Remove all sections of an entity. Returns the number removed.
    async fn delete_sections_for(&self, entity_id: Uuid) -> Result<u64>;
}

/// Repository trait for the append-only role transition audit log.
#[async_trait]
pub trait TransitionLogRepository: Send + Sync {
    async fn append_role_transition(&self, record: RoleTransitionRecord) -> Result<()>;

    /// Chronological audit entries for an entity within a time window.
    async fn list_role_transitions(
        &self,
        entity_id: Uuid,
        range: TimeRange,
    ) -> Result<Vec<RoleTransitionRecord>>;

    /// Whether the entity has ever entered the given role. Powers the
    /// verification gate (a prior `Review` entry).
    async fn has_role_entry(&self, entity_id: Uuid, role: Role) -> Result<bool>;
}

/// The full persistence surface the orchestration services operate over.
pub trait EntityStore:
    WorkItemRepository + DependencyRepository + SectionRepository + TransitionLogRepository
{
}

impl<T> EntityStore for T where
    T: WorkItemRepository + DependencyRepository + SectionRepository + TransitionLogRepository
{
}
