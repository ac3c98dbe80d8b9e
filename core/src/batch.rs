//! Atomic multi-entity writes.
//!
//! The coordinator validates a whole batch up front, acquires every
//! implicated lock in canonical order, and executes through the store's
//! transactional batch operations. The default is all-or-nothing; callers
//! may instead ask for per-item error reporting, in which case the valid
//! subset commits and rejected items are returned with their errors.

use crate::cascade::{CascadeEngine, CascadeEvent};
use crate::error::{OrchestratorError, Result};
use crate::executor::TransitionExecutor;
use crate::lock::LockKey;
use crate::models::{
    canonicalize_tags, Direction, EntityKind, KindData, NewWorkItem, Priority, Role, Section,
    UpdateWorkItem, WorkItem, WorkItemHeader, DEFAULT_COMPLEXITY,
};
use crate::repository::EntityStore;
use crate::validation::ItemValidator;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use uuid::Uuid;

/// Failure handling for a batch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorMode {
    /// Any per-item failure aborts the whole batch.
    Atomic,
    /// Rejected items are reported individually; valid items commit.
    PerItem,
}

impl Default for ErrorMode {
    fn default() -> Self {
        ErrorMode::Atomic
    }
}

impl std::str::FromStr for ErrorMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "atomic" => Ok(ErrorMode::Atomic),
            "per-item" | "per_item" => Ok(ErrorMode::PerItem),
            other => Err(format!("unknown error mode '{other}'")),
        }
    }
}

/// One item the batch refused, with the machine-readable code and message
/// of its error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedItem {
    pub index: usize,
    pub id: Option<Uuid>,
    pub code: String,
    pub message: String,
}

impl RejectedItem {
    fn new(index: usize, id: Option<Uuid>, error: &OrchestratorError) -> Self {
        Self {
            index,
            id,
            code: error.error_code().to_string(),
            message: error.to_string(),
        }
    }
}

/// Result of a batch write, including any implicit cascades it set off.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub applied: Vec<Uuid>,
    pub rejected: Vec<RejectedItem>,
    pub modified_ids: Vec<Uuid>,
    pub cascade_events: Vec<CascadeEvent>,
    pub unblocked_tasks: Vec<Uuid>,
}

/// A version-checked patch for one item in an update batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
    pub id: Uuid,
    pub expected_version: i64,
    pub patch: UpdateWorkItem,
}

/// Coordinates create/update/delete batches over a single entity kind.
pub struct BatchCoordinator<S> {
    executor: TransitionExecutor<S>,
}

impl<S: EntityStore> BatchCoordinator<S> {
    pub fn new(executor: TransitionExecutor<S>) -> Self {
        Self { executor }
    }

    /// Create up to the batch ceiling of items of one kind.
    ///
    /// Parents may be pre-existing or earlier members of the same batch
    /// (pre-assign their ids); batch-internal references are ordered
    /// parent-before-child automatically.
    pub async fn create_items(
        &self,
        kind: EntityKind,
        specs: Vec<NewWorkItem>,
        mode: ErrorMode,
        session: &str,
    ) -> Result<BatchOutcome> {
        ItemValidator::validate_batch_size(specs.len())?;
        let store = self.executor.store();
        let config = self.executor.config();

        // Assign ids up front so in-batch parent references resolve.
        let mut specs = specs;
        for spec in &mut specs {
            if spec.id.is_none() {
                spec.id = Some(Uuid::new_v4());
            }
            spec.tags = canonicalize_tags(&spec.tags);
        }
        let batch_kinds: HashMap<Uuid, EntityKind> = specs
            .iter()
            .map(|s| (s.id.unwrap_or_default(), s.kind))
            .collect();

        let mut rejected: Vec<RejectedItem> = Vec::new();
        let mut accepted: Vec<(usize, NewWorkItem)> = Vec::new();
        let mut parent_locks: BTreeSet<LockKey> = BTreeSet::new();

        for (index, spec) in specs.into_iter().enumerate() {
            let verdict = self
                .validate_create_spec(kind, &spec, &batch_kinds, &mut parent_locks)
                .await;
            match verdict {
                Ok(()) => accepted.push((index, spec)),
                Err(e) => match mode {
                    ErrorMode::Atomic => return Err(e),
                    ErrorMode::PerItem => rejected.push(RejectedItem::new(index, spec.id, &e)),
                },
            }
        }

        // A child whose in-batch parent was rejected cannot commit either.
        if !rejected.is_empty() {
            let rejected_ids: HashSet<Uuid> = rejected.iter().filter_map(|r| r.id).collect();
            let mut still_accepted = Vec::with_capacity(accepted.len());
            for (index, spec) in accepted {
                match spec.parent_id {
                    Some(parent) if rejected_ids.contains(&parent) => {
                        let err = OrchestratorError::Validation(
                            "parent item was rejected in the same batch".to_string(),
                        );
                        rejected.push(RejectedItem::new(index, spec.id, &err));
                    }
                    _ => still_accepted.push((index, spec)),
                }
            }
            accepted = still_accepted;
        }

        if accepted.is_empty() {
            return Ok(BatchOutcome {
                rejected,
                ..Default::default()
            });
        }

        let ordered = order_parents_first(accepted)?;

        let now = Utc::now();
        let mut items = Vec::with_capacity(ordered.len());
        let mut sections = Vec::new();
        for spec in &ordered {
            let item = materialize(config, spec, now)?;
            for (ordinal_fallback, section_spec) in spec.sections.iter().enumerate() {
                sections.push(Section {
                    id: Uuid::new_v4(),
                    entity_kind: item.kind(),
                    entity_id: item.id(),
                    title: section_spec.title.clone(),
                    content: section_spec.content.clone(),
                    format: section_spec.format,
                    ordinal: if section_spec.ordinal != 0 {
                        section_spec.ordinal
                    } else {
                        ordinal_fallback as i64
                    },
                    tags: canonicalize_tags(&section_spec.tags),
                });
            }
            items.push(item);
        }

        let mut lock_keys: Vec<LockKey> = items
            .iter()
            .map(|item| LockKey::new(item.kind(), item.id()))
            .collect();
        lock_keys.extend(parent_locks.iter().copied());
        let held = self.executor.locks().acquire_many(
            &lock_keys,
            session,
            self.executor.options().lock_ttl,
        )?;

        let applied_ids: Vec<Uuid> = items.iter().map(WorkItem::id).collect();
        let terminal_parents: BTreeSet<Uuid> = items
            .iter()
            .filter(|item| {
                config
                    .role_of(item.kind(), &item.header.status)
                    .map(|role| role == Role::Terminal)
                    .unwrap_or(false)
            })
            .filter_map(|item| item.header.parent_id)
            .collect();

        let commit = async {
            store.create_batch(items).await?;
            if !sections.is_empty() {
                store.create_sections(sections).await?;
            }
            Ok::<(), OrchestratorError>(())
        }
        .await;

        for lock in &held {
            self.executor.locks().release(lock);
        }
        commit?;

        // Creating an item directly in a terminal status can finish off its
        // parent the same way a completion would.
        let mut cascade_events = Vec::new();
        let engine = CascadeEngine::new(&self.executor);
        for parent_id in terminal_parents {
            cascade_events.extend(engine.evaluate_parent(parent_id, Utc::now(), session).await);
        }

        tracing::info!(
            kind = %kind,
            created = applied_ids.len(),
            rejected = rejected.len(),
            "batch create committed"
        );
        Ok(BatchOutcome {
            modified_ids: applied_ids.clone(),
            applied: applied_ids,
            rejected,
            cascade_events,
            unblocked_tasks: Vec::new(),
        })
    }

    /// Apply version-checked field patches to up to the batch ceiling of
    /// items of one kind.
    pub async fn update_items(
        &self,
        kind: EntityKind,
        updates: Vec<UpdateSpec>,
        mode: ErrorMode,
        session: &str,
    ) -> Result<BatchOutcome> {
        ItemValidator::validate_batch_size(updates.len())?;
        let store = self.executor.store();

        let mut rejected = Vec::new();
        let mut accepted: Vec<(usize, UpdateSpec, Option<Uuid>)> = Vec::new();
        for (index, mut spec) in updates.into_iter().enumerate() {
            if let Some(tags) = spec.patch.tags.take() {
                spec.patch.tags = Some(canonicalize_tags(&tags));
            }
            let verdict = self.validate_update_spec(kind, &spec).await;
            match verdict {
                Ok(previous_parent) => accepted.push((index, spec, previous_parent)),
                Err(e) => match mode {
                    ErrorMode::Atomic => return Err(e),
                    ErrorMode::PerItem => rejected.push(RejectedItem::new(index, Some(spec.id), &e)),
                },
            }
        }

        if accepted.is_empty() {
            return Ok(BatchOutcome {
                rejected,
                ..Default::default()
            });
        }

        let lock_keys: Vec<LockKey> = accepted
            .iter()
            .map(|(_, spec, _)| LockKey::new(kind, spec.id))
            .collect();
        let held = self.executor.locks().acquire_many(
            &lock_keys,
            session,
            self.executor.options().lock_ttl,
        )?;

        // Reparenting can leave the old container fully terminal.
        let mut reparented_from: BTreeSet<Uuid> = BTreeSet::new();
        for (_, spec, previous_parent) in &accepted {
            if spec.patch.parent_id.is_some() {
                if let Some(old_parent) = previous_parent {
                    reparented_from.insert(*old_parent);
                }
            }
        }

        let mut applied = Vec::new();
        let outcome = match mode {
            ErrorMode::Atomic => {
                let payload: Vec<(Uuid, i64, UpdateWorkItem)> = accepted
                    .iter()
                    .map(|(_, spec, _)| (spec.id, spec.expected_version, spec.patch.clone()))
                    .collect();
                store.update_batch(payload).await.map(|items| {
                    applied = items.iter().map(WorkItem::id).collect();
                })
            }
            ErrorMode::PerItem => {
                for (index, spec, _) in &accepted {
                    match store
                        .update(spec.id, spec.expected_version, spec.patch.clone())
                        .await
                    {
                        Ok(item) => applied.push(item.id()),
                        Err(e) => rejected.push(RejectedItem::new(*index, Some(spec.id), &e)),
                    }
                }
                Ok(())
            }
        };

        for lock in &held {
            self.executor.locks().release(lock);
        }
        outcome?;

        let mut cascade_events = Vec::new();
        let engine = CascadeEngine::new(&self.executor);
        for parent_id in reparented_from {
            cascade_events.extend(engine.evaluate_parent(parent_id, Utc::now(), session).await);
        }

        Ok(BatchOutcome {
            modified_ids: applied.clone(),
            applied,
            rejected,
            cascade_events,
            unblocked_tasks: Vec::new(),
        })
    }

    /// Delete up to the batch ceiling of items of one kind. Without
    /// `force`, items with children or dependency edges are refused; with
    /// it, descendants, their sections and touching edges go too.
    pub async fn delete_items(
        &self,
        kind: EntityKind,
        ids: Vec<Uuid>,
        force: bool,
        mode: ErrorMode,
        session: &str,
    ) -> Result<BatchOutcome> {
        ItemValidator::validate_batch_size(ids.len())?;
        let store = self.executor.store();

        let mut rejected = Vec::new();
        let mut accepted: Vec<(usize, WorkItem)> = Vec::new();
        for (index, id) in ids.iter().enumerate() {
            let verdict = async {
                let item = store
                    .get(kind, *id)
                    .await?
                    .ok_or_else(|| OrchestratorError::not_found(kind, *id))?;
                if !force && store.has_children(*id).await? {
                    return Err(OrchestratorError::HasChildren);
                }
                Ok(item)
            }
            .await;
            match verdict {
                Ok(item) => accepted.push((index, item)),
                Err(e) => match mode {
                    ErrorMode::Atomic => return Err(e),
                    ErrorMode::PerItem => rejected.push(RejectedItem::new(index, Some(*id), &e)),
                },
            }
        }

        if accepted.is_empty() {
            return Ok(BatchOutcome {
                rejected,
                ..Default::default()
            });
        }

        // Downstream tasks blocked by a removed task lose that edge;
        // capture the candidates before the edges disappear.
        let mut unblock_candidates: BTreeSet<Uuid> = BTreeSet::new();
        let doomed: HashSet<Uuid> = accepted.iter().map(|(_, item)| item.id()).collect();
        if kind == EntityKind::Task {
            for (_, item) in &accepted {
                let deps = store.find_by_task(item.id(), Direction::All).await?;
                for dep in deps {
                    if let Some((source, target, _)) = dep.normalized() {
                        if source == item.id() && !doomed.contains(&target) {
                            unblock_candidates.insert(target);
                        }
                    }
                }
            }
        }

        let parents: BTreeSet<Uuid> = accepted
            .iter()
            .filter_map(|(_, item)| item.header.parent_id)
            .filter(|parent| !doomed.contains(parent))
            .collect();

        let lock_keys: Vec<LockKey> = accepted
            .iter()
            .map(|(_, item)| LockKey::new(kind, item.id()))
            .collect();
        let held = self.executor.locks().acquire_many(
            &lock_keys,
            session,
            self.executor.options().lock_ttl,
        )?;

        let mut applied = Vec::new();
        let outcome = match mode {
            ErrorMode::Atomic => {
                let batch_ids: Vec<Uuid> = accepted.iter().map(|(_, item)| item.id()).collect();
                store.delete_batch(batch_ids.clone(), force).await.map(|_| {
                    applied = batch_ids;
                })
            }
            ErrorMode::PerItem => {
                for (index, item) in &accepted {
                    match store.delete(item.id(), force).await {
                        Ok(true) => applied.push(item.id()),
                        Ok(false) => {
                            let err = OrchestratorError::not_found(kind, item.id());
                            rejected.push(RejectedItem::new(*index, Some(item.id()), &err));
                        }
                        Err(e) => rejected.push(RejectedItem::new(*index, Some(item.id()), &e)),
                    }
                }
                Ok(())
            }
        };

        for lock in &held {
            self.executor.locks().release(lock);
        }
        outcome?;

        // Removing the last non-terminal child can complete the parent.
        let mut cascade_events = Vec::new();
        let engine = CascadeEngine::new(&self.executor);
        for parent_id in parents {
            cascade_events.extend(engine.evaluate_parent(parent_id, Utc::now(), session).await);
        }

        let mut unblocked_tasks = Vec::new();
        for candidate in unblock_candidates {
            if store.get_any(candidate).await?.is_none() {
                continue;
            }
            let blockers = self.executor.load_blockers(candidate).await?;
            if blockers.iter().all(|edge| edge.is_satisfied()) {
                unblocked_tasks.push(candidate);
            }
        }

        tracing::info!(
            kind = %kind,
            deleted = applied.len(),
            rejected = rejected.len(),
            force,
            "batch delete committed"
        );
        Ok(BatchOutcome {
            modified_ids: applied.clone(),
            applied,
            rejected,
            cascade_events,
            unblocked_tasks,
        })
    }

    async fn validate_create_spec(
        &self,
        kind: EntityKind,
        spec: &NewWorkItem,
        batch_kinds: &HashMap<Uuid, EntityKind>,
        parent_locks: &mut BTreeSet<LockKey>,
    ) -> Result<()> {
        if spec.kind != kind {
            return Err(OrchestratorError::Validation(format!(
                "batch of kind '{kind}' cannot contain a '{}'",
                spec.kind
            )));
        }
        ItemValidator::validate_new_item(spec)?;

        let config = self.executor.config();
        if let Some(status) = &spec.status {
            if !config.is_valid_status(kind, status) {
                return Err(OrchestratorError::Validation(format!(
                    "status '{status}' is not valid for kind '{kind}'"
                )));
            }
        }

        if let Some(parent_id) = spec.parent_id {
            let parent_kind = match batch_kinds.get(&parent_id) {
                Some(kind) => *kind,
                None => match self.executor.store().get_any(parent_id).await? {
                    Some(parent) => {
                        parent_locks.insert(LockKey::new(parent.kind(), parent_id));
                        parent.kind()
                    }
                    None => {
                        return Err(OrchestratorError::Validation(format!(
                            "parent {parent_id} does not exist"
                        )))
                    }
                },
            };
            ItemValidator::validate_parent_kind(kind, parent_kind)?;
        }
        Ok(())
    }

    /// Returns the item's current parent for reparent cascade evaluation.
    async fn validate_update_spec(&self, kind: EntityKind, spec: &UpdateSpec) -> Result<Option<Uuid>> {
        ItemValidator::validate_update(kind, &spec.patch)?;
        let item = self
            .executor
            .store()
            .get(kind, spec.id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(kind, spec.id))?;

        if let Some(Some(new_parent)) = spec.patch.parent_id {
            let parent = self
                .executor
                .store()
                .get_any(new_parent)
                .await?
                .ok_or_else(|| {
                    OrchestratorError::Validation(format!("parent {new_parent} does not exist"))
                })?;
            ItemValidator::validate_parent_kind(kind, parent.kind())?;
        }
        Ok(item.header.parent_id)
    }
}

/// Arrange accepted specs so in-batch parents precede their children.
fn order_parents_first(accepted: Vec<(usize, NewWorkItem)>) -> Result<Vec<NewWorkItem>> {
    let in_batch: HashSet<Uuid> = accepted.iter().filter_map(|(_, s)| s.id).collect();
    let mut pending: Vec<NewWorkItem> = accepted.into_iter().map(|(_, s)| s).collect();
    let mut placed_ids: HashSet<Uuid> = HashSet::new();
    let mut ordered = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let before = pending.len();
        let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|spec| {
            match spec.parent_id {
                Some(parent) if in_batch.contains(&parent) => placed_ids.contains(&parent),
                _ => true,
            }
        });
        for spec in ready {
            if let Some(id) = spec.id {
                placed_ids.insert(id);
            }
            ordered.push(spec);
        }
        pending = blocked;
        if pending.len() == before {
            return Err(OrchestratorError::Validation(
                "batch contains a parent reference cycle".to_string(),
            ));
        }
    }
    Ok(ordered)
}

/// Turn a validated spec into a persistable item.
fn materialize(
    config: &crate::flow::FlowConfig,
    spec: &NewWorkItem,
    now: chrono::DateTime<Utc>,
) -> Result<WorkItem> {
    let status = match &spec.status {
        Some(status) => status.clone(),
        None => config.initial_status(spec.kind, &spec.tags).to_string(),
    };
    let data = match spec.kind {
        EntityKind::Project => KindData::Project,
        EntityKind::Feature => KindData::Feature {
            priority: spec.priority.unwrap_or(Priority::Medium),
            requires_verification: spec.requires_verification,
        },
        EntityKind::Task => KindData::Task {
            priority: spec.priority.unwrap_or(Priority::Medium),
            complexity: spec.complexity.unwrap_or(DEFAULT_COMPLEXITY),
            requires_verification: spec.requires_verification,
        },
    };
    Ok(WorkItem {
        header: WorkItemHeader {
            id: spec.id.unwrap_or_else(Uuid::new_v4),
            title: spec.title.clone(),
            description: spec.description.clone(),
            summary: spec.summary.clone(),
            status,
            parent_id: spec.parent_id,
            tags: spec.tags.clone(),
            version: 1,
            created_at: now,
            modified_at: now,
        },
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parents_order_before_children() {
        let parent_id = Uuid::new_v4();
        let child_id = Uuid::new_v4();

        let mut parent = NewWorkItem::new(EntityKind::Feature, "Parent");
        parent.id = Some(parent_id);
        let mut child = NewWorkItem::new(EntityKind::Task, "Child");
        child.id = Some(child_id);
        child.parent_id = Some(parent_id);

        // Child listed first; ordering must flip them.
        let ordered = order_parents_first(vec![(0, child), (1, parent)]).unwrap();
        assert_eq!(ordered[0].id, Some(parent_id));
        assert_eq!(ordered[1].id, Some(child_id));
    }

    #[test]
    fn parent_reference_cycle_is_rejected() {
        let a_id = Uuid::new_v4();
        let b_id = Uuid::new_v4();

        let mut a = NewWorkItem::new(EntityKind::Task, "A");
        a.id = Some(a_id);
        a.parent_id = Some(b_id);
        let mut b = NewWorkItem::new(EntityKind::Task, "B");
        b.id = Some(b_id);
        b.parent_id = Some(a_id);

        assert!(order_parents_first(vec![(0, a), (1, b)]).is_err());
    }

    #[test]
    fn materialize_defaults_status_and_complexity() {
        let config = crate::flow::FlowConfig::default();
        let spec = NewWorkItem::new(EntityKind::Task, "Reindex");
        let item = materialize(&config, &spec, Utc::now()).unwrap();
        assert_eq!(item.header.status, "pending");
        assert_eq!(item.header.version, 1);
        assert_eq!(item.complexity(), Some(DEFAULT_COMPLEXITY));

        let mut tagged = NewWorkItem::new(EntityKind::Task, "Patch");
        tagged.tags = vec!["hotfix".to_string()];
        let item = materialize(&config, &tagged, Utc::now()).unwrap();
        // Hotfix flow still starts at pending.
        assert_eq!(item.header.status, "pending");
    }
}
