//! Transition execution: lock, validate, write, audit, cascade.

use crate::cascade::{CascadeEngine, CascadeEvent};
use crate::error::{OrchestratorError, Result};
use crate::flow::FlowConfig;
use crate::lock::LockManager;
use crate::models::{
    Direction, EntityKind, Role, RoleTransitionRecord, Trigger, UpdateWorkItem, WorkItem,
};
use crate::repository::EntityStore;
use crate::transition::{self, BlockerEdge, PendingTransition, TransitionContext};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// How many parent levels a cascade may climb before further propagation
/// is reported but not applied.
pub const DEFAULT_MAX_CASCADE_DEPTH: usize = 3;

/// Total write attempts per transition: the initial one plus one retry
/// after a version mismatch.
const TRANSITION_ATTEMPTS: u32 = 2;

/// Tuning for the executor and the cascade engine it drives.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub max_cascade_depth: usize,
    /// Lock TTL; `None` uses the lock manager's default.
    pub lock_ttl: Option<Duration>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
            lock_ttl: None,
        }
    }
}

/// Full effect set of an applied transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionResult {
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub previous_status: String,
    pub new_status: String,
    pub previous_role: Role,
    pub new_role: Role,
    pub active_flow: String,
    pub flow_sequence: Vec<String>,
    /// Position of the new status within the flow sequence; `None` for
    /// emergency statuses outside the progression.
    pub flow_position: Option<usize>,
    pub version: i64,
    pub cascade_events: Vec<CascadeEvent>,
    pub unblocked_tasks: Vec<Uuid>,
}

/// A status move resolvable from the current state, as reported by the
/// read-only next-status query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerTarget {
    pub trigger: Trigger,
    pub status: String,
    pub role: Role,
}

/// Read-only view of where an item sits in its flow and where each trigger
/// would take it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextStatusInfo {
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub current_status: String,
    pub current_role: Role,
    pub active_flow: String,
    pub flow_sequence: Vec<String>,
    pub flow_position: Option<usize>,
    pub targets: Vec<TriggerTarget>,
}

/// Internal record of a single applied move, fed to the cascade engine.
#[derive(Debug, Clone)]
pub(crate) struct AppliedTransition {
    pub pending: PendingTransition,
    pub recorded_at: DateTime<Utc>,
}

/// Orchestrates a transition end to end: acquires the entity lock, loads
/// the item, validates the trigger, writes the new status under version
/// check (one retry on a stale version), appends the audit record, then
/// hands the applied move to the cascade engine.
pub struct TransitionExecutor<S> {
    store: Arc<S>,
    locks: Arc<LockManager>,
    config: Arc<FlowConfig>,
    options: ExecutorOptions,
}

impl<S> Clone for TransitionExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            config: Arc::clone(&self.config),
            options: self.options.clone(),
        }
    }
}

impl<S: EntityStore> TransitionExecutor<S> {
    pub fn new(store: Arc<S>, locks: Arc<LockManager>, config: Arc<FlowConfig>) -> Self {
        Self::with_options(store, locks, config, ExecutorOptions::default())
    }

    pub fn with_options(
        store: Arc<S>,
        locks: Arc<LockManager>,
        config: Arc<FlowConfig>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            store,
            locks,
            config,
            options,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &Arc<FlowConfig> {
        &self.config
    }

    pub(crate) fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub(crate) fn options(&self) -> &ExecutorOptions {
        &self.options
    }

    /// Apply a trigger to an entity and propagate its effects.
    ///
    /// Cascade failures never roll back the primary transition; they are
    /// reported in `cascade_events` with `applied = false`.
    pub async fn apply_transition(
        &self,
        kind: EntityKind,
        id: Uuid,
        trigger: Trigger,
        session: &str,
    ) -> Result<TransitionResult> {
        let lock = self
            .locks
            .acquire(kind, id, session, self.options.lock_ttl)?;
        let result = self.transition_and_cascade(kind, id, trigger, session).await;
        self.locks.release(&lock);
        result
    }

    async fn transition_and_cascade(
        &self,
        kind: EntityKind,
        id: Uuid,
        trigger: Trigger,
        session: &str,
    ) -> Result<TransitionResult> {
        let (item, applied) = self
            .transition_locked(kind, id, trigger, false, None)
            .await?;

        let engine = CascadeEngine::new(self);
        let outcome = engine.run(&item, &applied, session).await;

        let flow = self.config.active_flow(kind, &item.header.tags);
        Ok(TransitionResult {
            entity_kind: kind,
            entity_id: id,
            previous_status: applied.pending.from_status.clone(),
            new_status: applied.pending.to_status.clone(),
            previous_role: applied.pending.from_role,
            new_role: applied.pending.to_role,
            active_flow: applied.pending.flow_name.clone(),
            flow_sequence: flow.sequence.clone(),
            flow_position: flow.position_of(&applied.pending.to_status),
            version: item.header.version,
            cascade_events: outcome.events,
            unblocked_tasks: outcome.unblocked_tasks,
        })
    }

    /// One validated move with audit, no cascade. The caller is expected to
    /// hold the entity's lock. `after` forces the audit timestamp strictly
    /// past an earlier record so cascaded entries sort after their cause.
    pub(crate) async fn transition_locked(
        &self,
        kind: EntityKind,
        id: Uuid,
        trigger: Trigger,
        automatic: bool,
        after: Option<DateTime<Utc>>,
    ) -> Result<(WorkItem, AppliedTransition)> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let item = self
                .store
                .get(kind, id)
                .await?
                .ok_or_else(|| OrchestratorError::not_found(kind, id))?;

            let blockers = if kind == EntityKind::Task {
                self.load_blockers(id).await?
            } else {
                Vec::new()
            };
            let has_review_entry = if item.requires_verification() {
                self.store.has_role_entry(id, Role::Review).await?
            } else {
                false
            };
            let child_roles = if kind != EntityKind::Task
                && trigger == Trigger::Complete
                && self.config.enforce_child_completion()
            {
                self.load_child_roles(id).await?
            } else {
                Vec::new()
            };

            let context = TransitionContext {
                item: &item,
                config: &self.config,
                blockers: &blockers,
                has_review_entry,
                child_roles: &child_roles,
            };
            let pending = transition::validate(&context, trigger)?;

            let patch = UpdateWorkItem {
                status: Some(pending.to_status.clone()),
                ..Default::default()
            };
            match self.store.update(id, item.header.version, patch).await {
                Ok(updated) => {
                    let recorded_at = next_timestamp(after);
                    let record = RoleTransitionRecord {
                        id: Uuid::new_v4(),
                        entity_id: id,
                        entity_kind: kind,
                        from_status: pending.from_status.clone(),
                        to_status: pending.to_status.clone(),
                        from_role: pending.from_role,
                        to_role: pending.to_role,
                        trigger,
                        automatic,
                        summary: if updated.has_summary() {
                            Some(updated.header.summary.clone())
                        } else {
                            None
                        },
                        config_version: self.config.version(),
                        created_at: recorded_at,
                    };
                    self.store.append_role_transition(record).await?;
                    tracing::debug!(
                        kind = %kind,
                        entity_id = %id,
                        trigger = %trigger,
                        from = %pending.from_status,
                        to = %pending.to_status,
                        automatic,
                        "transition applied"
                    );
                    return Ok((updated, AppliedTransition {
                        pending,
                        recorded_at,
                    }));
                }
                Err(OrchestratorError::VersionMismatch { .. })
                    if attempts < TRANSITION_ATTEMPTS =>
                {
                    tracing::debug!(entity_id = %id, "stale version, retrying transition");
                    continue;
                }
                Err(OrchestratorError::VersionMismatch { .. }) => {
                    return Err(OrchestratorError::Contended(attempts));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Incoming blocks-normalised edges of a task with the blocker's
    /// current role. Edges whose source no longer exists are skipped.
    pub async fn load_blockers(&self, task_id: Uuid) -> Result<Vec<BlockerEdge>> {
        let deps = self.store.find_by_task(task_id, Direction::All).await?;
        let mut blockers = Vec::new();
        for dep in deps {
            if let Some((source, target, threshold)) = dep.normalized() {
                if target != task_id {
                    continue;
                }
                let source_role = match self.store.get_any(source).await? {
                    Some(item) => self.config.role_of(item.kind(), &item.header.status)?,
                    None => continue,
                };
                blockers.push(BlockerEdge {
                    source_id: source,
                    source_role,
                    unblock_at: threshold,
                });
            }
        }
        Ok(blockers)
    }

    async fn load_child_roles(&self, id: Uuid) -> Result<Vec<(Uuid, Role)>> {
        let children = self.store.children_of(id).await?;
        let mut roles = Vec::with_capacity(children.len());
        for child in children {
            let role = self.config.role_of(child.kind(), &child.header.status)?;
            roles.push((child.id(), role));
        }
        Ok(roles)
    }

    /// Resolve where each trigger would take the item, without applying
    /// anything. With an explicit trigger only that one is resolved;
    /// otherwise every resolvable trigger is reported.
    pub async fn next_status(
        &self,
        kind: EntityKind,
        id: Uuid,
        trigger: Option<Trigger>,
    ) -> Result<NextStatusInfo> {
        let item = self
            .store
            .get(kind, id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(kind, id))?;
        let flow = self.config.active_flow(kind, &item.header.tags);
        let current_role = self.config.role_of(kind, &item.header.status)?;

        let candidates = match trigger {
            Some(t) => vec![t],
            None => vec![
                Trigger::Start,
                Trigger::Complete,
                Trigger::Cancel,
                Trigger::Block,
                Trigger::Hold,
            ],
        };
        let mut targets = Vec::new();
        for candidate in candidates {
            match transition::resolve_target(&self.config, &item, candidate) {
                Ok(pending) => targets.push(TriggerTarget {
                    trigger: candidate,
                    status: pending.to_status,
                    role: pending.to_role,
                }),
                // With an explicit trigger the resolution error is the
                // answer; the survey variant just omits the trigger.
                Err(e) if trigger.is_some() => return Err(e),
                Err(_) => {}
            }
        }

        Ok(NextStatusInfo {
            entity_kind: kind,
            entity_id: id,
            current_status: item.header.status.clone(),
            current_role,
            active_flow: flow.name.clone(),
            flow_sequence: flow.sequence.clone(),
            flow_position: flow.position_of(&item.header.status),
            targets,
        })
    }
}

/// Strictly-increasing timestamp helper: cascaded audit records must sort
/// after the record that caused them even at coarse clock resolution.
fn next_timestamp(after: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now();
    match after {
        Some(prev) if now <= prev => prev + Duration::microseconds(1),
        _ => now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_timestamp_is_strictly_increasing() {
        let base = Utc::now();
        let next = next_timestamp(Some(base));
        assert!(next > base);

        let future = base + Duration::seconds(10);
        assert!(next_timestamp(Some(future)) > future);

        assert!(next_timestamp(None) <= Utc::now());
    }
}
