//! Completion cascades and unblock detection.
//!
//! When a task reaches a terminal role, its parent may have just become
//! completable: if every sibling is terminal, the engine attempts the
//! parent's `complete` transition automatically, and recurses upward. The
//! loop is iterative with an explicit work queue so the depth cap stays
//! observable. Failed cascades are reported, never retried and never roll
//! back the transition that triggered them.

use crate::error::Result;
use crate::executor::{AppliedTransition, TransitionExecutor};
use crate::models::{Direction, EntityKind, Role, Trigger, WorkItem};
use crate::repository::EntityStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use uuid::Uuid;

/// Report of one attempted cascade. Events are listed flat, in application
/// order; the chain in this domain is linear (task → feature → project),
/// so `child_cascades` stays empty and follow-on levels appear as their
/// own top-level events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeEvent {
    pub target_kind: EntityKind,
    pub target_id: Uuid,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub applied: bool,
    /// Always true: cascades are engine-driven.
    pub automatic: bool,
    pub error: Option<String>,
    /// Cascades attempted as a direct consequence of this one.
    pub child_cascades: Vec<CascadeEvent>,
}

/// Everything a transition set in motion beyond the entity itself.
#[derive(Debug, Clone, Default)]
pub struct CascadeOutcome {
    pub events: Vec<CascadeEvent>,
    /// Tasks whose dependency gate newly passes because of this
    /// transition. Informational; nothing is auto-started.
    pub unblocked_tasks: Vec<Uuid>,
}

/// Drives completion propagation for one applied transition.
pub struct CascadeEngine<'a, S> {
    executor: &'a TransitionExecutor<S>,
}

impl<'a, S: EntityStore> CascadeEngine<'a, S> {
    pub fn new(executor: &'a TransitionExecutor<S>) -> Self {
        Self { executor }
    }

    /// Evaluate cascades and unblocks for an applied transition.
    pub async fn run(
        &self,
        origin: &WorkItem,
        applied: &AppliedTransition,
        session: &str,
    ) -> CascadeOutcome {
        let unblocked_tasks = if origin.kind() == EntityKind::Task {
            match self.detect_unblocked(origin, applied).await {
                Ok(unblocked) => unblocked,
                Err(e) => {
                    tracing::warn!(error = %e, "unblock detection failed");
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };

        let mut events = Vec::new();
        if applied.pending.to_role == Role::Terminal {
            if let Some(parent_id) = origin.header.parent_id {
                self.propagate(parent_id, applied.recorded_at, session, &mut events)
                    .await;
            }
        }

        CascadeOutcome {
            events,
            unblocked_tasks,
        }
    }

    /// Re-evaluate a container after one of its children was removed. A
    /// delete can satisfy the sibling-completion condition just as a
    /// completion can.
    pub async fn evaluate_parent(
        &self,
        parent_id: Uuid,
        after: DateTime<Utc>,
        session: &str,
    ) -> Vec<CascadeEvent> {
        let mut events = Vec::new();
        self.propagate(parent_id, after, session, &mut events).await;
        events
    }

    /// Walk the parent chain with an explicit queue. Each level completes
    /// only when every direct child is terminal; the first level that is
    /// not completable, fails validation, or exceeds the depth cap stops
    /// the walk.
    async fn propagate(
        &self,
        first_parent: Uuid,
        after: DateTime<Utc>,
        session: &str,
        events: &mut Vec<CascadeEvent>,
    ) {
        let store = self.executor.store();
        let config = self.executor.config();
        let max_depth = self.executor.options().max_cascade_depth;

        let mut queue: VecDeque<(Uuid, usize)> = VecDeque::new();
        queue.push_back((first_parent, 0));
        let mut last_recorded_at = after;

        while let Some((parent_id, depth)) = queue.pop_front() {
            let parent = match store.get_any(parent_id).await {
                Ok(Some(parent)) => parent,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(parent_id = %parent_id, error = %e, "cascade load failed");
                    break;
                }
            };
            let kind = parent.kind();

            let parent_role = match config.role_of(kind, &parent.header.status) {
                Ok(role) => role,
                Err(_) => break,
            };
            if parent_role == Role::Terminal {
                break;
            }

            let children = match store.children_of(parent_id).await {
                Ok(children) => children,
                Err(e) => {
                    tracing::warn!(parent_id = %parent_id, error = %e, "cascade children load failed");
                    break;
                }
            };
            let all_terminal = !children.is_empty()
                && children.iter().all(|child| {
                    config
                        .role_of(child.kind(), &child.header.status)
                        .map(|role| role == Role::Terminal)
                        .unwrap_or(false)
                });
            if !all_terminal {
                break;
            }

            if depth >= max_depth {
                // Reported but not applied: the cap bounds recursion, not
                // visibility.
                events.push(CascadeEvent {
                    target_kind: kind,
                    target_id: parent_id,
                    from_status: Some(parent.header.status.clone()),
                    to_status: None,
                    applied: false,
                    automatic: true,
                    error: Some("cascade depth limit reached".to_string()),
                    child_cascades: Vec::new(),
                });
                break;
            }

            // The parent's lock is taken independently of the child's;
            // acquisition is fail-fast, so a concurrent direct transition
            // shows up as a reported-not-applied event rather than a
            // deadlock.
            let lock = match self.executor.locks().acquire(
                kind,
                parent_id,
                session,
                self.executor.options().lock_ttl,
            ) {
                Ok(lock) => lock,
                Err(e) => {
                    events.push(CascadeEvent {
                        target_kind: kind,
                        target_id: parent_id,
                        from_status: Some(parent.header.status.clone()),
                        to_status: None,
                        applied: false,
                        automatic: true,
                        error: Some(e.to_string()),
                        child_cascades: Vec::new(),
                    });
                    break;
                }
            };
            let result = self
                .executor
                .transition_locked(kind, parent_id, Trigger::Complete, true, Some(last_recorded_at))
                .await;
            self.executor.locks().release(&lock);

            match result {
                Ok((updated, parent_applied)) => {
                    last_recorded_at = parent_applied.recorded_at;
                    tracing::info!(
                        kind = %kind,
                        entity_id = %parent_id,
                        to = %parent_applied.pending.to_status,
                        "cascade completed parent"
                    );
                    events.push(CascadeEvent {
                        target_kind: kind,
                        target_id: parent_id,
                        from_status: Some(parent_applied.pending.from_status.clone()),
                        to_status: Some(parent_applied.pending.to_status.clone()),
                        applied: true,
                        automatic: true,
                        error: None,
                        child_cascades: Vec::new(),
                    });
                    if let Some(grandparent) = updated.header.parent_id {
                        queue.push_back((grandparent, depth + 1));
                    }
                }
                Err(e) => {
                    tracing::info!(
                        kind = %kind,
                        entity_id = %parent_id,
                        error = %e,
                        "cascade attempt rejected"
                    );
                    events.push(CascadeEvent {
                        target_kind: kind,
                        target_id: parent_id,
                        from_status: Some(parent.header.status.clone()),
                        to_status: None,
                        applied: false,
                        automatic: true,
                        error: Some(e.to_string()),
                        child_cascades: Vec::new(),
                    });
                    break;
                }
            }
        }
    }

    /// Tasks downstream of the transitioned task whose dependency gate
    /// newly passes: the edge's threshold was unmet before this move and
    /// is met now, and no other incoming edge still blocks the target.
    async fn detect_unblocked(
        &self,
        origin: &WorkItem,
        applied: &AppliedTransition,
    ) -> Result<Vec<Uuid>> {
        let old_role = applied.pending.from_role;
        let new_role = applied.pending.to_role;
        if new_role <= old_role {
            return Ok(Vec::new());
        }

        let store = self.executor.store();
        let deps = store.find_by_task(origin.id(), Direction::All).await?;
        let mut unblocked = BTreeSet::new();
        for dep in deps {
            let Some((source, target, threshold)) = dep.normalized() else {
                continue;
            };
            if source != origin.id() {
                continue;
            }
            if old_role >= threshold || new_role < threshold {
                continue;
            }
            let blockers = self.executor.load_blockers(target).await?;
            if blockers.iter().all(|edge| edge.is_satisfied()) {
                unblocked.insert(target);
            }
        }
        Ok(unblocked.into_iter().collect())
    }
}
