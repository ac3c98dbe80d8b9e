//! Trigger resolution and prerequisite validation.
//!
//! The validator is pure: callers assemble a [`TransitionContext`] with
//! everything the checks need (current item, dependency blocker states, the
//! review marker, child roles) and get back either the resolved move or a
//! typed failure. The executor owns all I/O.

use crate::error::{OrchestratorError, Result};
use crate::flow::FlowConfig;
use crate::models::{Blocker, EntityKind, Role, Trigger, WorkItem};
use uuid::Uuid;

/// An incoming blocks-normalised edge as seen from the task being
/// transitioned: who blocks it, at what role they currently are, and the
/// role they must reach for the edge to stop blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockerEdge {
    pub source_id: Uuid,
    pub source_role: Role,
    pub unblock_at: Role,
}

impl BlockerEdge {
    pub fn is_satisfied(&self) -> bool {
        self.source_role >= self.unblock_at
    }
}

/// A resolved status move, before it is written.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransition {
    pub from_status: String,
    pub to_status: String,
    pub from_role: Role,
    pub to_role: Role,
    pub flow_name: String,
}

/// Everything the prerequisite checks consume, prepared by the caller.
#[derive(Debug, Clone)]
pub struct TransitionContext<'a> {
    pub item: &'a WorkItem,
    pub config: &'a FlowConfig,
    /// Incoming blocks-normalised edges (tasks only; empty otherwise).
    pub blockers: &'a [BlockerEdge],
    /// Whether the entity has previously entered the Review role.
    pub has_review_entry: bool,
    /// Roles of direct children (projects and features only).
    pub child_roles: &'a [(Uuid, Role)],
}

/// Resolve a trigger to its target status without checking prerequisites.
///
/// * `start` moves to the next status in the active flow's sequence. A
///   status outside the sequence (an emergency status such as `blocked` or
///   `on-hold`) resumes at the first sequence status.
/// * `complete` jumps to the flow's terminal status, skipping intermediate
///   states.
/// * `cancel`, `block` and `hold` use the flow's emergency targets.
pub fn resolve_target(
    config: &FlowConfig,
    item: &WorkItem,
    trigger: Trigger,
) -> Result<PendingTransition> {
    let kind = item.kind();
    let flow = config.active_flow(kind, &item.header.tags);
    let current = item.header.status.as_str();
    let from_role = config.role_of(kind, current)?;

    let to_status: String = match trigger {
        Trigger::Start => {
            if from_role == Role::Terminal {
                return Err(OrchestratorError::AlreadyTerminal);
            }
            match flow.position_of(current) {
                Some(pos) => match flow.sequence.get(pos + 1) {
                    Some(next) => next.clone(),
                    None => return Err(OrchestratorError::AlreadyTerminal),
                },
                // Emergency statuses resume at the head of the sequence.
                None => flow.sequence[0].clone(),
            }
        }
        Trigger::Complete => {
            if from_role == Role::Terminal {
                return Err(OrchestratorError::AlreadyTerminal);
            }
            flow.terminal_status().to_string()
        }
        Trigger::Cancel | Trigger::Block | Trigger::Hold => {
            let target = flow.emergency.get(&trigger).ok_or_else(|| {
                OrchestratorError::Configuration(format!(
                    "flow '{}' has no emergency target for trigger '{trigger}'",
                    flow.name
                ))
            })?;
            if target == current {
                return Err(OrchestratorError::Validation(format!(
                    "item is already in status '{current}'"
                )));
            }
            target.clone()
        }
    };

    let to_role = config.role_of(kind, &to_status)?;

    Ok(PendingTransition {
        from_status: current.to_string(),
        to_status,
        from_role,
        to_role,
        flow_name: flow.name.clone(),
    })
}

/// Resolve a trigger and run the prerequisite gates, in order:
///
/// 1. status validity (holds by construction of the flow config),
/// 2. summary presence for terminal targets,
/// 3. verification gate for terminal targets of verification-required
///    items,
/// 4. dependency gate for tasks moving to Work or higher,
/// 5. child-completion gate for container `complete`, when the
///    configuration enforces it.
///
/// Emergency triggers bypass gates 2-5: they exist to get an item out of
/// the way from any state, and `cancel` is the one terminal entry that
/// does not demand a summary.
pub fn validate(ctx: &TransitionContext<'_>, trigger: Trigger) -> Result<PendingTransition> {
    let pending = resolve_target(ctx.config, ctx.item, trigger)?;
    if trigger.is_emergency() {
        return Ok(pending);
    }

    let kind = ctx.item.kind();

    if pending.to_role == Role::Terminal && !ctx.item.has_summary() {
        return Err(OrchestratorError::MissingSummary);
    }

    if pending.to_role == Role::Terminal
        && ctx.item.requires_verification()
        && !ctx.has_review_entry
    {
        return Err(OrchestratorError::VerificationRequired);
    }

    if kind == EntityKind::Task && pending.to_role >= Role::Work {
        let blockers: Vec<Blocker> = ctx
            .blockers
            .iter()
            .filter(|edge| !edge.is_satisfied())
            .map(|edge| Blocker {
                task_id: edge.source_id,
                role: edge.source_role,
            })
            .collect();
        if !blockers.is_empty() {
            return Err(OrchestratorError::BlockedBy { blockers });
        }
    }

    if kind != EntityKind::Task
        && trigger == Trigger::Complete
        && ctx.config.enforce_child_completion()
    {
        let pending_children: Vec<Uuid> = ctx
            .child_roles
            .iter()
            .filter(|(_, role)| *role != Role::Terminal)
            .map(|(id, _)| *id)
            .collect();
        if !pending_children.is_empty() {
            return Err(OrchestratorError::IncompleteChildren {
                pending: pending_children,
            });
        }
    }

    Ok(pending)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{KindData, Priority, WorkItemHeader};
    use chrono::Utc;

    fn task(status: &str, summary: &str) -> WorkItem {
        task_with_tags(status, summary, &[])
    }

    fn task_with_tags(status: &str, summary: &str, tags: &[&str]) -> WorkItem {
        WorkItem {
            header: WorkItemHeader {
                id: Uuid::new_v4(),
                title: "Index rebuild".to_string(),
                description: None,
                summary: summary.to_string(),
                status: status.to_string(),
                parent_id: None,
                tags: tags.iter().map(|t| t.to_string()).collect(),
                version: 1,
                created_at: Utc::now(),
                modified_at: Utc::now(),
            },
            data: KindData::Task {
                priority: Priority::Medium,
                complexity: 5,
                requires_verification: false,
            },
        }
    }

    fn feature(status: &str, summary: &str) -> WorkItem {
        WorkItem {
            header: WorkItemHeader {
                id: Uuid::new_v4(),
                title: "Search".to_string(),
                description: None,
                summary: summary.to_string(),
                status: status.to_string(),
                parent_id: None,
                tags: Vec::new(),
                version: 1,
                created_at: Utc::now(),
                modified_at: Utc::now(),
            },
            data: KindData::Feature {
                priority: Priority::Medium,
                requires_verification: false,
            },
        }
    }

    fn ctx<'a>(
        config: &'a FlowConfig,
        item: &'a WorkItem,
        blockers: &'a [BlockerEdge],
    ) -> TransitionContext<'a> {
        TransitionContext {
            item,
            config,
            blockers,
            has_review_entry: false,
            child_roles: &[],
        }
    }

    #[test]
    fn start_advances_through_the_sequence() {
        let config = FlowConfig::default();
        let item = task("pending", "");
        let pending = validate(&ctx(&config, &item, &[]), Trigger::Start).unwrap();
        assert_eq!(pending.to_status, "in-progress");
        assert_eq!(pending.from_role, Role::Queue);
        assert_eq!(pending.to_role, Role::Work);

        let item = task("in-progress", "");
        let pending = validate(&ctx(&config, &item, &[]), Trigger::Start).unwrap();
        assert_eq!(pending.to_status, "in-review");
        assert_eq!(pending.to_role, Role::Review);
    }

    #[test]
    fn start_on_terminal_fails() {
        let config = FlowConfig::default();
        let item = task("completed", "done");
        let err = validate(&ctx(&config, &item, &[]), Trigger::Start).unwrap_err();
        assert_eq!(err, OrchestratorError::AlreadyTerminal);
    }

    #[test]
    fn complete_skips_intermediate_states() {
        let config = FlowConfig::default();
        let item = task("pending", "all done");
        let pending = validate(&ctx(&config, &item, &[]), Trigger::Complete).unwrap();
        assert_eq!(pending.to_status, "completed");
        assert_eq!(pending.to_role, Role::Terminal);
    }

    #[test]
    fn complete_on_terminal_reports_already_terminal() {
        let config = FlowConfig::default();
        let item = task("completed", "done");
        let err = validate(&ctx(&config, &item, &[]), Trigger::Complete).unwrap_err();
        assert_eq!(err, OrchestratorError::AlreadyTerminal);
    }

    #[test]
    fn complete_without_summary_is_rejected() {
        let config = FlowConfig::default();
        let item = task("in-progress", "   ");
        let err = validate(&ctx(&config, &item, &[]), Trigger::Complete).unwrap_err();
        assert_eq!(err, OrchestratorError::MissingSummary);
    }

    #[test]
    fn verification_gate_requires_prior_review() {
        let config = FlowConfig::default();
        let mut item = task("in-progress", "shipped");
        item.data = KindData::Task {
            priority: Priority::Medium,
            complexity: 5,
            requires_verification: true,
        };

        let err = validate(&ctx(&config, &item, &[]), Trigger::Complete).unwrap_err();
        assert_eq!(err, OrchestratorError::VerificationRequired);

        let mut reviewed = ctx(&config, &item, &[]);
        reviewed.has_review_entry = true;
        assert!(validate(&reviewed, Trigger::Complete).is_ok());
    }

    #[test]
    fn dependency_gate_blocks_start() {
        let config = FlowConfig::default();
        let item = task("pending", "");
        let blocker_id = Uuid::new_v4();
        let blockers = [BlockerEdge {
            source_id: blocker_id,
            source_role: Role::Queue,
            unblock_at: Role::Terminal,
        }];

        let err = validate(&ctx(&config, &item, &blockers), Trigger::Start).unwrap_err();
        match err {
            OrchestratorError::BlockedBy { blockers } => {
                assert_eq!(blockers.len(), 1);
                assert_eq!(blockers[0].task_id, blocker_id);
                assert_eq!(blockers[0].role, Role::Queue);
            }
            other => panic!("expected BlockedBy, got {other:?}"),
        }
    }

    #[test]
    fn dependency_gate_honours_unblock_threshold() {
        let config = FlowConfig::default();
        let item = task("pending", "");

        // Source at Review with an unblock_at of Review: satisfied.
        let satisfied = [BlockerEdge {
            source_id: Uuid::new_v4(),
            source_role: Role::Review,
            unblock_at: Role::Review,
        }];
        assert!(validate(&ctx(&config, &item, &satisfied), Trigger::Start).is_ok());

        // Source at Work with the same threshold: still blocking.
        let unsatisfied = [BlockerEdge {
            source_id: Uuid::new_v4(),
            source_role: Role::Work,
            unblock_at: Role::Review,
        }];
        assert!(validate(&ctx(&config, &item, &unsatisfied), Trigger::Start).is_err());
    }

    #[test]
    fn emergency_triggers_bypass_gates() {
        let config = FlowConfig::default();
        // No summary and an unsatisfied blocker, yet cancel goes through.
        let item = task("in-progress", "");
        let blockers = [BlockerEdge {
            source_id: Uuid::new_v4(),
            source_role: Role::Queue,
            unblock_at: Role::Terminal,
        }];

        let pending = validate(&ctx(&config, &item, &blockers), Trigger::Cancel).unwrap();
        assert_eq!(pending.to_status, "cancelled");
        assert_eq!(pending.to_role, Role::Terminal);

        let pending = validate(&ctx(&config, &item, &blockers), Trigger::Block).unwrap();
        assert_eq!(pending.to_status, "blocked");
        assert_eq!(pending.to_role, Role::Blocked);

        let pending = validate(&ctx(&config, &item, &blockers), Trigger::Hold).unwrap();
        assert_eq!(pending.to_status, "on-hold");
    }

    #[test]
    fn start_resumes_from_emergency_status() {
        let config = FlowConfig::default();
        let item = task("blocked", "");
        let pending = validate(&ctx(&config, &item, &[]), Trigger::Start).unwrap();
        assert_eq!(pending.to_status, "pending");
        assert_eq!(pending.from_role, Role::Blocked);
    }

    #[test]
    fn tagged_flow_changes_resolution() {
        let config = FlowConfig::default();
        // Hotfix tasks go straight from in-progress to completed.
        let item = task_with_tags("in-progress", "patched", &["hotfix"]);
        let pending = validate(&ctx(&config, &item, &[]), Trigger::Start).unwrap();
        assert_eq!(pending.flow_name, "hotfix_flow");
        assert_eq!(pending.to_status, "completed");
    }

    #[test]
    fn child_gate_only_applies_when_configured() {
        let config = FlowConfig::default();
        let item = feature("in-progress", "ready");
        let child_roles = vec![(Uuid::new_v4(), Role::Work)];

        let mut context = ctx(&config, &item, &[]);
        context.child_roles = &child_roles;
        // Default configuration does not enforce the gate.
        assert!(validate(&context, Trigger::Complete).is_ok());

        let strict = FlowConfig::from_toml_str(
            &crate::flow::DEFAULT_FLOW_DOCUMENT
                .replace("enforce_child_completion = false", "enforce_child_completion = true"),
        )
        .unwrap();
        let mut context = ctx(&strict, &item, &[]);
        context.child_roles = &child_roles;
        let err = validate(&context, Trigger::Complete).unwrap_err();
        assert!(matches!(err, OrchestratorError::IncompleteChildren { .. }));
    }

    #[test]
    fn same_state_emergency_is_rejected() {
        let config = FlowConfig::default();
        let item = task("blocked", "");
        let err = validate(&ctx(&config, &item, &[]), Trigger::Block).unwrap_err();
        assert!(err.is_validation());
    }
}
