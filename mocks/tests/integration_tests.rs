//! Service-level tests over the in-memory store, exercising the executor
//! and batch coordinator through the shared fixtures.

use flow_core::{
    error::OrchestratorError,
    models::{EntityKind, NewWorkItem, Role, Trigger, UpdateWorkItem},
    repository::WorkItemRepository,
    ErrorMode, UpdateSpec,
};
use mocks::{seeded_hierarchy, DependencyBuilder, ServiceStack, WorkItemBuilder};

#[tokio::test]
async fn executor_walks_the_default_task_flow() {
    let stack = ServiceStack::new();
    let (_, _, tasks) = seeded_hierarchy(&stack, 1);
    let task = tasks[0];

    let result = stack
        .executor
        .apply_transition(EntityKind::Task, task, Trigger::Start, "s")
        .await
        .unwrap();
    assert_eq!(result.previous_status, "pending");
    assert_eq!(result.new_status, "in-progress");
    assert_eq!(result.new_role, Role::Work);
    assert_eq!(result.active_flow, "default_flow");
    assert_eq!(result.flow_position, Some(1));
    assert_eq!(result.version, 2);

    let result = stack
        .executor
        .apply_transition(EntityKind::Task, task, Trigger::Start, "s")
        .await
        .unwrap();
    assert_eq!(result.new_status, "in-review");

    let result = stack
        .executor
        .apply_transition(EntityKind::Task, task, Trigger::Complete, "s")
        .await
        .unwrap();
    assert_eq!(result.new_role, Role::Terminal);
}

#[tokio::test]
async fn executor_tracks_versions_across_external_writes() {
    let stack = ServiceStack::new();
    let task = WorkItemBuilder::task("T").summary("s").build();
    let id = task.id();
    stack.store.seed_item(task);

    // A cooperating client already bumped the version; the executor reads
    // the current state and writes against it.
    stack
        .store
        .update(
            id,
            1,
            UpdateWorkItem {
                description: Some(Some("racing".to_string())),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let result = stack
        .executor
        .apply_transition(EntityKind::Task, id, Trigger::Start, "s")
        .await
        .unwrap();
    assert_eq!(result.new_status, "in-progress");
    assert_eq!(result.version, 3);
}

#[tokio::test]
async fn next_status_survey_reports_resolvable_triggers() {
    let stack = ServiceStack::new();
    let task = WorkItemBuilder::task("T").build();
    let id = task.id();
    stack.store.seed_item(task);

    let info = stack
        .executor
        .next_status(EntityKind::Task, id, None)
        .await
        .unwrap();
    assert_eq!(info.current_status, "pending");
    assert_eq!(info.current_role, Role::Queue);
    let start = info
        .targets
        .iter()
        .find(|t| t.trigger == Trigger::Start)
        .unwrap();
    assert_eq!(start.status, "in-progress");

    // An explicit unresolvable trigger is an error, not an empty survey.
    let done = WorkItemBuilder::task("D").status("completed").summary("s").build();
    let done_id = done.id();
    stack.store.seed_item(done);
    let err = stack
        .executor
        .next_status(EntityKind::Task, done_id, Some(Trigger::Start))
        .await
        .unwrap_err();
    assert_eq!(err, OrchestratorError::AlreadyTerminal);
}

#[tokio::test]
async fn per_item_batches_commit_the_valid_subset() {
    let stack = ServiceStack::new();

    let good = NewWorkItem::new(EntityKind::Task, "Good");
    let mut bad = NewWorkItem::new(EntityKind::Task, "Bad");
    bad.complexity = Some(99);

    let outcome = stack
        .coordinator
        .create_items(
            EntityKind::Task,
            vec![good, bad],
            ErrorMode::PerItem,
            "s",
        )
        .await
        .unwrap();
    assert_eq!(outcome.applied.len(), 1);
    assert_eq!(outcome.rejected.len(), 1);
    assert_eq!(outcome.rejected[0].index, 1);
    assert_eq!(outcome.rejected[0].code, "VALIDATION_ERROR");
    assert_eq!(stack.store.item_count(), 1);
}

#[tokio::test]
async fn atomic_batches_reject_everything_on_one_failure() {
    let stack = ServiceStack::new();

    let good = NewWorkItem::new(EntityKind::Task, "Good");
    let mut bad = NewWorkItem::new(EntityKind::Task, "Bad");
    bad.complexity = Some(99);

    let err = stack
        .coordinator
        .create_items(EntityKind::Task, vec![good, bad], ErrorMode::Atomic, "s")
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(stack.store.item_count(), 0);
}

#[tokio::test]
async fn update_batch_checks_versions_per_item() {
    let stack = ServiceStack::new();
    let task = WorkItemBuilder::task("T").build();
    let id = task.id();
    stack.store.seed_item(task);

    let spec = |version| UpdateSpec {
        id,
        expected_version: version,
        patch: UpdateWorkItem {
            summary: Some("patched".to_string()),
            ..Default::default()
        },
    };

    let outcome = stack
        .coordinator
        .update_items(EntityKind::Task, vec![spec(1)], ErrorMode::Atomic, "s")
        .await
        .unwrap();
    assert_eq!(outcome.applied, vec![id]);

    let outcome = stack
        .coordinator
        .update_items(EntityKind::Task, vec![spec(1)], ErrorMode::PerItem, "s")
        .await
        .unwrap();
    assert!(outcome.applied.is_empty());
    assert_eq!(outcome.rejected[0].code, "VERSION_MISMATCH");
}

#[tokio::test]
async fn deleting_the_last_open_sibling_completes_the_parent() {
    let stack = ServiceStack::new();
    let (project_id, feature_id, tasks) = seeded_hierarchy(&stack, 2);

    // One sibling finishes; the other is removed.
    stack
        .executor
        .apply_transition(EntityKind::Task, tasks[0], Trigger::Complete, "s")
        .await
        .unwrap();
    let outcome = stack
        .coordinator
        .delete_items(
            EntityKind::Task,
            vec![tasks[1]],
            false,
            ErrorMode::Atomic,
            "s",
        )
        .await
        .unwrap();

    // The feature (and then the project) completed by cascade.
    assert_eq!(outcome.cascade_events.len(), 2);
    assert!(outcome.cascade_events.iter().all(|e| e.applied));
    let feature = stack.store.get_any(feature_id).await.unwrap().unwrap();
    assert_eq!(feature.header.status, "completed");
    let project = stack.store.get_any(project_id).await.unwrap().unwrap();
    assert_eq!(project.header.status, "completed");
}

#[tokio::test]
async fn blocked_task_reports_its_blockers() {
    let stack = ServiceStack::new();
    let upstream = WorkItemBuilder::task("Upstream").build();
    let downstream = WorkItemBuilder::task("Downstream").build();
    let (up_id, down_id) = (upstream.id(), downstream.id());
    stack.store.seed_item(upstream);
    stack.store.seed_item(downstream);

    use flow_core::repository::DependencyRepository;
    stack
        .store
        .create_dependencies(vec![DependencyBuilder::blocks(up_id, down_id).build()])
        .await
        .unwrap();

    let err = stack
        .executor
        .apply_transition(EntityKind::Task, down_id, Trigger::Start, "s")
        .await
        .unwrap_err();
    match err {
        OrchestratorError::BlockedBy { blockers } => {
            assert_eq!(blockers.len(), 1);
            assert_eq!(blockers[0].task_id, up_id);
            assert_eq!(blockers[0].role, Role::Queue);
        }
        other => panic!("expected BlockedBy, got {other:?}"),
    }
}
