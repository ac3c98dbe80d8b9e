//! Standard test fixtures for consistent testing
//!
//! Provides a pre-wired service stack (in-memory store, lock manager,
//! built-in flow configuration, executor, batch coordinator) plus common
//! seeded hierarchies.

use crate::builders::WorkItemBuilder;
use crate::repository::InMemoryEntityStore;
use flow_core::{
    batch::BatchCoordinator, executor::TransitionExecutor, flow::FlowConfig, lock::LockManager,
};
use std::sync::Arc;
use uuid::Uuid;

/// The built-in flow configuration, shared the way production wiring
/// shares it.
pub fn flow_config() -> Arc<FlowConfig> {
    Arc::new(FlowConfig::default())
}

/// Fully wired service stack over an in-memory store.
pub struct ServiceStack {
    pub store: Arc<InMemoryEntityStore>,
    pub locks: Arc<LockManager>,
    pub config: Arc<FlowConfig>,
    pub executor: TransitionExecutor<InMemoryEntityStore>,
    pub coordinator: BatchCoordinator<InMemoryEntityStore>,
}

impl ServiceStack {
    pub fn new() -> Self {
        Self::with_config(flow_config())
    }

    pub fn with_config(config: Arc<FlowConfig>) -> Self {
        let store = Arc::new(InMemoryEntityStore::new());
        let locks = Arc::new(LockManager::new());
        let executor =
            TransitionExecutor::new(Arc::clone(&store), Arc::clone(&locks), Arc::clone(&config));
        let coordinator = BatchCoordinator::new(executor.clone());
        Self {
            store,
            locks,
            config,
            executor,
            coordinator,
        }
    }
}

impl Default for ServiceStack {
    fn default() -> Self {
        Self::new()
    }
}

/// A project with one feature and `task_count` pending tasks under the
/// feature. Returns `(project_id, feature_id, task_ids)`.
pub fn seeded_hierarchy(stack: &ServiceStack, task_count: usize) -> (Uuid, Uuid, Vec<Uuid>) {
    let project = WorkItemBuilder::project("Platform").summary("p").build();
    let project_id = project.id();
    stack.store.seed_item(project);

    let feature = WorkItemBuilder::feature("Search")
        .summary("f")
        .parent(project_id)
        .build();
    let feature_id = feature.id();
    stack.store.seed_item(feature);

    let mut task_ids = Vec::with_capacity(task_count);
    for n in 0..task_count {
        let task = WorkItemBuilder::task(&format!("Task {n}"))
            .summary("t")
            .parent(feature_id)
            .build();
        task_ids.push(task.id());
        stack.store.seed_item(task);
    }
    (project_id, feature_id, task_ids)
}
