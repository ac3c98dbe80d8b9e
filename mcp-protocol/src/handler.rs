//! Command handler
//!
//! Implements the `ProtocolHandler` trait over the core services: the
//! transition executor, the batch coordinator, the dependency graph
//! service and the entity store. This is where tool commands become core
//! operations; the rmcp router in [`crate::rmcp_handler`] only parses and
//! renders.

use async_trait::async_trait;
use chrono::Utc;
use flow_core::{
    batch::BatchCoordinator,
    error::{OrchestratorError, Result},
    executor::{NextStatusInfo, TransitionExecutor},
    flow::FlowConfig,
    graph,
    lock::{LockKey, LockManager},
    models::{Dependency, EntityKind, NewDependency, TimeRange},
    protocol::{
        ContainerOperation, DependencyOperation, DependencyQueryResult, DependencyView,
        DependencyWriteResult, ErrorBody, GetNextStatusParams, ManageContainerParams,
        ManageDependenciesParams, NeighborSummary, ProtocolHandler, QueryContainerParams,
        QueryDependenciesParams, QueryRoleTransitionsParams, RequestTransitionParams,
        RoleTransitionView, TransitionReport, WorkItemView, DEFAULT_SESSION,
    },
    repository::EntityStore,
    BatchOutcome,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Protocol handler wired over an entity store.
pub struct OrchestratorHandler<S> {
    store: Arc<S>,
    locks: Arc<LockManager>,
    config: Arc<FlowConfig>,
    executor: TransitionExecutor<S>,
    coordinator: BatchCoordinator<S>,
}

impl<S: EntityStore> OrchestratorHandler<S> {
    pub fn new(store: Arc<S>, locks: Arc<LockManager>, config: Arc<FlowConfig>) -> Self {
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

    pub fn config(&self) -> &Arc<FlowConfig> {
        &self.config
    }

    /// Check that every listed id refers to an existing task; dependency
    /// edges only connect tasks.
    async fn require_tasks(&self, ids: &BTreeSet<Uuid>) -> Result<()> {
        for id in ids {
            match self.store.get_any(*id).await? {
                Some(item) if item.kind() == EntityKind::Task => {}
                Some(item) => {
                    return Err(OrchestratorError::Validation(format!(
                        "dependencies connect tasks, but {id} is a {}",
                        item.kind()
                    )))
                }
                None => return Err(OrchestratorError::not_found(EntityKind::Task, *id)),
            }
        }
        Ok(())
    }

    async fn create_dependencies(
        &self,
        edges: Vec<NewDependency>,
        session: &str,
    ) -> Result<DependencyWriteResult> {
        for edge in &edges {
            graph::validate_edge_endpoints(edge)?;
        }
        let involved: BTreeSet<Uuid> = edges
            .iter()
            .flat_map(|e| [e.from_task_id, e.to_task_id])
            .collect();
        self.require_tasks(&involved).await?;

        let now = Utc::now();
        let candidates: Vec<Dependency> = edges
            .into_iter()
            .map(|edge| Dependency {
                id: Uuid::new_v4(),
                from_task_id: edge.from_task_id,
                to_task_id: edge.to_task_id,
                dep_type: edge.dep_type,
                unblock_at: edge.unblock_at,
                created_at: now,
            })
            .collect();

        // The whole batch is screened against the existing graph at once;
        // a cycle or duplicate anywhere rejects everything.
        let existing = self.store.all_dependencies().await?;
        graph::screen_batch(&existing, &candidates)?;

        let keys: Vec<LockKey> = involved
            .iter()
            .map(|&id| LockKey::new(EntityKind::Task, id))
            .collect();
        let held = self.locks.acquire_many(&keys, session, None)?;
        let outcome = self.store.create_dependencies(candidates.clone()).await;
        for lock in &held {
            self.locks.release(lock);
        }
        outcome?;

        tracing::info!(created = candidates.len(), "dependency batch committed");
        Ok(DependencyWriteResult {
            created: candidates.iter().map(DependencyView::from).collect(),
            deleted: Vec::new(),
            cascade_events: Vec::new(),
            unblocked_tasks: Vec::new(),
        })
    }

    async fn delete_dependencies(
        &self,
        ids: Vec<Uuid>,
        session: &str,
    ) -> Result<DependencyWriteResult> {
        if ids.is_empty() {
            return Err(OrchestratorError::Validation(
                "no dependency ids to delete".to_string(),
            ));
        }

        let mut edges = Vec::with_capacity(ids.len());
        for id in &ids {
            let edge = self
                .store
                .get_dependency(*id)
                .await?
                .ok_or_else(|| OrchestratorError::dependency_not_found(*id))?;
            edges.push(edge);
        }

        let involved: BTreeSet<Uuid> = edges
            .iter()
            .flat_map(|e| [e.from_task_id, e.to_task_id])
            .collect();
        let keys: Vec<LockKey> = involved
            .iter()
            .map(|&id| LockKey::new(EntityKind::Task, id))
            .collect();
        let held = self.locks.acquire_many(&keys, session, None)?;

        let mut deleted = Vec::new();
        let mut unblock_candidates: BTreeSet<Uuid> = BTreeSet::new();
        let mut failure = None;
        for edge in &edges {
            match self.store.delete_dependency(edge.id).await {
                Ok(true) => {
                    deleted.push(edge.id);
                    if let Some((_, target, _)) = edge.normalized() {
                        unblock_candidates.insert(target);
                    }
                }
                Ok(false) => {
                    failure = Some(OrchestratorError::dependency_not_found(edge.id));
                    break;
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        for lock in &held {
            self.locks.release(lock);
        }
        if let Some(e) = failure {
            return Err(e);
        }

        // Dropping a blocking edge may leave the target fully unblocked.
        let mut unblocked_tasks = Vec::new();
        for candidate in unblock_candidates {
            if self.store.get_any(candidate).await?.is_none() {
                continue;
            }
            let blockers = self.executor.load_blockers(candidate).await?;
            if blockers.iter().all(|edge| edge.is_satisfied()) {
                unblocked_tasks.push(candidate);
            }
        }

        Ok(DependencyWriteResult {
            created: Vec::new(),
            deleted,
            cascade_events: Vec::new(),
            unblocked_tasks,
        })
    }
}

#[async_trait]
impl<S: EntityStore + 'static> ProtocolHandler for OrchestratorHandler<S> {
    async fn manage_container(&self, params: ManageContainerParams) -> Result<BatchOutcome> {
        let session = params
            .session
            .clone()
            .unwrap_or_else(|| DEFAULT_SESSION.to_string());

        match params.operation {
            ContainerOperation::Create => {
                let mut specs = Vec::with_capacity(params.items.len());
                for item in params.items {
                    specs.push(item.into_new_item(params.kind, &params.shared_defaults)?);
                }
                self.coordinator
                    .create_items(params.kind, specs, params.error_mode, &session)
                    .await
            }
            ContainerOperation::Update => {
                let mut specs = Vec::with_capacity(params.items.len());
                for item in params.items {
                    specs.push(item.into_update_spec()?);
                }
                self.coordinator
                    .update_items(params.kind, specs, params.error_mode, &session)
                    .await
            }
            ContainerOperation::Delete => {
                let ids = if params.ids.is_empty() {
                    params.items.iter().filter_map(|item| item.id).collect()
                } else {
                    params.ids.clone()
                };
                self.coordinator
                    .delete_items(params.kind, ids, params.force, params.error_mode, &session)
                    .await
            }
        }
    }

    async fn request_transition(
        &self,
        params: RequestTransitionParams,
    ) -> Result<Vec<TransitionReport>> {
        let requests = params.normalize()?;
        let session = params
            .session
            .clone()
            .unwrap_or_else(|| DEFAULT_SESSION.to_string());

        // A lone request propagates its failure as the response; a batch
        // reports per entry.
        if requests.len() == 1 {
            let request = requests[0];
            let result = self
                .executor
                .apply_transition(request.entity_kind, request.id, request.trigger, &session)
                .await?;
            return Ok(vec![TransitionReport {
                request,
                success: true,
                result: Some(result),
                error: None,
            }]);
        }

        let mut reports = Vec::with_capacity(requests.len());
        for request in requests {
            match self
                .executor
                .apply_transition(request.entity_kind, request.id, request.trigger, &session)
                .await
            {
                Ok(result) => reports.push(TransitionReport {
                    request,
                    success: true,
                    result: Some(result),
                    error: None,
                }),
                Err(e) => reports.push(TransitionReport {
                    request,
                    success: false,
                    result: None,
                    error: Some(ErrorBody::from_error(&e)),
                }),
            }
        }
        Ok(reports)
    }

    async fn manage_dependencies(
        &self,
        params: ManageDependenciesParams,
    ) -> Result<DependencyWriteResult> {
        let session = params
            .session
            .clone()
            .unwrap_or_else(|| DEFAULT_SESSION.to_string());
        match params.operation {
            DependencyOperation::Create => {
                let edges = params.expand_edges()?;
                self.create_dependencies(edges, &session).await
            }
            DependencyOperation::Delete => {
                self.delete_dependencies(params.ids.clone(), &session).await
            }
        }
    }

    async fn query_container(&self, params: QueryContainerParams) -> Result<Vec<WorkItemView>> {
        let items = match params.id {
            Some(id) => match self.store.get(params.kind, id).await? {
                Some(item) => vec![item],
                None => return Err(OrchestratorError::not_found(params.kind, id)),
            },
            None => self.store.list(params.kind, params.filter.clone()).await?,
        };

        let mut views = Vec::with_capacity(items.len());
        for item in &items {
            let mut view = WorkItemView::from_item(item, &self.config)?;
            if params.include_sections {
                view.sections = Some(self.store.sections_for(item.id()).await?);
            }
            views.push(view);
        }
        Ok(views)
    }

    async fn query_dependencies(
        &self,
        params: QueryDependenciesParams,
    ) -> Result<DependencyQueryResult> {
        let task = self
            .store
            .get(EntityKind::Task, params.task_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found(EntityKind::Task, params.task_id))?;

        if params.neighbors_only {
            let deps = self.store.find_by_task(task.id(), params.direction).await?;
            let mut summary = NeighborSummary::default();
            for dep in &deps {
                if let Some(filter) = params.dep_type {
                    if dep.dep_type != filter {
                        continue;
                    }
                }
                if dep.from_task_id == task.id() {
                    summary.outgoing.push(DependencyView::from(dep));
                } else {
                    summary.incoming.push(DependencyView::from(dep));
                }
            }
            summary.incoming_count = summary.incoming.len();
            summary.outgoing_count = summary.outgoing.len();
            return Ok(DependencyQueryResult {
                task_id: task.id(),
                neighbors: Some(summary),
                analysis: None,
            });
        }

        // Full traversal over the current snapshot.
        let tasks = self
            .store
            .list(EntityKind::Task, Default::default())
            .await?;
        let nodes: Vec<graph::GraphNode> = tasks
            .iter()
            .map(|t| {
                graph::GraphNode::new(
                    t.id(),
                    t.complexity()
                        .unwrap_or(flow_core::models::DEFAULT_COMPLEXITY),
                )
            })
            .collect();
        let deps = self.store.all_dependencies().await?;
        let options = graph::GraphQueryOptions {
            bottleneck_threshold: params
                .bottleneck_threshold
                .unwrap_or(graph::DEFAULT_BOTTLENECK_THRESHOLD),
            ..Default::default()
        };
        let analysis = graph::analyze(task.id(), &nodes, &deps, &options);
        Ok(DependencyQueryResult {
            task_id: task.id(),
            neighbors: None,
            analysis: Some(analysis),
        })
    }

    async fn query_role_transitions(
        &self,
        params: QueryRoleTransitionsParams,
    ) -> Result<Vec<RoleTransitionView>> {
        let range = TimeRange {
            from: params.from,
            to: params.to,
        };
        let records = self
            .store
            .list_role_transitions(params.entity_id, range)
            .await?;
        Ok(records.iter().map(RoleTransitionView::from).collect())
    }

    async fn get_next_status(&self, params: GetNextStatusParams) -> Result<NextStatusInfo> {
        self.executor
            .next_status(params.entity_kind, params.id, params.trigger)
            .await
    }
}
