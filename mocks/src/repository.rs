//! In-memory implementation of the entity store traits.
//!
//! Mirrors the SQLite store's observable semantics — version-checked
//! updates, batch atomicity, cascade deletes, filter ordering — over
//! plain hash maps, so service and protocol tests run without a database.

use async_trait::async_trait;
use chrono::Utc;
use flow_core::{
    error::{OrchestratorError, Result},
    models::{
        Dependency, Direction, EntityKind, KindData, Role, RoleTransitionRecord, Section,
        TimeRange, UpdateWorkItem, WorkItem, WorkItemFilter,
    },
    repository::{
        DependencyRepository, SectionRepository, TransitionLogRepository, WorkItemRepository,
    },
};
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    items: HashMap<Uuid, WorkItem>,
    dependencies: HashMap<Uuid, Dependency>,
    sections: HashMap<Uuid, Section>,
    transitions: Vec<RoleTransitionRecord>,
}

/// Thread-safe in-memory entity store for tests.
#[derive(Default)]
pub struct InMemoryEntityStore {
    inner: RwLock<Inner>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored work items.
    pub fn item_count(&self) -> usize {
        self.inner.read().items.len()
    }

    /// Number of stored dependency edges.
    pub fn dependency_count(&self) -> usize {
        self.inner.read().dependencies.len()
    }

    /// Direct snapshot of the audit log, oldest first.
    pub fn transition_log(&self) -> Vec<RoleTransitionRecord> {
        self.inner.read().transitions.clone()
    }

    /// Insert an item directly, bypassing batch validation. Test setup
    /// only.
    pub fn seed_item(&self, item: WorkItem) {
        self.inner.write().items.insert(item.id(), item);
    }
}

fn apply_patch(item: &mut WorkItem, patch: &UpdateWorkItem) {
    if let Some(title) = &patch.title {
        item.header.title = title.clone();
    }
    if let Some(description) = &patch.description {
        item.header.description = description.clone();
    }
    if let Some(summary) = &patch.summary {
        item.header.summary = summary.clone();
    }
    if let Some(status) = &patch.status {
        item.header.status = status.clone();
    }
    if let Some(parent_id) = &patch.parent_id {
        item.header.parent_id = *parent_id;
    }
    if let Some(tags) = &patch.tags {
        item.header.tags = tags.clone();
    }
    if let Some(priority) = patch.priority {
        match &mut item.data {
            KindData::Feature { priority: p, .. } | KindData::Task { priority: p, .. } => {
                *p = priority;
            }
            KindData::Project => {}
        }
    }
    if let Some(complexity) = patch.complexity {
        if let KindData::Task { complexity: c, .. } = &mut item.data {
            *c = complexity;
        }
    }
    if let Some(requires_verification) = patch.requires_verification {
        match &mut item.data {
            KindData::Feature {
                requires_verification: r,
                ..
            }
            | KindData::Task {
                requires_verification: r,
                ..
            } => *r = requires_verification,
            KindData::Project => {}
        }
    }
    item.header.version += 1;
    item.header.modified_at = Utc::now();
}

fn matches_filter(item: &WorkItem, filter: &WorkItemFilter) -> bool {
    if !filter.tags.iter().all(|t| item.header.tags.contains(t)) {
        return false;
    }
    if !filter.status_in.is_empty() && !filter.status_in.contains(&item.header.status) {
        return false;
    }
    if filter.status_not_in.contains(&item.header.status) {
        return false;
    }
    if !filter.priority_in.is_empty()
        && !item
            .priority()
            .map(|p| filter.priority_in.contains(&p))
            .unwrap_or(false)
    {
        return false;
    }
    if !filter.priority_not_in.is_empty()
        && item
            .priority()
            .map(|p| filter.priority_not_in.contains(&p))
            .unwrap_or(false)
    {
        return false;
    }
    if let Some(parent_id) = filter.parent_id {
        if item.header.parent_id != Some(parent_id) {
            return false;
        }
    }
    if let Some(text) = &filter.text {
        let needle = text.to_lowercase();
        let in_title = item.header.title.to_lowercase().contains(&needle);
        let in_description = item
            .header
            .description
            .as_deref()
            .unwrap_or("")
            .to_lowercase()
            .contains(&needle);
        if !in_title && !in_description {
            return false;
        }
    }
    true
}

fn collect_descendants(inner: &Inner, roots: &[Uuid]) -> Vec<Uuid> {
    let mut all: Vec<Uuid> = roots.to_vec();
    let mut frontier: Vec<Uuid> = roots.to_vec();
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for item in inner.items.values() {
            if let Some(parent) = item.header.parent_id {
                if frontier.contains(&parent) && !all.contains(&item.id()) {
                    all.push(item.id());
                    next.push(item.id());
                }
            }
        }
        frontier = next;
    }
    all
}

fn remove_items(inner: &mut Inner, ids: &[Uuid]) -> u64 {
    let mut removed = 0;
    for id in ids {
        inner
            .dependencies
            .retain(|_, dep| dep.from_task_id != *id && dep.to_task_id != *id);
        inner.sections.retain(|_, section| section.entity_id != *id);
        if inner.items.remove(id).is_some() {
            removed += 1;
        }
    }
    removed
}

fn item_has_children(inner: &Inner, id: Uuid) -> bool {
    let has_child_items = inner
        .items
        .values()
        .any(|item| item.header.parent_id == Some(id));
    let has_edges = inner
        .dependencies
        .values()
        .any(|dep| dep.from_task_id == id || dep.to_task_id == id);
    has_child_items || has_edges
}

#[async_trait]
impl WorkItemRepository for InMemoryEntityStore {
    async fn get(&self, kind: EntityKind, id: Uuid) -> Result<Option<WorkItem>> {
        Ok(self
            .inner
            .read()
            .items
            .get(&id)
            .filter(|item| item.kind() == kind)
            .cloned())
    }

    async fn get_any(&self, id: Uuid) -> Result<Option<WorkItem>> {
        Ok(self.inner.read().items.get(&id).cloned())
    }

    async fn list(&self, kind: EntityKind, filter: WorkItemFilter) -> Result<Vec<WorkItem>> {
        let inner = self.inner.read();
        let mut items: Vec<WorkItem> = inner
            .items
            .values()
            .filter(|item| item.kind() == kind && matches_filter(item, &filter))
            .cloned()
            .collect();
        items.sort_by(|a, b| {
            b.header
                .modified_at
                .cmp(&a.header.modified_at)
                .then(a.id().cmp(&b.id()))
        });
        let offset = filter.offset.unwrap_or(0) as usize;
        let items: Vec<WorkItem> = items.into_iter().skip(offset).collect();
        match filter.limit {
            Some(limit) => Ok(items.into_iter().take(limit as usize).collect()),
            None => Ok(items),
        }
    }

    async fn children_of(&self, parent_id: Uuid) -> Result<Vec<WorkItem>> {
        let inner = self.inner.read();
        let mut children: Vec<WorkItem> = inner
            .items
            .values()
            .filter(|item| item.header.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by(|a, b| {
            a.header
                .created_at
                .cmp(&b.header.created_at)
                .then(a.id().cmp(&b.id()))
        });
        Ok(children)
    }

    async fn create_batch(&self, items: Vec<WorkItem>) -> Result<()> {
        let mut inner = self.inner.write();
        // Validate everything up front so the batch is all-or-nothing.
        let mut incoming: Vec<Uuid> = Vec::with_capacity(items.len());
        for item in &items {
            if inner.items.contains_key(&item.id()) || incoming.contains(&item.id()) {
                return Err(OrchestratorError::Storage(format!(
                    "uniqueness violated: work item {} already exists",
                    item.id()
                )));
            }
            if let Some(parent) = item.header.parent_id {
                if !inner.items.contains_key(&parent) && !incoming.contains(&parent) {
                    return Err(OrchestratorError::Validation(
                        "referenced item does not exist".to_string(),
                    ));
                }
            }
            incoming.push(item.id());
        }
        for item in items {
            inner.items.insert(item.id(), item);
        }
        Ok(())
    }

    async fn update(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: UpdateWorkItem,
    ) -> Result<WorkItem> {
        let mut inner = self.inner.write();
        let item = inner
            .items
            .get_mut(&id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("work item {id} not found")))?;
        if item.header.version != expected_version {
            return Err(OrchestratorError::VersionMismatch {
                expected: expected_version,
                actual: item.header.version,
            });
        }
        apply_patch(item, &patch);
        Ok(item.clone())
    }

    async fn update_batch(
        &self,
        updates: Vec<(Uuid, i64, UpdateWorkItem)>,
    ) -> Result<Vec<WorkItem>> {
        let mut inner = self.inner.write();
        // Check every precondition before touching anything.
        for (id, expected_version, _) in &updates {
            let item = inner
                .items
                .get(id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("work item {id} not found")))?;
            if item.header.version != *expected_version {
                return Err(OrchestratorError::VersionMismatch {
                    expected: *expected_version,
                    actual: item.header.version,
                });
            }
        }
        let mut out = Vec::with_capacity(updates.len());
        for (id, _, patch) in &updates {
            let item = inner
                .items
                .get_mut(id)
                .ok_or_else(|| OrchestratorError::NotFound(format!("work item {id} not found")))?;
            apply_patch(item, patch);
            out.push(item.clone());
        }
        Ok(out)
    }

    async fn delete(&self, id: Uuid, cascade: bool) -> Result<bool> {
        let mut inner = self.inner.write();
        if !inner.items.contains_key(&id) {
            return Ok(false);
        }
        if !cascade && item_has_children(&inner, id) {
            return Err(OrchestratorError::HasChildren);
        }
        let targets = if cascade {
            collect_descendants(&inner, &[id])
        } else {
            vec![id]
        };
        remove_items(&mut inner, &targets);
        Ok(true)
    }

    async fn delete_batch(&self, ids: Vec<Uuid>, cascade: bool) -> Result<u64> {
        let mut inner = self.inner.write();
        for id in &ids {
            if !inner.items.contains_key(id) {
                return Err(OrchestratorError::NotFound(format!(
                    "work item {id} not found"
                )));
            }
            if !cascade && item_has_children(&inner, *id) {
                return Err(OrchestratorError::HasChildren);
            }
        }
        let targets = if cascade {
            collect_descendants(&inner, &ids)
        } else {
            ids
        };
        Ok(remove_items(&mut inner, &targets))
    }

    async fn has_children(&self, id: Uuid) -> Result<bool> {
        Ok(item_has_children(&self.inner.read(), id))
    }
}

#[async_trait]
impl DependencyRepository for InMemoryEntityStore {
    async fn get_dependency(&self, id: Uuid) -> Result<Option<Dependency>> {
        Ok(self.inner.read().dependencies.get(&id).cloned())
    }

    async fn create_dependencies(&self, deps: Vec<Dependency>) -> Result<()> {
        let mut inner = self.inner.write();
        for dep in &deps {
            let duplicate = inner.dependencies.values().any(|existing| {
                existing.from_task_id == dep.from_task_id
                    && existing.to_task_id == dep.to_task_id
                    && existing.dep_type == dep.dep_type
            });
            if duplicate {
                return Err(OrchestratorError::Storage(format!(
                    "uniqueness violated: duplicate {} edge",
                    dep.dep_type
                )));
            }
            if !inner.items.contains_key(&dep.from_task_id)
                || !inner.items.contains_key(&dep.to_task_id)
            {
                return Err(OrchestratorError::Validation(
                    "referenced item does not exist".to_string(),
                ));
            }
        }
        for dep in deps {
            inner.dependencies.insert(dep.id, dep);
        }
        Ok(())
    }

    async fn delete_dependency(&self, id: Uuid) -> Result<bool> {
        Ok(self.inner.write().dependencies.remove(&id).is_some())
    }

    async fn find_by_task(&self, task_id: Uuid, direction: Direction) -> Result<Vec<Dependency>> {
        let inner = self.inner.read();
        let mut deps: Vec<Dependency> = inner
            .dependencies
            .values()
            .filter(|dep| match direction {
                Direction::Outgoing => dep.from_task_id == task_id,
                Direction::Incoming => dep.to_task_id == task_id,
                Direction::All => dep.from_task_id == task_id || dep.to_task_id == task_id,
            })
            .cloned()
            .collect();
        deps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(deps)
    }

    async fn all_dependencies(&self) -> Result<Vec<Dependency>> {
        let inner = self.inner.read();
        let mut deps: Vec<Dependency> = inner.dependencies.values().cloned().collect();
        deps.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(deps)
    }

    async fn delete_for_task(&self, task_id: Uuid) -> Result<u64> {
        let mut inner = self.inner.write();
        let before = inner.dependencies.len();
        inner
            .dependencies
            .retain(|_, dep| dep.from_task_id != task_id && dep.to_task_id != task_id);
        Ok((before - inner.dependencies.len()) as u64)
    }
}

#[async_trait]
impl SectionRepository for InMemoryEntityStore {
    async fn create_sections(&self, sections: Vec<Section>) -> Result<()> {
        let mut inner = self.inner.write();
        for section in sections {
            inner.sections.insert(section.id, section);
        }
        Ok(())
    }

    async fn sections_for(&self, entity_id: Uuid) -> Result<Vec<Section>> {
        let inner = self.inner.read();
        let mut sections: Vec<Section> = inner
            .sections
            .values()
            .filter(|section| section.entity_id == entity_id)
            .cloned()
            .collect();
        sections.sort_by(|a, b| a.ordinal.cmp(&b.ordinal).then(a.id.cmp(&b.id)));
        Ok(sections)
    }

    async fn delete_sections_for(&self, entity_id: Uuid) -> Result<u64> {
        let mut inner = self.inner.write();
        let before = inner.sections.len();
        inner.sections.retain(|_, section| section.entity_id != entity_id);
        Ok((before - inner.sections.len()) as u64)
    }
}

#[async_trait]
impl TransitionLogRepository for InMemoryEntityStore {
    async fn append_role_transition(&self, record: RoleTransitionRecord) -> Result<()> {
        self.inner.write().transitions.push(record);
        Ok(())
    }

    async fn list_role_transitions(
        &self,
        entity_id: Uuid,
        range: TimeRange,
    ) -> Result<Vec<RoleTransitionRecord>> {
        let inner = self.inner.read();
        let mut records: Vec<RoleTransitionRecord> = inner
            .transitions
            .iter()
            .filter(|record| record.entity_id == entity_id)
            .filter(|record| range.from.map_or(true, |from| record.created_at >= from))
            .filter(|record| range.to.map_or(true, |to| record.created_at <= to))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    async fn has_role_entry(&self, entity_id: Uuid, role: Role) -> Result<bool> {
        Ok(self
            .inner
            .read()
            .transitions
            .iter()
            .any(|record| record.entity_id == entity_id && record.to_role == role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::WorkItemBuilder;

    #[tokio::test]
    async fn version_checked_update() {
        let store = InMemoryEntityStore::new();
        let item = WorkItemBuilder::task("T").build();
        let id = item.id();
        store.seed_item(item);

        let patch = UpdateWorkItem {
            summary: Some("done".to_string()),
            ..Default::default()
        };
        let updated = store.update(id, 1, patch.clone()).await.unwrap();
        assert_eq!(updated.header.version, 2);

        let err = store.update(id, 1, patch).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::VersionMismatch {
                expected: 1,
                actual: 2
            }
        ));
    }

    #[tokio::test]
    async fn delete_without_cascade_refuses_children() {
        let store = InMemoryEntityStore::new();
        let feature = WorkItemBuilder::feature("F").build();
        let feature_id = feature.id();
        let task = WorkItemBuilder::task("T").parent(feature_id).build();
        store.seed_item(feature);
        store.seed_item(task);

        let err = store.delete(feature_id, false).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::HasChildren));

        assert!(store.delete(feature_id, true).await.unwrap());
        assert_eq!(store.item_count(), 0);
    }
}
