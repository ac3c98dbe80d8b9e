//! Builder pattern implementations for easy test data construction
//!
//! Provides fluent builders for:
//! - Work items of each kind with sensible defaults
//! - Dependency edges with type and threshold control

use chrono::{DateTime, Utc};
use flow_core::models::{
    Dependency, DependencyType, EntityKind, KindData, Priority, Role, WorkItem, WorkItemHeader,
    DEFAULT_COMPLEXITY,
};
use uuid::Uuid;

/// Builder for constructing work items in tests.
pub struct WorkItemBuilder {
    item: WorkItem,
}

impl WorkItemBuilder {
    fn new(kind: EntityKind, title: &str, status: &str) -> Self {
        let data = match kind {
            EntityKind::Project => KindData::Project,
            EntityKind::Feature => KindData::Feature {
                priority: Priority::Medium,
                requires_verification: false,
            },
            EntityKind::Task => KindData::Task {
                priority: Priority::Medium,
                complexity: DEFAULT_COMPLEXITY,
                requires_verification: false,
            },
        };
        Self {
            item: WorkItem {
                header: WorkItemHeader {
                    id: Uuid::new_v4(),
                    title: title.to_string(),
                    description: None,
                    summary: String::new(),
                    status: status.to_string(),
                    parent_id: None,
                    tags: Vec::new(),
                    version: 1,
                    created_at: Utc::now(),
                    modified_at: Utc::now(),
                },
                data,
            },
        }
    }

    /// New project in `planning`.
    pub fn project(title: &str) -> Self {
        Self::new(EntityKind::Project, title, "planning")
    }

    /// New feature in `planning`.
    pub fn feature(title: &str) -> Self {
        Self::new(EntityKind::Feature, title, "planning")
    }

    /// New task in `pending`.
    pub fn task(title: &str) -> Self {
        Self::new(EntityKind::Task, title, "pending")
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.item.header.id = id;
        self
    }

    pub fn status(mut self, status: &str) -> Self {
        self.item.header.status = status.to_string();
        self
    }

    pub fn summary(mut self, summary: &str) -> Self {
        self.item.header.summary = summary.to_string();
        self
    }

    pub fn description(mut self, description: &str) -> Self {
        self.item.header.description = Some(description.to_string());
        self
    }

    pub fn parent(mut self, parent_id: Uuid) -> Self {
        self.item.header.parent_id = Some(parent_id);
        self
    }

    pub fn tags(mut self, tags: &[&str]) -> Self {
        self.item.header.tags = tags.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        match &mut self.item.data {
            KindData::Feature { priority: p, .. } | KindData::Task { priority: p, .. } => {
                *p = priority;
            }
            KindData::Project => {}
        }
        self
    }

    pub fn complexity(mut self, complexity: u8) -> Self {
        if let KindData::Task { complexity: c, .. } = &mut self.item.data {
            *c = complexity;
        }
        self
    }

    pub fn requires_verification(mut self, required: bool) -> Self {
        match &mut self.item.data {
            KindData::Feature {
                requires_verification: r,
                ..
            }
            | KindData::Task {
                requires_verification: r,
                ..
            } => *r = required,
            KindData::Project => {}
        }
        self
    }

    pub fn version(mut self, version: i64) -> Self {
        self.item.header.version = version;
        self
    }

    pub fn modified_at(mut self, at: DateTime<Utc>) -> Self {
        self.item.header.modified_at = at;
        self
    }

    pub fn build(self) -> WorkItem {
        self.item
    }
}

/// Builder for constructing dependency edges in tests.
pub struct DependencyBuilder {
    dep: Dependency,
}

impl DependencyBuilder {
    /// `from` blocks `to`, unblocking at completion by default.
    pub fn blocks(from: Uuid, to: Uuid) -> Self {
        Self {
            dep: Dependency {
                id: Uuid::new_v4(),
                from_task_id: from,
                to_task_id: to,
                dep_type: DependencyType::Blocks,
                unblock_at: None,
                created_at: Utc::now(),
            },
        }
    }

    pub fn dep_type(mut self, dep_type: DependencyType) -> Self {
        self.dep.dep_type = dep_type;
        self
    }

    pub fn unblock_at(mut self, role: Role) -> Self {
        self.dep.unblock_at = Some(role);
        self
    }

    pub fn build(self) -> Dependency {
        self.dep
    }
}
