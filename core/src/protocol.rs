//! Typed command surface.
//!
//! The tool layer deserializes wire requests into these parameter types and
//! renders the typed results back into the shared response envelope. Wire
//! names are camelCase; everything else about the JSON encoding is plain
//! serde.

use crate::batch::{BatchOutcome, ErrorMode, UpdateSpec};
use crate::error::{OrchestratorError, Result};
use crate::executor::{NextStatusInfo, TransitionResult};
use crate::flow::FlowConfig;
use crate::graph::GraphAnalysis;
use crate::models::{
    Dependency, DependencyType, Direction, EntityKind, NewDependency, NewWorkItem, Priority, Role,
    RoleTransitionRecord, Trigger, WorkItem, WorkItemFilter,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identity used when a caller does not supply one. Locks taken
/// under this shared identity still serialize writers correctly; they just
/// cannot be told apart in conflict reports.
pub const DEFAULT_SESSION: &str = "anonymous";

/// Batched container operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerOperation {
    Create,
    Update,
    Delete,
}

impl std::str::FromStr for ContainerOperation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(ContainerOperation::Create),
            "update" => Ok(ContainerOperation::Update),
            "delete" => Ok(ContainerOperation::Delete),
            other => Err(format!("unknown container operation '{other}'")),
        }
    }
}

/// Shared field defaults merged into every create item that leaves the
/// field unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedDefaults {
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub priority: Option<Priority>,
    pub requires_verification: Option<bool>,
}

/// One item of a `manage_container` batch. Creation uses the descriptive
/// fields; update additionally needs `id` and `expected_version`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerItemSpec {
    pub id: Option<Uuid>,
    /// `title` and `name` are aliases on the wire; projects and features
    /// are conventionally addressed by name.
    pub title: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub summary: Option<String>,
    pub status: Option<String>,
    pub parent_id: Option<Uuid>,
    pub tags: Option<Vec<String>>,
    pub priority: Option<Priority>,
    pub complexity: Option<u8>,
    pub requires_verification: Option<bool>,
    #[serde(default)]
    pub sections: Vec<crate::models::NewSection>,
    /// Required for updates.
    pub expected_version: Option<i64>,
    /// Set a field to null explicitly (updates only): names listed here
    /// are cleared.
    #[serde(default)]
    pub clear: Vec<String>,
}

impl ContainerItemSpec {
    fn effective_title(&self) -> Option<&str> {
        self.title.as_deref().or(self.name.as_deref())
    }

    /// Build a creation DTO, merging shared defaults.
    pub fn into_new_item(
        self,
        kind: EntityKind,
        defaults: &SharedDefaults,
    ) -> Result<NewWorkItem> {
        let title = self
            .effective_title()
            .ok_or_else(|| OrchestratorError::empty_field("title"))?
            .to_string();
        let mut tags = self.tags.clone().unwrap_or_default();
        for tag in &defaults.tags {
            if !tags.contains(tag) {
                tags.push(tag.clone());
            }
        }
        Ok(NewWorkItem {
            id: self.id,
            kind,
            title,
            description: self.description,
            summary: self.summary.unwrap_or_default(),
            status: self.status,
            parent_id: self.parent_id.or(defaults.parent_id),
            tags,
            priority: self.priority.or(defaults.priority),
            complexity: self.complexity,
            requires_verification: self
                .requires_verification
                .or(defaults.requires_verification)
                .unwrap_or(false),
            sections: self.sections,
        })
    }

    /// Build a version-checked patch.
    pub fn into_update_spec(self) -> Result<UpdateSpec> {
        let id = self
            .id
            .ok_or_else(|| OrchestratorError::empty_field("id"))?;
        let expected_version = self.expected_version.ok_or_else(|| {
            OrchestratorError::Validation("expectedVersion is required for updates".to_string())
        })?;
        let mut patch = crate::models::UpdateWorkItem {
            title: self.title.or(self.name),
            description: self.description.map(Some),
            summary: self.summary,
            status: self.status,
            parent_id: self.parent_id.map(Some),
            tags: self.tags,
            priority: self.priority,
            complexity: self.complexity,
            requires_verification: self.requires_verification,
        };
        for field in &self.clear {
            match field.as_str() {
                "description" => patch.description = Some(None),
                "parentId" | "parent_id" => patch.parent_id = Some(None),
                other => {
                    return Err(OrchestratorError::Validation(format!(
                        "field '{other}' cannot be cleared"
                    )))
                }
            }
        }
        Ok(UpdateSpec {
            id,
            expected_version,
            patch,
        })
    }
}

/// Parameters of the `manage_container` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageContainerParams {
    pub operation: ContainerOperation,
    pub kind: EntityKind,
    #[serde(default)]
    pub items: Vec<ContainerItemSpec>,
    /// Delete targets.
    #[serde(default)]
    pub ids: Vec<Uuid>,
    #[serde(default)]
    pub shared_defaults: SharedDefaults,
    #[serde(default)]
    pub error_mode: ErrorMode,
    /// Cascading delete of descendants and their edges.
    #[serde(default)]
    pub force: bool,
    pub session: Option<String>,
}

/// One transition of a `request_transition` batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionRequest {
    pub entity_kind: EntityKind,
    pub id: Uuid,
    pub trigger: Trigger,
}

/// Parameters of the `request_transition` command: either the inline
/// single form or a `transitions` batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTransitionParams {
    pub entity_kind: Option<EntityKind>,
    pub id: Option<Uuid>,
    pub trigger: Option<Trigger>,
    #[serde(default)]
    pub transitions: Vec<TransitionRequest>,
    pub session: Option<String>,
}

impl RequestTransitionParams {
    /// Collapse the two accepted shapes into a request list.
    pub fn normalize(&self) -> Result<Vec<TransitionRequest>> {
        match (self.entity_kind, self.id, self.trigger) {
            (Some(entity_kind), Some(id), Some(trigger)) => {
                if !self.transitions.is_empty() {
                    return Err(OrchestratorError::Validation(
                        "provide either a single transition or a transitions list, not both"
                            .to_string(),
                    ));
                }
                Ok(vec![TransitionRequest {
                    entity_kind,
                    id,
                    trigger,
                }])
            }
            (None, None, None) if !self.transitions.is_empty() => Ok(self.transitions.clone()),
            _ => Err(OrchestratorError::Validation(
                "entityKind, id and trigger are required (or a transitions list)".to_string(),
            )),
        }
    }
}

/// Dependency batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyOperation {
    Create,
    Delete,
}

impl std::str::FromStr for DependencyOperation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(DependencyOperation::Create),
            "delete" => Ok(DependencyOperation::Delete),
            other => Err(format!("unknown dependency operation '{other}'")),
        }
    }
}

/// Edge-creation shortcuts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyPattern {
    /// Chain the listed tasks in order: each blocks the next.
    Linear,
    /// `source` blocks every listed task.
    FanOut,
    /// Every listed task blocks `target`.
    FanIn,
}

impl std::str::FromStr for DependencyPattern {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "linear" => Ok(DependencyPattern::Linear),
            "fan-out" | "fan_out" => Ok(DependencyPattern::FanOut),
            "fan-in" | "fan_in" => Ok(DependencyPattern::FanIn),
            other => Err(format!("unknown dependency pattern '{other}'")),
        }
    }
}

/// Parameters of the `manage_dependencies` command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageDependenciesParams {
    pub operation: DependencyOperation,
    #[serde(default)]
    pub edges: Vec<NewDependency>,
    pub pattern: Option<DependencyPattern>,
    /// Pattern member tasks, in order.
    #[serde(default)]
    pub task_ids: Vec<Uuid>,
    /// Fan-out source.
    pub source: Option<Uuid>,
    /// Fan-in target.
    pub target: Option<Uuid>,
    /// Threshold applied to every pattern-generated edge.
    pub unblock_at: Option<Role>,
    /// Delete targets.
    #[serde(default)]
    pub ids: Vec<Uuid>,
    pub session: Option<String>,
}

impl Default for DependencyOperation {
    fn default() -> Self {
        DependencyOperation::Create
    }
}

impl ManageDependenciesParams {
    /// Expand explicit edges plus any pattern into one edge list.
    pub fn expand_edges(&self) -> Result<Vec<NewDependency>> {
        let mut edges = self.edges.clone();
        if let Some(pattern) = self.pattern {
            match pattern {
                DependencyPattern::Linear => {
                    if self.task_ids.len() < 2 {
                        return Err(OrchestratorError::Validation(
                            "linear pattern needs at least two taskIds".to_string(),
                        ));
                    }
                    for pair in self.task_ids.windows(2) {
                        edges.push(NewDependency {
                            from_task_id: pair[0],
                            to_task_id: pair[1],
                            dep_type: DependencyType::Blocks,
                            unblock_at: self.unblock_at,
                        });
                    }
                }
                DependencyPattern::FanOut => {
                    let source = self.source.ok_or_else(|| {
                        OrchestratorError::Validation(
                            "fan-out pattern needs a source".to_string(),
                        )
                    })?;
                    if self.task_ids.is_empty() {
                        return Err(OrchestratorError::Validation(
                            "fan-out pattern needs taskIds".to_string(),
                        ));
                    }
                    for &target in &self.task_ids {
                        edges.push(NewDependency {
                            from_task_id: source,
                            to_task_id: target,
                            dep_type: DependencyType::Blocks,
                            unblock_at: self.unblock_at,
                        });
                    }
                }
                DependencyPattern::FanIn => {
                    let target = self.target.ok_or_else(|| {
                        OrchestratorError::Validation("fan-in pattern needs a target".to_string())
                    })?;
                    if self.task_ids.is_empty() {
                        return Err(OrchestratorError::Validation(
                            "fan-in pattern needs taskIds".to_string(),
                        ));
                    }
                    for &source in &self.task_ids {
                        edges.push(NewDependency {
                            from_task_id: source,
                            to_task_id: target,
                            dep_type: DependencyType::Blocks,
                            unblock_at: self.unblock_at,
                        });
                    }
                }
            }
        }
        if edges.is_empty() {
            return Err(OrchestratorError::Validation(
                "no edges to create".to_string(),
            ));
        }
        Ok(edges)
    }
}

/// Parameters of the read-only `query_container` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryContainerParams {
    pub kind: EntityKind,
    pub id: Option<Uuid>,
    #[serde(flatten)]
    pub filter: WorkItemFilter,
    /// Include attached sections in the views.
    #[serde(default)]
    pub include_sections: bool,
}

/// Parameters of the read-only `query_dependencies` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDependenciesParams {
    pub task_id: Uuid,
    #[serde(default)]
    pub direction: Direction,
    pub dep_type: Option<DependencyType>,
    /// `true` (default) returns immediate neighbors; `false` runs the full
    /// graph traversal.
    #[serde(default = "default_neighbors_only")]
    pub neighbors_only: bool,
    pub bottleneck_threshold: Option<usize>,
}

fn default_neighbors_only() -> bool {
    true
}

/// Parameters of the read-only `query_role_transitions` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRoleTransitionsParams {
    pub entity_id: Uuid,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Parameters of the read-only `get_next_status` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetNextStatusParams {
    pub entity_kind: EntityKind,
    pub id: Uuid,
    pub trigger: Option<Trigger>,
}

/// Flat wire view of a work item, role included.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItemView {
    pub id: Uuid,
    pub kind: EntityKind,
    pub title: String,
    pub description: Option<String>,
    pub summary: String,
    pub status: String,
    pub role: Role,
    pub priority: Option<Priority>,
    pub complexity: Option<u8>,
    pub requires_verification: bool,
    pub parent_id: Option<Uuid>,
    pub tags: Vec<String>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sections: Option<Vec<crate::models::Section>>,
}

impl WorkItemView {
    /// Derive the wire view; the role comes from the flow configuration at
    /// read time.
    pub fn from_item(item: &WorkItem, config: &FlowConfig) -> Result<Self> {
        let kind = item.kind();
        let role = config.role_of(kind, &item.header.status)?;
        Ok(Self {
            id: item.id(),
            kind,
            title: item.header.title.clone(),
            description: item.header.description.clone(),
            summary: item.header.summary.clone(),
            status: item.header.status.clone(),
            role,
            priority: item.priority(),
            complexity: item.complexity(),
            requires_verification: item.requires_verification(),
            parent_id: item.header.parent_id,
            tags: item.header.tags.clone(),
            version: item.header.version,
            created_at: item.header.created_at,
            modified_at: item.header.modified_at,
            sections: None,
        })
    }
}

/// Wire view of a dependency edge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyView {
    pub id: Uuid,
    pub from_task_id: Uuid,
    pub to_task_id: Uuid,
    pub dep_type: DependencyType,
    pub unblock_at: Option<Role>,
    pub created_at: DateTime<Utc>,
}

impl From<&Dependency> for DependencyView {
    fn from(dep: &Dependency) -> Self {
        Self {
            id: dep.id,
            from_task_id: dep.from_task_id,
            to_task_id: dep.to_task_id,
            dep_type: dep.dep_type,
            unblock_at: dep.unblock_at,
            created_at: dep.created_at,
        }
    }
}

/// Immediate-neighbor summary of a task's edges.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborSummary {
    pub incoming: Vec<DependencyView>,
    pub outgoing: Vec<DependencyView>,
    pub incoming_count: usize,
    pub outgoing_count: usize,
}

/// Result of `query_dependencies`: neighbors or the full analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyQueryResult {
    pub task_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub neighbors: Option<NeighborSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<GraphAnalysis>,
}

/// Result of a `manage_dependencies` write.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyWriteResult {
    pub created: Vec<DependencyView>,
    pub deleted: Vec<Uuid>,
    /// Edge writes never complete parents, but every write response
    /// carries the same effect-set shape.
    pub cascade_events: Vec<crate::cascade::CascadeEvent>,
    /// Tasks whose gate newly passes because an edge was removed.
    pub unblocked_tasks: Vec<Uuid>,
}

/// Per-request report inside a transition batch.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransitionReport {
    pub request: TransitionRequest,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TransitionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Wire view of an audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleTransitionView {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub entity_kind: EntityKind,
    pub from_status: String,
    pub to_status: String,
    pub from_role: Role,
    pub to_role: Role,
    pub trigger: Trigger,
    pub automatic: bool,
    pub summary: Option<String>,
    pub config_version: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&RoleTransitionRecord> for RoleTransitionView {
    fn from(record: &RoleTransitionRecord) -> Self {
        Self {
            id: record.id,
            entity_id: record.entity_id,
            entity_kind: record.entity_kind,
            from_status: record.from_status.clone(),
            to_status: record.to_status.clone(),
            from_role: record.from_role,
            to_role: record.to_role,
            trigger: record.trigger,
            automatic: record.automatic,
            summary: record.summary.clone(),
            config_version: record.config_version,
            created_at: record.created_at,
        }
    }
}

/// Machine-readable error payload of the response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorBody {
    pub fn from_error(error: &OrchestratorError) -> Self {
        Self {
            code: error.error_code().to_string(),
            details: error_details(error),
        }
    }
}

/// Structured detail payload per error kind.
fn error_details(error: &OrchestratorError) -> Option<serde_json::Value> {
    use serde_json::json;
    match error {
        OrchestratorError::VersionMismatch { expected, actual } => Some(json!({
            "expected": expected,
            "actual": actual,
        })),
        OrchestratorError::LockConflict { owner, expires_at } => Some(json!({
            "owner": owner,
            "expiresAt": expires_at,
        })),
        OrchestratorError::CycleDetected { path } => Some(json!({ "path": path })),
        OrchestratorError::DuplicateEdge {
            from,
            to,
            dep_type,
        } => Some(json!({
            "fromTaskId": from,
            "toTaskId": to,
            "depType": dep_type,
        })),
        OrchestratorError::BlockedBy { blockers } => Some(json!({ "blockers": blockers })),
        OrchestratorError::IncompleteChildren { pending } => Some(json!({ "pending": pending })),
        _ => None,
    }
}

/// The consistent response envelope every command produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ToolResponse {
    pub fn ok(message: impl Into<String>, data: Option<serde_json::Value>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data,
            error: None,
        }
    }

    pub fn from_error(error: &OrchestratorError) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            data: None,
            error: Some(ErrorBody::from_error(error)),
        }
    }
}

/// Handler contract implemented by the tool layer over the core services.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Batched create/update/delete of one container kind.
    async fn manage_container(&self, params: ManageContainerParams) -> Result<BatchOutcome>;

    /// Apply one or more transitions; each request gets its own report.
    async fn request_transition(
        &self,
        params: RequestTransitionParams,
    ) -> Result<Vec<TransitionReport>>;

    /// Create or delete dependency edges, with pattern shortcuts.
    async fn manage_dependencies(
        &self,
        params: ManageDependenciesParams,
    ) -> Result<DependencyWriteResult>;

    /// List container items, or fetch one by id.
    async fn query_container(&self, params: QueryContainerParams) -> Result<Vec<WorkItemView>>;

    /// Immediate neighbors or full graph analysis around a task.
    async fn query_dependencies(
        &self,
        params: QueryDependenciesParams,
    ) -> Result<DependencyQueryResult>;

    /// Chronological audit entries for an entity.
    async fn query_role_transitions(
        &self,
        params: QueryRoleTransitionsParams,
    ) -> Result<Vec<RoleTransitionView>>;

    /// Where each trigger would take an entity, without applying anything.
    async fn get_next_status(&self, params: GetNextStatusParams) -> Result<NextStatusInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_transition_normalizes() {
        let params = RequestTransitionParams {
            entity_kind: Some(EntityKind::Task),
            id: Some(Uuid::new_v4()),
            trigger: Some(Trigger::Start),
            ..Default::default()
        };
        let requests = params.normalize().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].trigger, Trigger::Start);
    }

    #[test]
    fn mixed_transition_shapes_are_rejected() {
        let request = TransitionRequest {
            entity_kind: EntityKind::Task,
            id: Uuid::new_v4(),
            trigger: Trigger::Start,
        };
        let params = RequestTransitionParams {
            entity_kind: Some(EntityKind::Task),
            id: Some(request.id),
            trigger: Some(Trigger::Start),
            transitions: vec![request],
            ..Default::default()
        };
        assert!(params.normalize().is_err());

        assert!(RequestTransitionParams::default().normalize().is_err());
    }

    #[test]
    fn linear_pattern_chains_in_order() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        let params = ManageDependenciesParams {
            operation: DependencyOperation::Create,
            pattern: Some(DependencyPattern::Linear),
            task_ids: vec![a, b, c],
            ..Default::default()
        };
        let edges = params.expand_edges().unwrap();
        assert_eq!(edges.len(), 2);
        assert_eq!((edges[0].from_task_id, edges[0].to_task_id), (a, b));
        assert_eq!((edges[1].from_task_id, edges[1].to_task_id), (b, c));
        assert!(edges.iter().all(|e| e.dep_type == DependencyType::Blocks));
    }

    #[test]
    fn fan_out_pattern_needs_source() {
        let params = ManageDependenciesParams {
            operation: DependencyOperation::Create,
            pattern: Some(DependencyPattern::FanOut),
            task_ids: vec![Uuid::new_v4()],
            ..Default::default()
        };
        assert!(params.expand_edges().is_err());

        let source = Uuid::new_v4();
        let targets = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let params = ManageDependenciesParams {
            operation: DependencyOperation::Create,
            pattern: Some(DependencyPattern::FanOut),
            source: Some(source),
            task_ids: targets.clone(),
            ..Default::default()
        };
        let edges = params.expand_edges().unwrap();
        assert_eq!(edges.len(), 3);
        assert!(edges.iter().all(|e| e.from_task_id == source));
        assert_eq!(
            edges.iter().map(|e| e.to_task_id).collect::<Vec<_>>(),
            targets
        );
    }

    #[test]
    fn fan_in_pattern_converges_on_target() {
        let target = Uuid::new_v4();
        let sources = vec![Uuid::new_v4(), Uuid::new_v4()];
        let params = ManageDependenciesParams {
            operation: DependencyOperation::Create,
            pattern: Some(DependencyPattern::FanIn),
            target: Some(target),
            task_ids: sources.clone(),
            unblock_at: Some(Role::Review),
            ..Default::default()
        };
        let edges = params.expand_edges().unwrap();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.to_task_id == target));
        assert!(edges.iter().all(|e| e.unblock_at == Some(Role::Review)));
    }

    #[test]
    fn envelope_shapes() {
        let ok = ToolResponse::ok("done", Some(serde_json::json!({"n": 1})));
        assert!(ok.success);
        assert!(ok.error.is_none());

        let err = ToolResponse::from_error(&OrchestratorError::MissingSummary);
        assert!(!err.success);
        assert_eq!(err.error.as_ref().unwrap().code, "MISSING_SUMMARY");

        let mismatch = ToolResponse::from_error(&OrchestratorError::VersionMismatch {
            expected: 5,
            actual: 6,
        });
        let details = mismatch.error.unwrap().details.unwrap();
        assert_eq!(details["expected"], 5);
        assert_eq!(details["actual"], 6);
    }

    #[test]
    fn item_spec_title_aliases_name() {
        let spec = ContainerItemSpec {
            name: Some("Billing".to_string()),
            ..Default::default()
        };
        let item = spec
            .into_new_item(EntityKind::Feature, &SharedDefaults::default())
            .unwrap();
        assert_eq!(item.title, "Billing");

        let empty = ContainerItemSpec::default();
        assert!(empty
            .into_new_item(EntityKind::Feature, &SharedDefaults::default())
            .is_err());
    }

    #[test]
    fn shared_defaults_fill_gaps_only() {
        let parent = Uuid::new_v4();
        let defaults = SharedDefaults {
            parent_id: Some(parent),
            tags: vec!["backend".to_string()],
            priority: Some(Priority::High),
            requires_verification: Some(true),
        };
        let spec = ContainerItemSpec {
            title: Some("T".to_string()),
            priority: Some(Priority::Low),
            ..Default::default()
        };
        let item = spec.into_new_item(EntityKind::Task, &defaults).unwrap();
        assert_eq!(item.parent_id, Some(parent));
        assert_eq!(item.priority, Some(Priority::Low));
        assert!(item.requires_verification);
        assert_eq!(item.tags, vec!["backend"]);
    }

    #[test]
    fn update_spec_requires_id_and_version() {
        let spec = ContainerItemSpec {
            title: Some("x".to_string()),
            ..Default::default()
        };
        assert!(spec.into_update_spec().is_err());

        let spec = ContainerItemSpec {
            id: Some(Uuid::new_v4()),
            expected_version: Some(3),
            summary: Some("done".to_string()),
            ..Default::default()
        };
        let update = spec.into_update_spec().unwrap();
        assert_eq!(update.expected_version, 3);
        assert_eq!(update.patch.summary.as_deref(), Some("done"));
    }
}
