//! RMCP tool router
//!
//! Exposes the orchestration commands as MCP tools using the official
//! RMCP SDK with #[tool] macros. Requests arrive with string-typed ids
//! and enum tokens; conversion into the typed core parameters happens
//! here, so malformed input becomes a `VALIDATION_ERROR` envelope rather
//! than a transport failure.

use crate::error::{
    parse_optional_datetime, parse_optional_token, parse_optional_uuid, parse_token_param,
    parse_uuid_list, parse_uuid_param,
};
use crate::handler::OrchestratorHandler;
use crate::serialization::{render, render_error, success_response};
use flow_core::models::{NewSection, SectionFormat, WorkItemFilter};
use flow_core::protocol::{
    ContainerItemSpec, GetNextStatusParams, ManageContainerParams, ManageDependenciesParams,
    ProtocolHandler, QueryContainerParams, QueryDependenciesParams, QueryRoleTransitionsParams,
    RequestTransitionParams, SharedDefaults, TransitionRequest,
};
use flow_core::repository::EntityStore;
use rmcp::schemars::JsonSchema;
use rmcp::{
    handler::server::tool::Parameters, model::*, tool, tool_handler, tool_router, ErrorData as McpError,
    ServerHandler,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Per-operation budget; cascades share it and cap their depth
/// separately.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

/// One container item on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ContainerItemRequest {
    #[schemars(description = "Item id (optional on create; required on update)")]
    pub id: Option<String>,
    #[schemars(description = "Item title")]
    pub title: Option<String>,
    #[schemars(description = "Alias of title, conventional for projects and features")]
    pub name: Option<String>,
    #[schemars(description = "Free-form description")]
    pub description: Option<String>,
    #[schemars(description = "Completion summary (max 500 characters)")]
    pub summary: Option<String>,
    #[schemars(description = "Explicit status token; defaults to the flow's first status")]
    pub status: Option<String>,
    #[schemars(description = "Parent project or feature id")]
    pub parent_id: Option<String>,
    #[schemars(description = "Tags; lowercase, drive flow selection")]
    pub tags: Option<Vec<String>>,
    #[schemars(description = "Priority: high, medium or low")]
    pub priority: Option<String>,
    #[schemars(description = "Task complexity, 1-10")]
    pub complexity: Option<u8>,
    #[schemars(description = "Whether completion requires a prior review")]
    pub requires_verification: Option<bool>,
    #[schemars(description = "Expected version for optimistic concurrency (updates)")]
    pub expected_version: Option<i64>,
    #[schemars(description = "Field names to clear on update (description, parentId)")]
    pub clear: Option<Vec<String>>,
    #[schemars(description = "Content sections created with the item")]
    pub sections: Option<Vec<SectionRequest>>,
}

/// One content section on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SectionRequest {
    #[schemars(description = "Section title")]
    pub title: String,
    #[schemars(description = "Section body")]
    pub content: Option<String>,
    #[schemars(description = "Body format: markdown, plain_text, json or code")]
    pub format: Option<String>,
    #[schemars(description = "Ordering index")]
    pub ordinal: Option<i64>,
    #[schemars(description = "Section tags")]
    pub tags: Option<Vec<String>>,
}

/// Defaults merged into every created item that leaves the field unset.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SharedDefaultsRequest {
    pub parent_id: Option<String>,
    pub tags: Option<Vec<String>>,
    pub priority: Option<String>,
    pub requires_verification: Option<bool>,
}

/// Manage Container Parameters
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ManageContainerRequest {
    #[schemars(description = "Operation: create, update or delete")]
    pub operation: String,
    #[schemars(description = "Container kind: project, feature or task")]
    pub kind: String,
    #[schemars(description = "Items to create or update")]
    pub items: Option<Vec<ContainerItemRequest>>,
    #[schemars(description = "Item ids to delete")]
    pub ids: Option<Vec<String>>,
    #[schemars(description = "Defaults merged into created items")]
    pub shared_defaults: Option<SharedDefaultsRequest>,
    #[schemars(description = "Failure handling: atomic (default) or per-item")]
    pub error_mode: Option<String>,
    #[schemars(description = "Cascade delete of descendants and their edges")]
    pub force: Option<bool>,
    #[schemars(description = "Caller session token for locking")]
    pub session: Option<String>,
}

/// One transition entry of a batch.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TransitionItemRequest {
    #[schemars(description = "Entity kind: project, feature or task")]
    pub entity_kind: String,
    #[schemars(description = "Entity id")]
    pub id: String,
    #[schemars(description = "Trigger: start, complete, cancel, block or hold")]
    pub trigger: String,
}

/// Request Transition Parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RequestTransitionRequest {
    #[schemars(description = "Entity kind (single form)")]
    pub entity_kind: Option<String>,
    #[schemars(description = "Entity id (single form)")]
    pub id: Option<String>,
    #[schemars(description = "Trigger (single form)")]
    pub trigger: Option<String>,
    #[schemars(description = "Batch of transitions (batch form)")]
    pub transitions: Option<Vec<TransitionItemRequest>>,
    #[schemars(description = "Caller session token for locking")]
    pub session: Option<String>,
}

/// One dependency edge on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct EdgeRequest {
    #[schemars(description = "Blocking/source task id")]
    pub from_task_id: String,
    #[schemars(description = "Blocked/target task id")]
    pub to_task_id: String,
    #[schemars(description = "Edge type: blocks (default), is-blocked-by or relates-to")]
    pub dep_type: Option<String>,
    #[schemars(description = "Role the source must reach to unblock; defaults to terminal")]
    pub unblock_at: Option<String>,
}

/// Manage Dependencies Parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ManageDependenciesRequest {
    #[schemars(description = "Operation: create or delete")]
    pub operation: String,
    #[schemars(description = "Explicit edges to create")]
    pub edges: Option<Vec<EdgeRequest>>,
    #[schemars(description = "Pattern shortcut: linear, fan-out or fan-in")]
    pub pattern: Option<String>,
    #[schemars(description = "Pattern member task ids, in order")]
    pub task_ids: Option<Vec<String>>,
    #[schemars(description = "Fan-out source task id")]
    pub source: Option<String>,
    #[schemars(description = "Fan-in target task id")]
    pub target: Option<String>,
    #[schemars(description = "Unblock threshold applied to pattern edges")]
    pub unblock_at: Option<String>,
    #[schemars(description = "Dependency ids to delete")]
    pub ids: Option<Vec<String>>,
    #[schemars(description = "Caller session token for locking")]
    pub session: Option<String>,
}

/// Query Container Parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct QueryContainerRequest {
    #[schemars(description = "Container kind: project, feature or task")]
    pub kind: String,
    #[schemars(description = "Fetch one item by id")]
    pub id: Option<String>,
    #[schemars(description = "Require all of these tags")]
    pub tags: Option<Vec<String>>,
    #[schemars(description = "Only these statuses")]
    pub status_in: Option<Vec<String>>,
    #[schemars(description = "Exclude these statuses")]
    pub status_not_in: Option<Vec<String>>,
    #[schemars(description = "Only these priorities")]
    pub priority_in: Option<Vec<String>>,
    #[schemars(description = "Exclude these priorities")]
    pub priority_not_in: Option<Vec<String>>,
    #[schemars(description = "Only direct children of this container")]
    pub parent_id: Option<String>,
    #[schemars(description = "Substring match over title and description")]
    pub text: Option<String>,
    #[schemars(description = "Page size")]
    pub limit: Option<u32>,
    #[schemars(description = "Page offset")]
    pub offset: Option<u32>,
    #[schemars(description = "Include attached sections")]
    pub include_sections: Option<bool>,
}

/// Query Dependencies Parameters
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueryDependenciesRequest {
    #[schemars(description = "Task to query around")]
    pub task_id: String,
    #[schemars(description = "Edge direction: incoming, outgoing or all")]
    pub direction: Option<String>,
    #[schemars(description = "Filter by edge type")]
    pub dep_type: Option<String>,
    #[schemars(description = "true (default): immediate neighbors; false: full graph analysis")]
    pub neighbors_only: Option<bool>,
    #[schemars(description = "Fan-out threshold for bottleneck reporting (default 3)")]
    pub bottleneck_threshold: Option<usize>,
}

/// Query Role Transitions Parameters
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct QueryRoleTransitionsRequest {
    #[schemars(description = "Entity whose audit log to read")]
    pub entity_id: String,
    #[schemars(description = "Inclusive lower bound, RFC 3339")]
    pub from: Option<String>,
    #[schemars(description = "Inclusive upper bound, RFC 3339")]
    pub to: Option<String>,
}

/// Get Next Status Parameters
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct GetNextStatusRequest {
    #[schemars(description = "Entity kind: project, feature or task")]
    pub entity_kind: String,
    #[schemars(description = "Entity id")]
    pub id: String,
    #[schemars(description = "Resolve a specific trigger; omit to survey all")]
    pub trigger: Option<String>,
}

impl ContainerItemRequest {
    fn into_spec(self) -> flow_core::Result<ContainerItemSpec> {
        let mut sections = Vec::new();
        for section in self.sections.unwrap_or_default() {
            sections.push(NewSection {
                title: section.title,
                content: section.content.unwrap_or_default(),
                format: match &section.format {
                    Some(raw) => parse_token_param::<SectionFormat>(raw, "format")?,
                    None => SectionFormat::default(),
                },
                ordinal: section.ordinal.unwrap_or(0),
                tags: section.tags.unwrap_or_default(),
            });
        }
        Ok(ContainerItemSpec {
            id: parse_optional_uuid(&self.id, "id")?,
            title: self.title,
            name: self.name,
            description: self.description,
            summary: self.summary,
            status: self.status,
            parent_id: parse_optional_uuid(&self.parent_id, "parentId")?,
            tags: self.tags,
            priority: parse_optional_token(&self.priority, "priority")?,
            complexity: self.complexity,
            requires_verification: self.requires_verification,
            sections,
            expected_version: self.expected_version,
            clear: self.clear.unwrap_or_default(),
        })
    }
}

impl ManageContainerRequest {
    fn into_params(self) -> flow_core::Result<ManageContainerParams> {
        let defaults = match self.shared_defaults {
            Some(raw) => SharedDefaults {
                parent_id: parse_optional_uuid(&raw.parent_id, "sharedDefaults.parentId")?,
                tags: raw.tags.unwrap_or_default(),
                priority: parse_optional_token(&raw.priority, "sharedDefaults.priority")?,
                requires_verification: raw.requires_verification,
            },
            None => SharedDefaults::default(),
        };
        let mut items = Vec::new();
        for item in self.items.unwrap_or_default() {
            items.push(item.into_spec()?);
        }
        Ok(ManageContainerParams {
            operation: parse_token_param(&self.operation, "operation")?,
            kind: parse_token_param(&self.kind, "kind")?,
            items,
            ids: parse_uuid_list(&self.ids.unwrap_or_default(), "ids")?,
            shared_defaults: defaults,
            error_mode: match &self.error_mode {
                Some(raw) => parse_token_param(raw, "errorMode")?,
                None => Default::default(),
            },
            force: self.force.unwrap_or(false),
            session: self.session,
        })
    }
}

impl RequestTransitionRequest {
    fn into_params(self) -> flow_core::Result<RequestTransitionParams> {
        let mut transitions = Vec::new();
        for entry in self.transitions.unwrap_or_default() {
            transitions.push(TransitionRequest {
                entity_kind: parse_token_param(&entry.entity_kind, "entityKind")?,
                id: parse_uuid_param(&entry.id, "id")?,
                trigger: parse_token_param(&entry.trigger, "trigger")?,
            });
        }
        Ok(RequestTransitionParams {
            entity_kind: parse_optional_token(&self.entity_kind, "entityKind")?,
            id: parse_optional_uuid(&self.id, "id")?,
            trigger: parse_optional_token(&self.trigger, "trigger")?,
            transitions,
            session: self.session,
        })
    }
}

impl ManageDependenciesRequest {
    fn into_params(self) -> flow_core::Result<ManageDependenciesParams> {
        let mut edges = Vec::new();
        for edge in self.edges.unwrap_or_default() {
            edges.push(flow_core::models::NewDependency {
                from_task_id: parse_uuid_param(&edge.from_task_id, "fromTaskId")?,
                to_task_id: parse_uuid_param(&edge.to_task_id, "toTaskId")?,
                dep_type: match &edge.dep_type {
                    Some(raw) => parse_token_param(raw, "depType")?,
                    None => flow_core::models::DependencyType::Blocks,
                },
                unblock_at: parse_optional_token(&edge.unblock_at, "unblockAt")?,
            });
        }
        Ok(ManageDependenciesParams {
            operation: parse_token_param(&self.operation, "operation")?,
            edges,
            pattern: parse_optional_token(&self.pattern, "pattern")?,
            task_ids: parse_uuid_list(&self.task_ids.unwrap_or_default(), "taskIds")?,
            source: parse_optional_uuid(&self.source, "source")?,
            target: parse_optional_uuid(&self.target, "target")?,
            unblock_at: parse_optional_token(&self.unblock_at, "unblockAt")?,
            ids: parse_uuid_list(&self.ids.unwrap_or_default(), "ids")?,
            session: self.session,
        })
    }
}

impl QueryContainerRequest {
    fn into_params(self) -> flow_core::Result<QueryContainerParams> {
        let mut priority_in = Vec::new();
        for raw in self.priority_in.unwrap_or_default() {
            priority_in.push(parse_token_param(&raw, "priorityIn")?);
        }
        let mut priority_not_in = Vec::new();
        for raw in self.priority_not_in.unwrap_or_default() {
            priority_not_in.push(parse_token_param(&raw, "priorityNotIn")?);
        }
        Ok(QueryContainerParams {
            kind: parse_token_param(&self.kind, "kind")?,
            id: parse_optional_uuid(&self.id, "id")?,
            filter: WorkItemFilter {
                tags: self.tags.unwrap_or_default(),
                status_in: self.status_in.unwrap_or_default(),
                status_not_in: self.status_not_in.unwrap_or_default(),
                priority_in,
                priority_not_in,
                parent_id: parse_optional_uuid(&self.parent_id, "parentId")?,
                text: self.text,
                limit: self.limit,
                offset: self.offset,
            },
            include_sections: self.include_sections.unwrap_or(false),
        })
    }
}

impl QueryDependenciesRequest {
    fn into_params(self) -> flow_core::Result<QueryDependenciesParams> {
        Ok(QueryDependenciesParams {
            task_id: parse_uuid_param(&self.task_id, "taskId")?,
            direction: match &self.direction {
                Some(raw) => parse_token_param(raw, "direction")?,
                None => Default::default(),
            },
            dep_type: parse_optional_token(&self.dep_type, "depType")?,
            neighbors_only: self.neighbors_only.unwrap_or(true),
            bottleneck_threshold: self.bottleneck_threshold,
        })
    }
}

impl QueryRoleTransitionsRequest {
    fn into_params(self) -> flow_core::Result<QueryRoleTransitionsParams> {
        Ok(QueryRoleTransitionsParams {
            entity_id: parse_uuid_param(&self.entity_id, "entityId")?,
            from: parse_optional_datetime(&self.from, "from")?,
            to: parse_optional_datetime(&self.to, "to")?,
        })
    }
}

impl GetNextStatusRequest {
    fn into_params(self) -> flow_core::Result<GetNextStatusParams> {
        Ok(GetNextStatusParams {
            entity_kind: parse_token_param(&self.entity_kind, "entityKind")?,
            id: parse_uuid_param(&self.id, "id")?,
            trigger: parse_optional_token(&self.trigger, "trigger")?,
        })
    }
}

/// RMCP router exposing the orchestration tools.
#[derive(Clone)]
pub struct CadenceRouter<S> {
    handler: Arc<OrchestratorHandler<S>>,
    tool_router: rmcp::handler::server::router::tool::ToolRouter<Self>,
}

impl<S: EntityStore + 'static> CadenceRouter<S> {
    pub fn new(handler: Arc<OrchestratorHandler<S>>) -> Self {
        Self {
            handler,
            tool_router: Self::tool_router(),
        }
    }

    /// Run a handler future under the per-operation budget and wrap its
    /// outcome in the shared envelope.
    async fn run<T, F>(&self, fut: F, ok_message: &str) -> std::result::Result<CallToolResult, McpError>
    where
        T: serde::Serialize,
        F: Future<Output = flow_core::Result<T>>,
    {
        match tokio::time::timeout(OPERATION_TIMEOUT, fut).await {
            Ok(Ok(value)) => match success_response(ok_message, &value) {
                Ok(response) => Ok(render(&response)),
                Err(e) => Err(McpError::internal_error(format!("serialization error: {e}"), None)),
            },
            Ok(Err(e)) => Ok(render_error(&e)),
            Err(_) => Err(McpError::internal_error("operation timed out".to_string(), None)),
        }
    }
}

#[tool_router]
impl<S: EntityStore + 'static> CadenceRouter<S> {
    /// Batched create/update/delete of projects, features or tasks
    #[tool(
        description = "Create, update or delete work items (projects, features, tasks) in batches of up to 100, with shared defaults, optimistic version checks and optional per-item error reporting"
    )]
    async fn manage_container(
        &self,
        Parameters(request): Parameters<ManageContainerRequest>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let params = match request.into_params() {
            Ok(params) => params,
            Err(e) => return Ok(render_error(&e)),
        };
        self.run(self.handler.manage_container(params), "container batch applied")
            .await
    }

    /// Apply workflow triggers
    #[tool(
        description = "Apply a workflow trigger (start, complete, cancel, block, hold) to one entity or a batch; responses include cascade events and newly unblocked tasks"
    )]
    async fn request_transition(
        &self,
        Parameters(request): Parameters<RequestTransitionRequest>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let params = match request.into_params() {
            Ok(params) => params,
            Err(e) => return Ok(render_error(&e)),
        };
        self.run(self.handler.request_transition(params), "transition processed")
            .await
    }

    /// Create or delete dependency edges
    #[tool(
        description = "Create or delete task dependency edges, with linear, fan-out and fan-in pattern shortcuts; batches are screened whole for duplicates and cycles"
    )]
    async fn manage_dependencies(
        &self,
        Parameters(request): Parameters<ManageDependenciesRequest>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let params = match request.into_params() {
            Ok(params) => params,
            Err(e) => return Ok(render_error(&e)),
        };
        self.run(
            self.handler.manage_dependencies(params),
            "dependency batch applied",
        )
        .await
    }

    /// List or fetch work items
    #[tool(
        description = "List work items of one kind with tag/status/priority/parent/text filters, or fetch a single item by id, optionally with its sections"
    )]
    async fn query_container(
        &self,
        Parameters(request): Parameters<QueryContainerRequest>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let params = match request.into_params() {
            Ok(params) => params,
            Err(e) => return Ok(render_error(&e)),
        };
        self.run(self.handler.query_container(params), "container query")
            .await
    }

    /// Inspect the dependency graph
    #[tool(
        description = "Query a task's immediate dependency neighbors, or run the full graph analysis: topological chain, depth, critical path, bottlenecks and parallelizable groups"
    )]
    async fn query_dependencies(
        &self,
        Parameters(request): Parameters<QueryDependenciesRequest>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let params = match request.into_params() {
            Ok(params) => params,
            Err(e) => return Ok(render_error(&e)),
        };
        self.run(self.handler.query_dependencies(params), "dependency query")
            .await
    }

    /// Read the audit log
    #[tool(
        description = "Chronological role-transition audit entries for an entity, optionally bounded by a time range"
    )]
    async fn query_role_transitions(
        &self,
        Parameters(request): Parameters<QueryRoleTransitionsRequest>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let params = match request.into_params() {
            Ok(params) => params,
            Err(e) => return Ok(render_error(&e)),
        };
        self.run(
            self.handler.query_role_transitions(params),
            "role transition query",
        )
        .await
    }

    /// Resolve triggers without applying them
    #[tool(
        description = "Report where each trigger would take an entity under its active flow, without applying anything"
    )]
    async fn get_next_status(
        &self,
        Parameters(request): Parameters<GetNextStatusRequest>,
    ) -> std::result::Result<CallToolResult, McpError> {
        let params = match request.into_params() {
            Ok(params) => params,
            Err(e) => return Ok(render_error(&e)),
        };
        self.run(self.handler.get_next_status(params), "next status query")
            .await
    }
}

// Implement the RMCP ServerHandler trait
#[tool_handler]
impl<S: EntityStore + 'static> ServerHandler for CadenceRouter<S> {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "Workflow orchestration server for AI-agent work hierarchies. Manages projects, \
                 features and tasks through configurable status flows with dependency gating, \
                 automatic completion cascades and optimistic concurrency."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}
