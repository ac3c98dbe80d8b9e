//! Flow configuration: per-kind status sets, role mapping, and ordered
//! flow definitions driving trigger resolution.
//!
//! The configuration is a declarative TOML document. It is parsed once at
//! startup, validated eagerly (unknown statuses are a load error, never a
//! runtime surprise), and treated as read-only afterwards. Hot reload is a
//! full replacement with a bumped `version`; every audit record carries the
//! version it observed.

use crate::error::{OrchestratorError, Result};
use crate::models::{EntityKind, Role, Trigger};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};

/// Built-in flow configuration document.
pub const DEFAULT_FLOW_DOCUMENT: &str = include_str!("../flows/default.toml");

/// Raw document shape as deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct FlowDocument {
    #[serde(default = "default_version")]
    pub version: u32,
    /// When set, `complete` on a project or feature requires all direct
    /// children to be terminal.
    #[serde(default)]
    pub enforce_child_completion: bool,
    pub project: KindFlowsDoc,
    pub feature: KindFlowsDoc,
    pub task: KindFlowsDoc,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct KindFlowsDoc {
    /// Status token to role name. A status always maps to the same role
    /// regardless of which flow is active.
    pub statuses: BTreeMap<String, String>,
    pub flows: Vec<FlowDoc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlowDoc {
    pub name: String,
    #[serde(default)]
    pub selector_tags: Vec<String>,
    pub sequence: Vec<String>,
    /// Defaults to the last element of `sequence`.
    #[serde(default)]
    pub terminal_statuses: Vec<String>,
    /// Trigger name (`cancel`, `block`, `hold`) to target status.
    #[serde(default)]
    pub emergency: BTreeMap<String, String>,
}

/// A validated, named status progression for one entity kind.
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub name: String,
    pub selector_tags: Vec<String>,
    pub sequence: Vec<String>,
    pub terminal_statuses: Vec<String>,
    pub emergency: HashMap<Trigger, String>,
}

impl Flow {
    /// The status `complete` resolves to: the first declared terminal
    /// status.
    pub fn terminal_status(&self) -> &str {
        &self.terminal_statuses[0]
    }

    pub fn is_terminal(&self, status: &str) -> bool {
        self.terminal_statuses.iter().any(|s| s == status)
    }

    /// Position of `status` within the progression, if it is part of it.
    pub fn position_of(&self, status: &str) -> Option<usize> {
        self.sequence.iter().position(|s| s == status)
    }

    /// True when every selector tag is present on `tags`.
    fn matches(&self, tags: &[String]) -> bool {
        self.selector_tags.iter().all(|t| tags.iter().any(|x| x == t))
    }
}

#[derive(Debug, Clone)]
struct KindFlows {
    roles: HashMap<String, Role>,
    flows: Vec<Flow>,
    /// Index into `flows` of the empty-selector fallback.
    fallback: usize,
}

/// Validated flow configuration for all entity kinds.
#[derive(Debug, Clone)]
pub struct FlowConfig {
    version: u32,
    enforce_child_completion: bool,
    kinds: HashMap<EntityKind, KindFlows>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self::from_toml_str(DEFAULT_FLOW_DOCUMENT)
            .expect("embedded default flow document must be valid")
    }
}

impl FlowConfig {
    /// Parse and validate a TOML flow document.
    pub fn from_toml_str(doc: &str) -> Result<Self> {
        let document: FlowDocument = toml::from_str(doc)
            .map_err(|e| OrchestratorError::Configuration(format!("invalid flow document: {e}")))?;
        Self::from_document(document)
    }

    /// Validate a deserialized document, compiling it into lookup form.
    pub fn from_document(doc: FlowDocument) -> Result<Self> {
        let mut kinds = HashMap::new();
        kinds.insert(
            EntityKind::Project,
            compile_kind(EntityKind::Project, &doc.project)?,
        );
        kinds.insert(
            EntityKind::Feature,
            compile_kind(EntityKind::Feature, &doc.feature)?,
        );
        kinds.insert(EntityKind::Task, compile_kind(EntityKind::Task, &doc.task)?);

        Ok(Self {
            version: doc.version,
            enforce_child_completion: doc.enforce_child_completion,
            kinds,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn enforce_child_completion(&self) -> bool {
        self.enforce_child_completion
    }

    fn kind(&self, kind: EntityKind) -> &KindFlows {
        // Every kind is populated in from_document; the map is total.
        &self.kinds[&kind]
    }

    /// Role of a status token for the given kind.
    pub fn role_of(&self, kind: EntityKind, status: &str) -> Result<Role> {
        self.kind(kind).roles.get(status).copied().ok_or_else(|| {
            OrchestratorError::Configuration(format!(
                "status '{status}' is not declared for kind '{kind}'"
            ))
        })
    }

    pub fn is_valid_status(&self, kind: EntityKind, status: &str) -> bool {
        self.kind(kind).roles.contains_key(status)
    }

    /// All declared statuses for a kind, in stable order.
    pub fn statuses(&self, kind: EntityKind) -> Vec<&str> {
        let mut names: Vec<&str> = self.kind(kind).roles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Select the active flow for an item: first declared flow whose
    /// selector tags are a subset of the item's tags, else the fallback.
    pub fn active_flow(&self, kind: EntityKind, tags: &[String]) -> &Flow {
        let kf = self.kind(kind);
        kf.flows
            .iter()
            .find(|f| !f.selector_tags.is_empty() && f.matches(tags))
            .unwrap_or(&kf.flows[kf.fallback])
    }

    /// Status progression of the active flow.
    pub fn sequence_for(&self, kind: EntityKind, tags: &[String]) -> &[String] {
        &self.active_flow(kind, tags).sequence
    }

    /// Emergency target status for a trigger under the active flow.
    pub fn emergency_target(
        &self,
        kind: EntityKind,
        tags: &[String],
        trigger: Trigger,
    ) -> Option<&str> {
        self.active_flow(kind, tags)
            .emergency
            .get(&trigger)
            .map(String::as_str)
    }

    /// Status a freshly created item receives: the first status of its
    /// active flow.
    pub fn initial_status(&self, kind: EntityKind, tags: &[String]) -> &str {
        &self.active_flow(kind, tags).sequence[0]
    }
}

fn compile_kind(kind: EntityKind, doc: &KindFlowsDoc) -> Result<KindFlows> {
    if doc.statuses.is_empty() {
        return Err(OrchestratorError::Configuration(format!(
            "kind '{kind}' declares no statuses"
        )));
    }

    let mut roles = HashMap::new();
    for (status, role_name) in &doc.statuses {
        let role: Role = role_name.parse().map_err(|e: String| {
            OrchestratorError::Configuration(format!("status '{status}' of kind '{kind}': {e}"))
        })?;
        roles.insert(status.clone(), role);
    }

    if doc.flows.is_empty() {
        return Err(OrchestratorError::Configuration(format!(
            "kind '{kind}' declares no flows"
        )));
    }

    let mut flows = Vec::with_capacity(doc.flows.len());
    let mut fallback = None;
    for flow_doc in &doc.flows {
        let flow = compile_flow(kind, flow_doc, &roles)?;
        if flow.selector_tags.is_empty() && fallback.is_none() {
            fallback = Some(flows.len());
        }
        flows.push(flow);
    }

    let fallback = fallback.ok_or_else(|| {
        OrchestratorError::Configuration(format!(
            "kind '{kind}' has no fallback flow with an empty selector"
        ))
    })?;

    Ok(KindFlows {
        roles,
        flows,
        fallback,
    })
}

fn compile_flow(kind: EntityKind, doc: &FlowDoc, roles: &HashMap<String, Role>) -> Result<Flow> {
    if doc.sequence.is_empty() {
        return Err(OrchestratorError::Configuration(format!(
            "flow '{}' of kind '{kind}' has an empty sequence",
            doc.name
        )));
    }

    let check_status = |status: &String, context: &str| -> Result<()> {
        if roles.contains_key(status) {
            Ok(())
        } else {
            Err(OrchestratorError::Configuration(format!(
                "flow '{}' of kind '{kind}' references unknown status '{status}' in {context}",
                doc.name
            )))
        }
    };

    for status in &doc.sequence {
        check_status(status, "sequence")?;
    }

    let terminal_statuses = if doc.terminal_statuses.is_empty() {
        vec![doc.sequence[doc.sequence.len() - 1].clone()]
    } else {
        for status in &doc.terminal_statuses {
            check_status(status, "terminal_statuses")?;
        }
        doc.terminal_statuses.clone()
    };

    let mut emergency = HashMap::new();
    for (trigger_name, status) in &doc.emergency {
        let trigger: Trigger = trigger_name.parse().map_err(|e: String| {
            OrchestratorError::Configuration(format!("flow '{}' of kind '{kind}': {e}", doc.name))
        })?;
        if !trigger.is_emergency() {
            return Err(OrchestratorError::Configuration(format!(
                "flow '{}' of kind '{kind}' maps non-emergency trigger '{trigger}'",
                doc.name
            )));
        }
        check_status(status, "emergency")?;
        emergency.insert(trigger, status.clone());
    }

    Ok(Flow {
        name: doc.name.clone(),
        selector_tags: crate::models::canonicalize_tags(&doc.selector_tags),
        sequence: doc.sequence.clone(),
        terminal_statuses,
        emergency,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_document_parses() {
        let config = FlowConfig::default();
        assert_eq!(config.version(), 1);
        assert!(!config.enforce_child_completion());
    }

    #[test]
    fn role_lookup() {
        let config = FlowConfig::default();
        assert_eq!(
            config.role_of(EntityKind::Task, "pending").unwrap(),
            Role::Queue
        );
        assert_eq!(
            config.role_of(EntityKind::Task, "in-progress").unwrap(),
            Role::Work
        );
        assert_eq!(
            config.role_of(EntityKind::Task, "in-review").unwrap(),
            Role::Review
        );
        assert_eq!(
            config.role_of(EntityKind::Task, "completed").unwrap(),
            Role::Terminal
        );
        assert_eq!(
            config.role_of(EntityKind::Task, "blocked").unwrap(),
            Role::Blocked
        );
        assert!(config.role_of(EntityKind::Task, "nonsense").is_err());
    }

    #[test]
    fn flow_selection_by_tags() {
        let config = FlowConfig::default();

        let plain = config.active_flow(EntityKind::Task, &[]);
        assert_eq!(plain.name, "default_flow");
        assert_eq!(
            plain.sequence,
            vec!["pending", "in-progress", "in-review", "completed"]
        );

        let hotfix = config.active_flow(EntityKind::Task, &["hotfix".to_string()]);
        assert_eq!(hotfix.name, "hotfix_flow");
        assert_eq!(hotfix.sequence, vec!["pending", "in-progress", "completed"]);

        // Extra tags do not disturb the subset match.
        let tagged = config.active_flow(
            EntityKind::Task,
            &["backend".to_string(), "hotfix".to_string()],
        );
        assert_eq!(tagged.name, "hotfix_flow");
    }

    #[test]
    fn initial_and_terminal_statuses() {
        let config = FlowConfig::default();
        assert_eq!(config.initial_status(EntityKind::Project, &[]), "planning");
        assert_eq!(config.initial_status(EntityKind::Task, &[]), "pending");
        assert_eq!(
            config.active_flow(EntityKind::Feature, &[]).terminal_status(),
            "completed"
        );
    }

    #[test]
    fn emergency_targets() {
        let config = FlowConfig::default();
        assert_eq!(
            config.emergency_target(EntityKind::Task, &[], Trigger::Cancel),
            Some("cancelled")
        );
        assert_eq!(
            config.emergency_target(EntityKind::Task, &[], Trigger::Block),
            Some("blocked")
        );
        assert_eq!(
            config.emergency_target(EntityKind::Task, &[], Trigger::Hold),
            Some("on-hold")
        );
    }

    #[test]
    fn unknown_status_in_sequence_is_rejected() {
        let doc = r#"
            version = 2

            [project.statuses]
            planning = "queue"
            completed = "terminal"

            [[project.flows]]
            name = "default_flow"
            sequence = ["planning", "shipped"]

            [feature.statuses]
            planning = "queue"
            completed = "terminal"

            [[feature.flows]]
            name = "default_flow"
            sequence = ["planning", "completed"]

            [task.statuses]
            pending = "queue"
            completed = "terminal"

            [[task.flows]]
            name = "default_flow"
            sequence = ["pending", "completed"]
        "#;
        let err = FlowConfig::from_toml_str(doc).unwrap_err();
        assert_eq!(err.error_code(), "CONFIGURATION_ERROR");
        assert!(format!("{err}").contains("shipped"));
    }

    #[test]
    fn unknown_role_name_is_rejected() {
        let doc = DEFAULT_FLOW_DOCUMENT.replace("planning = \"queue\"", "planning = \"limbo\"");
        assert!(FlowConfig::from_toml_str(&doc).is_err());
    }

    #[test]
    fn missing_fallback_flow_is_rejected() {
        let doc = r#"
            [project.statuses]
            planning = "queue"
            completed = "terminal"

            [[project.flows]]
            name = "tagged_only"
            selector_tags = ["x"]
            sequence = ["planning", "completed"]

            [feature.statuses]
            planning = "queue"
            completed = "terminal"

            [[feature.flows]]
            name = "default_flow"
            sequence = ["planning", "completed"]

            [task.statuses]
            pending = "queue"
            completed = "terminal"

            [[task.flows]]
            name = "default_flow"
            sequence = ["pending", "completed"]
        "#;
        let err = FlowConfig::from_toml_str(doc).unwrap_err();
        assert!(format!("{err}").contains("fallback"));
    }

    #[test]
    fn terminal_defaults_to_last_sequence_status() {
        let doc = r#"
            [project.statuses]
            planning = "queue"
            completed = "terminal"

            [[project.flows]]
            name = "default_flow"
            sequence = ["planning", "completed"]

            [feature.statuses]
            planning = "queue"
            completed = "terminal"

            [[feature.flows]]
            name = "default_flow"
            sequence = ["planning", "completed"]

            [task.statuses]
            pending = "queue"
            completed = "terminal"

            [[task.flows]]
            name = "default_flow"
            sequence = ["pending", "completed"]
        "#;
        let config = FlowConfig::from_toml_str(doc).unwrap();
        let flow = config.active_flow(EntityKind::Project, &[]);
        assert_eq!(flow.terminal_status(), "completed");
        assert!(flow.is_terminal("completed"));
        assert!(!flow.is_terminal("planning"));
    }
}
