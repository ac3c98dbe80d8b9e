use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum length of an item summary in characters.
pub const MAX_SUMMARY_LEN: usize = 500;

/// Default complexity assigned to tasks that do not specify one.
pub const DEFAULT_COMPLEXITY: u8 = 5;

/// The three container kinds managed by the orchestration engine.
///
/// Work items form a hierarchy: projects contain features (and may contain
/// tasks directly), features contain tasks. The ordering of the variants is
/// the canonical lock-acquisition order for multi-entity writes.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Project,
    Feature,
    Task,
}

impl EntityKind {
    /// Ordinal used for canonical lock ordering.
    pub fn ordinal(self) -> u8 {
        match self {
            EntityKind::Project => 0,
            EntityKind::Feature => 1,
            EntityKind::Task => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Project => "project",
            EntityKind::Feature => "feature",
            EntityKind::Task => "task",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "project" => Ok(EntityKind::Project),
            "feature" => Ok(EntityKind::Feature),
            "task" => Ok(EntityKind::Task),
            other => Err(format!("unknown entity kind '{other}'")),
        }
    }
}

/// Coarse workflow phase derived from an item's status.
///
/// Roles are ordered: `Blocked < Queue < Work < Review < Terminal`. The
/// ordering is load-bearing — dependency gates compare the blocking item's
/// role against the edge's `unblock_at` threshold, and `Blocked` sits below
/// `Queue` so that "role ≥ Queue" naturally excludes blocked items.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Blocked,
    Queue,
    Work,
    Review,
    Terminal,
}

impl Role {
    /// Numeric ordinal: Blocked = -1, Queue = 0, Work = 1, Review = 2,
    /// Terminal = 3.
    pub fn ordinal(self) -> i8 {
        match self {
            Role::Blocked => -1,
            Role::Queue => 0,
            Role::Work => 1,
            Role::Review => 2,
            Role::Terminal => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Blocked => "blocked",
            Role::Queue => "queue",
            Role::Work => "work",
            Role::Review => "review",
            Role::Terminal => "terminal",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blocked" => Ok(Role::Blocked),
            "queue" => Ok(Role::Queue),
            "work" => Ok(Role::Work),
            "review" => Ok(Role::Review),
            "terminal" => Ok(Role::Terminal),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Named action resolved by the transition validator into a concrete status
/// move. `Start` and `Complete` follow the active flow's sequence;
/// `Cancel`, `Block` and `Hold` are emergency transitions reachable from
/// any state.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Start,
    Complete,
    Cancel,
    Block,
    Hold,
}

impl Trigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Start => "start",
            Trigger::Complete => "complete",
            Trigger::Cancel => "cancel",
            Trigger::Block => "block",
            Trigger::Hold => "hold",
        }
    }

    /// Emergency triggers jump to a flow-declared status from any state and
    /// bypass the forward-progression prerequisite gates.
    pub fn is_emergency(self) -> bool {
        matches!(self, Trigger::Cancel | Trigger::Block | Trigger::Hold)
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" => Ok(Trigger::Start),
            "complete" => Ok(Trigger::Complete),
            "cancel" => Ok(Trigger::Cancel),
            "block" => Ok(Trigger::Block),
            "hold" => Ok(Trigger::Hold),
            other => Err(format!("unknown trigger '{other}'")),
        }
    }
}

/// Priority of a feature or task.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Medium,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            other => Err(format!("unknown priority '{other}'")),
        }
    }
}

/// Fields shared by every work item regardless of kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItemHeader {
    /// Stable opaque identifier.
    pub id: Uuid,
    /// Short human-readable title (surfaced as `name` for projects and
    /// features on the tool surface).
    pub title: String,
    /// Free-form description.
    pub description: Option<String>,
    /// Completion summary; must be non-empty before the item can be
    /// completed.
    pub summary: String,
    /// Current status token, drawn from the configured set for the kind.
    pub status: String,
    /// Containing project or feature, if any.
    pub parent_id: Option<Uuid>,
    /// Ordered, lowercase tags; drive flow selection and filtering.
    pub tags: Vec<String>,
    /// Monotonic version counter, incremented on every persisted mutation.
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// Per-kind payload of a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum KindData {
    Project,
    Feature {
        priority: Priority,
        requires_verification: bool,
    },
    Task {
        priority: Priority,
        /// Effort estimate on a 1..=10 scale.
        complexity: u8,
        requires_verification: bool,
    },
}

/// A project, feature or task: common header plus kind-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub header: WorkItemHeader,
    pub data: KindData,
}

impl WorkItem {
    pub fn kind(&self) -> EntityKind {
        match self.data {
            KindData::Project => EntityKind::Project,
            KindData::Feature { .. } => EntityKind::Feature,
            KindData::Task { .. } => EntityKind::Task,
        }
    }

    pub fn id(&self) -> Uuid {
        self.header.id
    }

    pub fn priority(&self) -> Option<Priority> {
        match self.data {
            KindData::Project => None,
            KindData::Feature { priority, .. } | KindData::Task { priority, .. } => Some(priority),
        }
    }

    pub fn complexity(&self) -> Option<u8> {
        match self.data {
            KindData::Task { complexity, .. } => Some(complexity),
            _ => None,
        }
    }

    pub fn requires_verification(&self) -> bool {
        match self.data {
            KindData::Project => false,
            KindData::Feature {
                requires_verification,
                ..
            }
            | KindData::Task {
                requires_verification,
                ..
            } => requires_verification,
        }
    }

    /// True when the summary satisfies the completion requirement.
    pub fn has_summary(&self) -> bool {
        !self.header.summary.trim().is_empty()
    }
}

/// Data transfer object for creating a new work item.
///
/// `id` may be pre-assigned so that other items in the same batch can
/// reference it as their parent; when absent the coordinator assigns one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWorkItem {
    pub id: Option<Uuid>,
    pub kind: EntityKind,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub summary: String,
    /// Explicit initial status; defaults to the first status of the active
    /// flow when absent.
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub priority: Option<Priority>,
    #[serde(default)]
    pub complexity: Option<u8>,
    #[serde(default)]
    pub requires_verification: bool,
    /// Content blocks persisted alongside the item.
    #[serde(default)]
    pub sections: Vec<NewSection>,
}

impl NewWorkItem {
    pub fn new(kind: EntityKind, title: impl Into<String>) -> Self {
        Self {
            id: None,
            kind,
            title: title.into(),
            description: None,
            summary: String::new(),
            status: None,
            parent_id: None,
            tags: Vec::new(),
            priority: None,
            complexity: None,
            requires_verification: false,
            sections: Vec::new(),
        }
    }
}

/// Field-wise patch for an existing work item.
///
/// `None` leaves a field untouched. Nullable fields use `Option<Option<_>>`
/// so that `Some(None)` clears them. Status is carried here so the
/// transition executor can persist resolved moves; it is never accepted
/// from direct field updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateWorkItem {
    pub title: Option<String>,
    pub description: Option<Option<String>>,
    pub summary: Option<String>,
    pub status: Option<String>,
    pub parent_id: Option<Option<Uuid>>,
    pub tags: Option<Vec<String>>,
    pub priority: Option<Priority>,
    pub complexity: Option<u8>,
    pub requires_verification: Option<bool>,
}

impl UpdateWorkItem {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// Filter criteria for listing work items. All fields are optional and are
/// combined with AND logic; results are ordered by `modified_at`
/// descending with `id` as tiebreak.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkItemFilter {
    /// Every listed tag must be present on the item.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub status_in: Vec<String>,
    #[serde(default)]
    pub status_not_in: Vec<String>,
    #[serde(default)]
    pub priority_in: Vec<Priority>,
    #[serde(default)]
    pub priority_not_in: Vec<Priority>,
    /// Restrict to direct children of this container.
    pub parent_id: Option<Uuid>,
    /// Case-insensitive substring match over title and description.
    pub text: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Relationship between two tasks.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyType {
    Blocks,
    IsBlockedBy,
    RelatesTo,
}

impl DependencyType {
    pub fn as_str(self) -> &'static str {
        match self {
            DependencyType::Blocks => "blocks",
            DependencyType::IsBlockedBy => "is-blocked-by",
            DependencyType::RelatesTo => "relates-to",
        }
    }
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DependencyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blocks" => Ok(DependencyType::Blocks),
            "is-blocked-by" | "is_blocked_by" => Ok(DependencyType::IsBlockedBy),
            "relates-to" | "relates_to" => Ok(DependencyType::RelatesTo),
            other => Err(format!("unknown dependency type '{other}'")),
        }
    }
}

/// Directed edge between two distinct tasks.
///
/// `IsBlockedBy(a, b)` is the reverse notation of `Blocks(b, a)`; gating
/// and cycle analysis always operate on the normalised `Blocks` direction.
/// `RelatesTo` is informational and never gates anything.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dependency {
    pub id: Uuid,
    pub from_task_id: Uuid,
    pub to_task_id: Uuid,
    pub dep_type: DependencyType,
    /// Role the blocking task must reach before the blocked task may start.
    /// `None` means full completion (`Terminal`).
    pub unblock_at: Option<Role>,
    pub created_at: DateTime<Utc>,
}

impl Dependency {
    /// Role threshold at which this edge stops blocking.
    pub fn unblock_threshold(&self) -> Role {
        self.unblock_at.unwrap_or(Role::Terminal)
    }

    /// The edge in `Blocks` direction, or `None` for `RelatesTo`.
    /// Returns `(blocking_task, blocked_task, threshold)`.
    pub fn normalized(&self) -> Option<(Uuid, Uuid, Role)> {
        match self.dep_type {
            DependencyType::Blocks => {
                Some((self.from_task_id, self.to_task_id, self.unblock_threshold()))
            }
            DependencyType::IsBlockedBy => {
                Some((self.to_task_id, self.from_task_id, self.unblock_threshold()))
            }
            DependencyType::RelatesTo => None,
        }
    }
}

/// Data transfer object for creating a dependency edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDependency {
    pub from_task_id: Uuid,
    pub to_task_id: Uuid,
    #[serde(default = "default_dep_type")]
    pub dep_type: DependencyType,
    #[serde(default)]
    pub unblock_at: Option<Role>,
}

fn default_dep_type() -> DependencyType {
    DependencyType::Blocks
}

/// Direction selector for neighbor queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
    All,
}

impl Default for Direction {
    fn default() -> Self {
        Direction::All
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "incoming" => Ok(Direction::Incoming),
            "outgoing" => Ok(Direction::Outgoing),
            "all" => Ok(Direction::All),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

/// A blocking task and its current role, reported when a transition is
/// rejected by the dependency gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocker {
    pub task_id: Uuid,
    pub role: Role,
}

/// Content format of a section body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionFormat {
    Markdown,
    PlainText,
    Json,
    Code,
}

impl Default for SectionFormat {
    fn default() -> Self {
        SectionFormat::Markdown
    }
}

impl SectionFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            SectionFormat::Markdown => "markdown",
            SectionFormat::PlainText => "plain_text",
            SectionFormat::Json => "json",
            SectionFormat::Code => "code",
        }
    }
}

impl std::str::FromStr for SectionFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "markdown" => Ok(SectionFormat::Markdown),
            "plain_text" | "plain-text" | "text" => Ok(SectionFormat::PlainText),
            "json" => Ok(SectionFormat::Json),
            "code" => Ok(SectionFormat::Code),
            other => Err(format!("unknown section format '{other}'")),
        }
    }
}

/// Content block attached to a work item. The engine treats section bodies
/// as opaque payloads; they ride along on create and are removed on
/// cascading delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: Uuid,
    pub entity_kind: EntityKind,
    pub entity_id: Uuid,
    pub title: String,
    pub content: String,
    pub format: SectionFormat,
    pub ordinal: i64,
    pub tags: Vec<String>,
}

/// Data transfer object for creating a section alongside its parent item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSection {
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub format: SectionFormat,
    #[serde(default)]
    pub ordinal: i64,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Append-only audit record of a role transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleTransitionRecord {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub entity_kind: EntityKind,
    pub from_status: String,
    pub to_status: String,
    pub from_role: Role,
    pub to_role: Role,
    pub trigger: Trigger,
    /// True when the transition was applied by the cascade engine rather
    /// than requested directly.
    pub automatic: bool,
    pub summary: Option<String>,
    /// Flow-configuration version observed at transition time.
    pub config_version: u32,
    pub created_at: DateTime<Utc>,
}

/// Inclusive time window for audit queries; unbounded ends are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Lowercases, trims and de-duplicates tags while preserving first-seen
/// order. Empty entries are dropped.
pub fn canonicalize_tags(tags: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::with_capacity(tags.len());
    for tag in tags {
        let canon = tag.trim().to_ascii_lowercase();
        if !canon.is_empty() && seen.insert(canon.clone()) {
            out.push(canon);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_ordering_matches_ordinals() {
        assert!(Role::Blocked < Role::Queue);
        assert!(Role::Queue < Role::Work);
        assert!(Role::Work < Role::Review);
        assert!(Role::Review < Role::Terminal);

        assert_eq!(Role::Blocked.ordinal(), -1);
        assert_eq!(Role::Queue.ordinal(), 0);
        assert_eq!(Role::Work.ordinal(), 1);
        assert_eq!(Role::Review.ordinal(), 2);
        assert_eq!(Role::Terminal.ordinal(), 3);
    }

    #[test]
    fn kind_lock_ordering() {
        assert!(EntityKind::Project < EntityKind::Feature);
        assert!(EntityKind::Feature < EntityKind::Task);
        assert_eq!(EntityKind::Project.ordinal(), 0);
        assert_eq!(EntityKind::Task.ordinal(), 2);
    }

    #[test]
    fn dependency_normalization() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let blocks = Dependency {
            id: Uuid::new_v4(),
            from_task_id: a,
            to_task_id: b,
            dep_type: DependencyType::Blocks,
            unblock_at: None,
            created_at: Utc::now(),
        };
        assert_eq!(blocks.normalized(), Some((a, b, Role::Terminal)));

        let reversed = Dependency {
            dep_type: DependencyType::IsBlockedBy,
            unblock_at: Some(Role::Review),
            ..blocks.clone()
        };
        // IsBlockedBy(a, b) reads "a is blocked by b": b blocks a.
        assert_eq!(reversed.normalized(), Some((b, a, Role::Review)));

        let relates = Dependency {
            dep_type: DependencyType::RelatesTo,
            ..blocks
        };
        assert_eq!(relates.normalized(), None);
    }

    #[test]
    fn tag_canonicalisation_preserves_order_and_dedupes() {
        let tags = vec![
            "  Hotfix ".to_string(),
            "backend".to_string(),
            "hotfix".to_string(),
            "".to_string(),
        ];
        assert_eq!(canonicalize_tags(&tags), vec!["hotfix", "backend"]);
    }

    #[test]
    fn enum_round_trips() {
        for kind in [EntityKind::Project, EntityKind::Feature, EntityKind::Task] {
            assert_eq!(kind.as_str().parse::<EntityKind>().unwrap(), kind);
        }
        for role in [
            Role::Blocked,
            Role::Queue,
            Role::Work,
            Role::Review,
            Role::Terminal,
        ] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        for trigger in [
            Trigger::Start,
            Trigger::Complete,
            Trigger::Cancel,
            Trigger::Block,
            Trigger::Hold,
        ] {
            assert_eq!(trigger.as_str().parse::<Trigger>().unwrap(), trigger);
        }
        for dep in [
            DependencyType::Blocks,
            DependencyType::IsBlockedBy,
            DependencyType::RelatesTo,
        ] {
            assert_eq!(dep.as_str().parse::<DependencyType>().unwrap(), dep);
        }
    }

    #[test]
    fn update_patch_emptiness() {
        assert!(UpdateWorkItem::default().is_empty());
        let patch = UpdateWorkItem {
            summary: Some("done".to_string()),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }
}
