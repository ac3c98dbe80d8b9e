use crate::error::{OrchestratorError, Result};
use crate::models::{EntityKind, NewWorkItem, UpdateWorkItem, MAX_SUMMARY_LEN};
use regex::Regex;
use std::sync::OnceLock;

/// Maximum length of a work item title in characters.
pub const MAX_TITLE_LEN: usize = 200;

/// Maximum number of items accepted by a single batch write.
pub const MAX_BATCH_ITEMS: usize = 100;

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9_-]*$").expect("static tag pattern"))
}

/// Validation utilities for work item operations.
pub struct ItemValidator;

impl ItemValidator {
    /// Validate a work item title: non-empty after trimming, at most
    /// [`MAX_TITLE_LEN`] characters.
    pub fn validate_title(title: &str) -> Result<()> {
        if title.trim().is_empty() {
            return Err(OrchestratorError::empty_field("title"));
        }
        if title.chars().count() > MAX_TITLE_LEN {
            return Err(OrchestratorError::out_of_range(
                "title",
                &format!("must be at most {MAX_TITLE_LEN} characters"),
            ));
        }
        Ok(())
    }

    /// Validate a summary: at most [`MAX_SUMMARY_LEN`] characters. Empty is
    /// allowed here; the completion gate enforces presence separately.
    pub fn validate_summary(summary: &str) -> Result<()> {
        if summary.chars().count() > MAX_SUMMARY_LEN {
            return Err(OrchestratorError::out_of_range(
                "summary",
                &format!("must be at most {MAX_SUMMARY_LEN} characters"),
            ));
        }
        Ok(())
    }

    /// Validate task complexity: 1..=10.
    pub fn validate_complexity(complexity: u8) -> Result<()> {
        if !(1..=10).contains(&complexity) {
            return Err(OrchestratorError::out_of_range(
                "complexity",
                "must be between 1 and 10",
            ));
        }
        Ok(())
    }

    /// Validate a canonicalised tag: lowercase alphanumeric with hyphens
    /// and underscores, starting alphanumeric.
    pub fn validate_tag(tag: &str) -> Result<()> {
        if tag.is_empty() {
            return Err(OrchestratorError::empty_field("tag"));
        }
        if !tag_pattern().is_match(tag) {
            return Err(OrchestratorError::Validation(format!(
                "Invalid tag '{tag}': tags are lowercase alphanumeric with '-' or '_'"
            )));
        }
        Ok(())
    }

    /// Which parent kinds a child kind may nest under.
    pub fn validate_parent_kind(child: EntityKind, parent: EntityKind) -> Result<()> {
        let ok = match child {
            EntityKind::Project => false,
            EntityKind::Feature => parent == EntityKind::Project,
            EntityKind::Task => matches!(parent, EntityKind::Project | EntityKind::Feature),
        };
        if ok {
            Ok(())
        } else {
            Err(OrchestratorError::Validation(format!(
                "a {child} cannot be nested under a {parent}"
            )))
        }
    }

    /// Validate batch size against the per-request ceiling.
    pub fn validate_batch_size(len: usize) -> Result<()> {
        if len == 0 {
            return Err(OrchestratorError::Validation(
                "batch contains no items".to_string(),
            ));
        }
        if len > MAX_BATCH_ITEMS {
            return Err(OrchestratorError::out_of_range(
                "items",
                &format!("batch size {len} exceeds the maximum of {MAX_BATCH_ITEMS}"),
            ));
        }
        Ok(())
    }

    /// Static validation of a creation payload. Reference existence is
    /// checked by the batch coordinator against the store; this covers
    /// structure only.
    pub fn validate_new_item(item: &NewWorkItem) -> Result<()> {
        Self::validate_title(&item.title)?;
        Self::validate_summary(&item.summary)?;

        if item.kind == EntityKind::Project && item.parent_id.is_some() {
            return Err(OrchestratorError::Validation(
                "a project cannot have a parent".to_string(),
            ));
        }

        if let Some(complexity) = item.complexity {
            if item.kind != EntityKind::Task {
                return Err(OrchestratorError::Validation(
                    "complexity applies only to tasks".to_string(),
                ));
            }
            Self::validate_complexity(complexity)?;
        }

        if item.priority.is_some() && item.kind == EntityKind::Project {
            return Err(OrchestratorError::Validation(
                "priority applies only to features and tasks".to_string(),
            ));
        }

        for tag in crate::models::canonicalize_tags(&item.tags) {
            Self::validate_tag(&tag)?;
        }

        for section in &item.sections {
            if section.title.trim().is_empty() {
                return Err(OrchestratorError::empty_field("section title"));
            }
        }

        Ok(())
    }

    /// Static validation of an update patch. Status changes are rejected
    /// here: they only ever flow through transition triggers.
    pub fn validate_update(kind: EntityKind, patch: &UpdateWorkItem) -> Result<()> {
        if patch.is_empty() {
            return Err(OrchestratorError::Validation(
                "update contains no fields".to_string(),
            ));
        }
        if patch.status.is_some() {
            return Err(OrchestratorError::Validation(
                "status cannot be updated directly; request a transition".to_string(),
            ));
        }
        if let Some(title) = &patch.title {
            Self::validate_title(title)?;
        }
        if let Some(summary) = &patch.summary {
            Self::validate_summary(summary)?;
        }
        if let Some(complexity) = patch.complexity {
            if kind != EntityKind::Task {
                return Err(OrchestratorError::Validation(
                    "complexity applies only to tasks".to_string(),
                ));
            }
            Self::validate_complexity(complexity)?;
        }
        if patch.priority.is_some() && kind == EntityKind::Project {
            return Err(OrchestratorError::Validation(
                "priority applies only to features and tasks".to_string(),
            ));
        }
        if let Some(tags) = &patch.tags {
            for tag in crate::models::canonicalize_tags(tags) {
                Self::validate_tag(&tag)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_bounds() {
        assert!(ItemValidator::validate_title("Ship the parser").is_ok());
        assert!(ItemValidator::validate_title("").is_err());
        assert!(ItemValidator::validate_title("   ").is_err());
        assert!(ItemValidator::validate_title(&"x".repeat(MAX_TITLE_LEN)).is_ok());
        assert!(ItemValidator::validate_title(&"x".repeat(MAX_TITLE_LEN + 1)).is_err());
    }

    #[test]
    fn summary_bounds() {
        assert!(ItemValidator::validate_summary("").is_ok());
        assert!(ItemValidator::validate_summary(&"s".repeat(MAX_SUMMARY_LEN)).is_ok());
        assert!(ItemValidator::validate_summary(&"s".repeat(MAX_SUMMARY_LEN + 1)).is_err());
    }

    #[test]
    fn complexity_bounds() {
        assert!(ItemValidator::validate_complexity(0).is_err());
        assert!(ItemValidator::validate_complexity(1).is_ok());
        assert!(ItemValidator::validate_complexity(10).is_ok());
        assert!(ItemValidator::validate_complexity(11).is_err());
    }

    #[test]
    fn tag_charset() {
        assert!(ItemValidator::validate_tag("hotfix").is_ok());
        assert!(ItemValidator::validate_tag("api-v2").is_ok());
        assert!(ItemValidator::validate_tag("data_plane").is_ok());
        assert!(ItemValidator::validate_tag("").is_err());
        assert!(ItemValidator::validate_tag("-leading").is_err());
        assert!(ItemValidator::validate_tag("UPPER").is_err());
        assert!(ItemValidator::validate_tag("has space").is_err());
    }

    #[test]
    fn parent_kind_compatibility() {
        use EntityKind::*;
        assert!(ItemValidator::validate_parent_kind(Feature, Project).is_ok());
        assert!(ItemValidator::validate_parent_kind(Task, Project).is_ok());
        assert!(ItemValidator::validate_parent_kind(Task, Feature).is_ok());
        assert!(ItemValidator::validate_parent_kind(Feature, Feature).is_err());
        assert!(ItemValidator::validate_parent_kind(Task, Task).is_err());
        assert!(ItemValidator::validate_parent_kind(Project, Project).is_err());
    }

    #[test]
    fn batch_size_limits() {
        assert!(ItemValidator::validate_batch_size(0).is_err());
        assert!(ItemValidator::validate_batch_size(1).is_ok());
        assert!(ItemValidator::validate_batch_size(MAX_BATCH_ITEMS).is_ok());
        assert!(ItemValidator::validate_batch_size(MAX_BATCH_ITEMS + 1).is_err());
    }

    #[test]
    fn new_item_structure() {
        let mut item = NewWorkItem::new(EntityKind::Task, "Wire up the cache");
        assert!(ItemValidator::validate_new_item(&item).is_ok());

        item.complexity = Some(12);
        assert!(ItemValidator::validate_new_item(&item).is_err());
        item.complexity = Some(7);
        assert!(ItemValidator::validate_new_item(&item).is_ok());

        let mut project = NewWorkItem::new(EntityKind::Project, "Platform");
        project.parent_id = Some(uuid::Uuid::new_v4());
        assert!(ItemValidator::validate_new_item(&project).is_err());
    }

    #[test]
    fn update_rejects_direct_status_writes() {
        let patch = UpdateWorkItem {
            status: Some("completed".to_string()),
            ..Default::default()
        };
        let err = ItemValidator::validate_update(EntityKind::Task, &patch).unwrap_err();
        assert!(format!("{err}").contains("transition"));
    }

    #[test]
    fn update_rejects_empty_patch() {
        let err = ItemValidator::validate_update(EntityKind::Task, &UpdateWorkItem::default())
            .unwrap_err();
        assert!(err.is_validation());
    }
}
