use chrono::{DateTime, Utc};
use flow_core::{
    error::{OrchestratorError, Result},
    models::{
        Dependency, DependencyType, EntityKind, KindData, Priority, Role, RoleTransitionRecord,
        Section, SectionFormat, Trigger, WorkItem, WorkItemFilter, WorkItemHeader,
        DEFAULT_COMPLEXITY,
    },
};
use sqlx::{sqlite::SqliteRow, Row};
use uuid::Uuid;

/// Parse a stored uuid column.
pub fn parse_uuid(value: &str, column: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| OrchestratorError::Storage(format!("invalid uuid in column '{column}': {e}")))
}

fn parse_token<T>(value: &str, column: &str) -> Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e| OrchestratorError::Storage(format!("invalid value in column '{column}': {e}")))
}

/// Decode a JSON-encoded tag list column.
pub fn decode_tags(raw: &str) -> Result<Vec<String>> {
    serde_json::from_str(raw)
        .map_err(|e| OrchestratorError::Storage(format!("invalid tags payload: {e}")))
}

/// Encode a tag list for storage.
pub fn encode_tags(tags: &[String]) -> String {
    serde_json::to_string(tags).unwrap_or_else(|_| "[]".to_string())
}

/// Convert a SQLite row into a work item.
pub fn row_to_work_item(row: &SqliteRow) -> Result<WorkItem> {
    let id: String = row.get("id");
    let kind_str: String = row.get("kind");
    let kind: EntityKind = parse_token(&kind_str, "kind")?;

    let parent_id: Option<String> = row.get("parent_id");
    let parent_id = match parent_id {
        Some(raw) => Some(parse_uuid(&raw, "parent_id")?),
        None => None,
    };

    let tags_raw: String = row.get("tags");
    let created_at: DateTime<Utc> = row.get("created_at");
    let modified_at: DateTime<Utc> = row.get("modified_at");

    let priority: Option<String> = row.get("priority");
    let priority: Option<Priority> = match priority {
        Some(raw) => Some(parse_token(&raw, "priority")?),
        None => None,
    };
    let complexity: Option<i64> = row.get("complexity");
    let requires_verification: bool = row.get("requires_verification");

    let data = match kind {
        EntityKind::Project => KindData::Project,
        EntityKind::Feature => KindData::Feature {
            priority: priority.unwrap_or_default(),
            requires_verification,
        },
        EntityKind::Task => KindData::Task {
            priority: priority.unwrap_or_default(),
            complexity: complexity.map(|c| c as u8).unwrap_or(DEFAULT_COMPLEXITY),
            requires_verification,
        },
    };

    Ok(WorkItem {
        header: WorkItemHeader {
            id: parse_uuid(&id, "id")?,
            title: row.get("title"),
            description: row.get("description"),
            summary: row.get("summary"),
            status: row.get("status"),
            parent_id,
            tags: decode_tags(&tags_raw)?,
            version: row.get("version"),
            created_at,
            modified_at,
        },
        data,
    })
}

/// Convert a SQLite row into a dependency edge.
pub fn row_to_dependency(row: &SqliteRow) -> Result<Dependency> {
    let id: String = row.get("id");
    let from: String = row.get("from_task_id");
    let to: String = row.get("to_task_id");
    let dep_type: String = row.get("dep_type");
    let unblock_at: Option<String> = row.get("unblock_at");
    let unblock_at: Option<Role> = match unblock_at {
        Some(raw) => Some(parse_token(&raw, "unblock_at")?),
        None => None,
    };

    Ok(Dependency {
        id: parse_uuid(&id, "id")?,
        from_task_id: parse_uuid(&from, "from_task_id")?,
        to_task_id: parse_uuid(&to, "to_task_id")?,
        dep_type: parse_token::<DependencyType>(&dep_type, "dep_type")?,
        unblock_at,
        created_at: row.get("created_at"),
    })
}

/// Convert a SQLite row into a section.
pub fn row_to_section(row: &SqliteRow) -> Result<Section> {
    let id: String = row.get("id");
    let entity_kind: String = row.get("entity_kind");
    let entity_id: String = row.get("entity_id");
    let format: String = row.get("format");
    let tags_raw: String = row.get("tags");

    Ok(Section {
        id: parse_uuid(&id, "id")?,
        entity_kind: parse_token(&entity_kind, "entity_kind")?,
        entity_id: parse_uuid(&entity_id, "entity_id")?,
        title: row.get("title"),
        content: row.get("content"),
        format: parse_token::<SectionFormat>(&format, "format")?,
        ordinal: row.get("ordinal"),
        tags: decode_tags(&tags_raw)?,
    })
}

/// Convert a SQLite row into an audit record.
pub fn row_to_transition(row: &SqliteRow) -> Result<RoleTransitionRecord> {
    let id: String = row.get("id");
    let entity_id: String = row.get("entity_id");
    let entity_kind: String = row.get("entity_kind");
    let from_role: String = row.get("from_role");
    let to_role: String = row.get("to_role");
    let trigger: String = row.get("trigger_kind");
    let config_version: i64 = row.get("config_version");

    Ok(RoleTransitionRecord {
        id: parse_uuid(&id, "id")?,
        entity_id: parse_uuid(&entity_id, "entity_id")?,
        entity_kind: parse_token(&entity_kind, "entity_kind")?,
        from_status: row.get("from_status"),
        to_status: row.get("to_status"),
        from_role: parse_token::<Role>(&from_role, "from_role")?,
        to_role: parse_token::<Role>(&to_role, "to_role")?,
        trigger: parse_token::<Trigger>(&trigger, "trigger_kind")?,
        automatic: row.get("automatic"),
        summary: row.get("summary"),
        config_version: config_version as u32,
        created_at: row.get("created_at"),
    })
}

/// Translate SQLx failures into the engine's error taxonomy.
pub fn sqlx_error_to_error(err: sqlx::Error) -> OrchestratorError {
    match &err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message();
            if message.contains("FOREIGN KEY constraint failed") {
                OrchestratorError::Validation("referenced item does not exist".to_string())
            } else if message.contains("UNIQUE constraint failed") {
                OrchestratorError::Storage(format!("uniqueness violated: {message}"))
            } else {
                OrchestratorError::Storage(format!("database constraint error: {message}"))
            }
        }
        sqlx::Error::PoolTimedOut => {
            OrchestratorError::Storage("connection pool timeout".to_string())
        }
        sqlx::Error::Io(io_err) => {
            OrchestratorError::Storage(format!("database I/O error: {io_err}"))
        }
        _ => OrchestratorError::Storage(format!("database operation failed: {err}")),
    }
}

pub(crate) const WORK_ITEM_COLUMNS: &str = "id, kind, title, description, summary, status, \
     priority, complexity, requires_verification, parent_id, tags, version, created_at, \
     modified_at";

/// Build the dynamic SELECT for a filtered listing. Ordering is
/// `modified_at` descending with id ascending as tiebreak; tag matches use
/// the JSON encoding's quoted form to avoid substring collisions.
pub fn build_filter_query(
    kind: EntityKind,
    filter: &WorkItemFilter,
) -> sqlx::QueryBuilder<'static, sqlx::Sqlite> {
    let mut qb: sqlx::QueryBuilder<sqlx::Sqlite> = sqlx::QueryBuilder::new(format!(
        "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE kind = "
    ));
    qb.push_bind(kind.as_str());

    if let Some(parent_id) = filter.parent_id {
        qb.push(" AND parent_id = ");
        qb.push_bind(parent_id.to_string());
    }

    if !filter.status_in.is_empty() {
        qb.push(" AND status IN (");
        let mut separated = qb.separated(", ");
        for status in &filter.status_in {
            separated.push_bind(status.clone());
        }
        qb.push(")");
    }

    if !filter.status_not_in.is_empty() {
        qb.push(" AND status NOT IN (");
        let mut separated = qb.separated(", ");
        for status in &filter.status_not_in {
            separated.push_bind(status.clone());
        }
        qb.push(")");
    }

    if !filter.priority_in.is_empty() {
        qb.push(" AND priority IN (");
        let mut separated = qb.separated(", ");
        for priority in &filter.priority_in {
            separated.push_bind(priority.as_str());
        }
        qb.push(")");
    }

    if !filter.priority_not_in.is_empty() {
        qb.push(" AND (priority IS NULL OR priority NOT IN (");
        let mut separated = qb.separated(", ");
        for priority in &filter.priority_not_in {
            separated.push_bind(priority.as_str());
        }
        qb.push("))");
    }

    for tag in &filter.tags {
        qb.push(" AND tags LIKE ");
        qb.push_bind(format!("%\"{}\"%", tag.to_ascii_lowercase()));
    }

    if let Some(text) = &filter.text {
        let needle = format!("%{}%", text.to_ascii_lowercase());
        qb.push(" AND (LOWER(title) LIKE ");
        qb.push_bind(needle.clone());
        qb.push(" OR LOWER(COALESCE(description, '')) LIKE ");
        qb.push_bind(needle);
        qb.push(")");
    }

    qb.push(" ORDER BY modified_at DESC, id ASC");

    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ");
        qb.push_bind(limit as i64);
    }
    if let Some(offset) = filter.offset {
        qb.push(" OFFSET ");
        qb.push_bind(offset as i64);
    }

    qb
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Execute;

    #[test]
    fn tags_round_trip() {
        let tags = vec!["hotfix".to_string(), "backend".to_string()];
        let encoded = encode_tags(&tags);
        assert_eq!(decode_tags(&encoded).unwrap(), tags);
        assert_eq!(decode_tags("[]").unwrap(), Vec::<String>::new());
        assert!(decode_tags("not json").is_err());
    }

    #[test]
    fn filter_query_shapes() {
        let filter = WorkItemFilter::default();
        let mut qb = build_filter_query(EntityKind::Task, &filter);
        let sql = qb.build().sql().to_string();
        assert!(sql.contains("WHERE kind = "));
        assert!(sql.contains("ORDER BY modified_at DESC, id ASC"));
        assert!(!sql.contains("LIMIT"));

        let filter = WorkItemFilter {
            status_in: vec!["pending".to_string(), "in-progress".to_string()],
            status_not_in: vec!["cancelled".to_string()],
            priority_in: vec![Priority::High],
            tags: vec!["backend".to_string()],
            text: Some("cache".to_string()),
            parent_id: Some(Uuid::new_v4()),
            limit: Some(10),
            offset: Some(20),
            ..Default::default()
        };
        let mut qb = build_filter_query(EntityKind::Task, &filter);
        let sql = qb.build().sql().to_string();
        assert!(sql.contains("status IN ("));
        assert!(sql.contains("status NOT IN ("));
        assert!(sql.contains("priority IN ("));
        assert!(sql.contains("tags LIKE "));
        assert!(sql.contains("LOWER(title) LIKE "));
        assert!(sql.contains("parent_id = "));
        assert!(sql.contains("LIMIT "));
        assert!(sql.contains("OFFSET "));
    }

    #[test]
    fn uuid_parsing_reports_column() {
        let err = parse_uuid("definitely-not-a-uuid", "parent_id").unwrap_err();
        assert!(format!("{err}").contains("parent_id"));
    }
}
