use crate::common::{
    build_filter_query, encode_tags, row_to_dependency, row_to_section, row_to_transition,
    row_to_work_item, sqlx_error_to_error, WORK_ITEM_COLUMNS,
};
use async_trait::async_trait;
use chrono::Utc;
use flow_core::{
    error::{OrchestratorError, Result},
    models::{
        Dependency, Direction, EntityKind, Role, RoleTransitionRecord, Section, TimeRange,
        UpdateWorkItem, WorkItem, WorkItemFilter,
    },
    repository::{
        DependencyRepository, SectionRepository, TransitionLogRepository, WorkItemRepository,
    },
};
use sqlx::{migrate::MigrateDatabase, Sqlite, SqliteConnection, SqlitePool};
use uuid::Uuid;

/// SQLite implementation of the entity store.
///
/// Uses a connection pool with WAL journaling for file databases, enforced
/// foreign keys and a busy timeout. Every trait method runs as a single
/// transaction; batch methods commit all-or-nothing.
#[derive(Debug, Clone)]
pub struct SqliteEntityStore {
    pool: SqlitePool,
}

impl SqliteEntityStore {
    /// Connect to a SQLite database, creating the file if needed.
    ///
    /// # Arguments
    /// * `database_url` - SQLite URL (`sqlite://path.db`), bare path, or `:memory:`
    pub async fn new(database_url: &str) -> Result<Self> {
        let db_url = if database_url.starts_with(":memory:")
            || database_url.starts_with("sqlite://")
        {
            database_url.to_string()
        } else {
            format!("sqlite://{database_url}")
        };

        if !db_url.contains(":memory:") && !Sqlite::database_exists(&db_url).await.unwrap_or(false)
        {
            match Sqlite::create_database(&db_url).await {
                Ok(_) => tracing::info!("database created"),
                Err(error) => {
                    tracing::error!(%error, "failed to create database");
                    return Err(OrchestratorError::Storage(format!(
                        "failed to create database: {error}"
                    )));
                }
            }
        }

        let connect_options = if db_url.contains(":memory:") {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(&db_url)
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Memory)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        } else {
            sqlx::sqlite::SqliteConnectOptions::new()
                .filename(db_url.replace("sqlite://", ""))
                .create_if_missing(true)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
        };

        let pool = SqlitePool::connect_with(connect_options)
            .await
            .map_err(sqlx_error_to_error)?;

        Ok(Self { pool })
    }

    /// Apply pending migrations. Call once after connecting.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations/sqlite")
            .run(&self.pool)
            .await
            .map_err(|e| OrchestratorError::Storage(format!("migration failed: {e}")))?;
        tracing::info!("database migrations completed");
        Ok(())
    }

    /// Direct pool access, intended for tests.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn begin(&self) -> Result<sqlx::Transaction<'_, Sqlite>> {
        self.pool.begin().await.map_err(sqlx_error_to_error)
    }
}

async fn insert_item(conn: &mut SqliteConnection, item: &WorkItem) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO work_items
            (id, kind, title, description, summary, status, priority, complexity,
             requires_verification, parent_id, tags, version, created_at, modified_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(item.id().to_string())
    .bind(item.kind().as_str())
    .bind(&item.header.title)
    .bind(&item.header.description)
    .bind(&item.header.summary)
    .bind(&item.header.status)
    .bind(item.priority().map(|p| p.as_str()))
    .bind(item.complexity().map(i64::from))
    .bind(item.requires_verification())
    .bind(item.header.parent_id.map(|p| p.to_string()))
    .bind(encode_tags(&item.header.tags))
    .bind(item.header.version)
    .bind(item.header.created_at)
    .bind(item.header.modified_at)
    .execute(&mut *conn)
    .await
    .map_err(sqlx_error_to_error)?;
    Ok(())
}

/// Version-checked dynamic update. The version predicate makes the write
/// conditional; a missing row is disambiguated into `NotFound` or
/// `VersionMismatch` with a follow-up read inside the same transaction.
async fn apply_update(
    conn: &mut SqliteConnection,
    id: Uuid,
    expected_version: i64,
    patch: &UpdateWorkItem,
) -> Result<WorkItem> {
    let mut qb: sqlx::QueryBuilder<Sqlite> =
        sqlx::QueryBuilder::new("UPDATE work_items SET version = version + 1, modified_at = ");
    qb.push_bind(Utc::now());

    if let Some(title) = &patch.title {
        qb.push(", title = ");
        qb.push_bind(title.clone());
    }
    if let Some(description) = &patch.description {
        qb.push(", description = ");
        qb.push_bind(description.clone());
    }
    if let Some(summary) = &patch.summary {
        qb.push(", summary = ");
        qb.push_bind(summary.clone());
    }
    if let Some(status) = &patch.status {
        qb.push(", status = ");
        qb.push_bind(status.clone());
    }
    if let Some(parent_id) = &patch.parent_id {
        qb.push(", parent_id = ");
        qb.push_bind(parent_id.map(|p| p.to_string()));
    }
    if let Some(tags) = &patch.tags {
        qb.push(", tags = ");
        qb.push_bind(encode_tags(tags));
    }
    if let Some(priority) = patch.priority {
        qb.push(", priority = ");
        qb.push_bind(priority.as_str());
    }
    if let Some(complexity) = patch.complexity {
        qb.push(", complexity = ");
        qb.push_bind(complexity as i64);
    }
    if let Some(requires_verification) = patch.requires_verification {
        qb.push(", requires_verification = ");
        qb.push_bind(requires_verification);
    }

    qb.push(" WHERE id = ");
    qb.push_bind(id.to_string());
    qb.push(" AND version = ");
    qb.push_bind(expected_version);
    qb.push(format!(" RETURNING {WORK_ITEM_COLUMNS}"));

    let row = qb
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(sqlx_error_to_error)?;

    match row {
        Some(row) => row_to_work_item(&row),
        None => {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM work_items WHERE id = ?")
                    .bind(id.to_string())
                    .fetch_optional(&mut *conn)
                    .await
                    .map_err(sqlx_error_to_error)?;
            match actual {
                Some(actual) => Err(OrchestratorError::VersionMismatch {
                    expected: expected_version,
                    actual,
                }),
                None => Err(OrchestratorError::NotFound(format!(
                    "work item {id} not found"
                ))),
            }
        }
    }
}

async fn has_children_tx(conn: &mut SqliteConnection, id: Uuid) -> Result<bool> {
    let id_str = id.to_string();
    let exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(SELECT 1 FROM work_items WHERE parent_id = ?1)
            OR EXISTS(SELECT 1 FROM dependencies WHERE from_task_id = ?1 OR to_task_id = ?1)
        "#,
    )
    .bind(&id_str)
    .fetch_one(&mut *conn)
    .await
    .map_err(sqlx_error_to_error)?;
    Ok(exists)
}

/// Roots plus all transitive descendants, parents before children.
async fn collect_descendants(conn: &mut SqliteConnection, roots: &[Uuid]) -> Result<Vec<Uuid>> {
    let mut all: Vec<Uuid> = roots.to_vec();
    let mut frontier: Vec<Uuid> = roots.to_vec();
    while !frontier.is_empty() {
        let mut next = Vec::new();
        for parent in &frontier {
            let rows: Vec<String> =
                sqlx::query_scalar("SELECT id FROM work_items WHERE parent_id = ? ORDER BY id")
                    .bind(parent.to_string())
                    .fetch_all(&mut *conn)
                    .await
                    .map_err(sqlx_error_to_error)?;
            for raw in rows {
                let child = crate::common::parse_uuid(&raw, "id")?;
                if !all.contains(&child) {
                    all.push(child);
                    next.push(child);
                }
            }
        }
        frontier = next;
    }
    Ok(all)
}

/// Remove items (children first) along with their sections and any
/// dependency edges touching them. Returns the number of items removed.
async fn delete_items_tx(conn: &mut SqliteConnection, ids: &[Uuid]) -> Result<u64> {
    let mut removed = 0u64;
    for id in ids.iter().rev() {
        let id_str = id.to_string();
        sqlx::query("DELETE FROM dependencies WHERE from_task_id = ?1 OR to_task_id = ?1")
            .bind(&id_str)
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_error)?;
        sqlx::query("DELETE FROM sections WHERE entity_id = ?")
            .bind(&id_str)
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_error)?;
        let result = sqlx::query("DELETE FROM work_items WHERE id = ?")
            .bind(&id_str)
            .execute(&mut *conn)
            .await
            .map_err(sqlx_error_to_error)?;
        removed += result.rows_affected();
    }
    Ok(removed)
}

#[async_trait]
impl WorkItemRepository for SqliteEntityStore {
    async fn get(&self, kind: EntityKind, id: Uuid) -> Result<Option<WorkItem>> {
        let row = sqlx::query(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = ? AND kind = ?"
        ))
        .bind(id.to_string())
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_error)?;

        match row {
            Some(row) => Ok(Some(row_to_work_item(&row)?)),
            None => Ok(None),
        }
    }

    async fn get_any(&self, id: Uuid) -> Result<Option<WorkItem>> {
        let row = sqlx::query(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(sqlx_error_to_error)?;

        match row {
            Some(row) => Ok(Some(row_to_work_item(&row)?)),
            None => Ok(None),
        }
    }

    async fn list(&self, kind: EntityKind, filter: WorkItemFilter) -> Result<Vec<WorkItem>> {
        let mut qb = build_filter_query(kind, &filter);
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_error)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(row_to_work_item(&row)?);
        }
        Ok(items)
    }

    async fn children_of(&self, parent_id: Uuid) -> Result<Vec<WorkItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {WORK_ITEM_COLUMNS} FROM work_items WHERE parent_id = ? ORDER BY created_at, id"
        ))
        .bind(parent_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_error_to_error)?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            items.push(row_to_work_item(&row)?);
        }
        Ok(items)
    }

    async fn create_batch(&self, items: Vec<WorkItem>) -> Result<()> {
        let mut tx = self.begin().await?;
        for item in &items {
            insert_item(&mut *tx, item).await?;
        }
        tx.commit().await.map_err(sqlx_error_to_error)?;
        Ok(())
    }

    async fn update(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: UpdateWorkItem,
    ) -> Result<WorkItem> {
        let mut tx = self.begin().await?;
        let item = apply_update(&mut *tx, id, expected_version, &patch).await?;
        tx.commit().await.map_err(sqlx_error_to_error)?;
        Ok(item)
    }

    async fn update_batch(
        &self,
        updates: Vec<(Uuid, i64, UpdateWorkItem)>,
    ) -> Result<Vec<WorkItem>> {
        let mut tx = self.begin().await?;
        let mut items = Vec::with_capacity(updates.len());
        for (id, expected_version, patch) in &updates {
            items.push(apply_update(&mut *tx, *id, *expected_version, patch).await?);
        }
        tx.commit().await.map_err(sqlx_error_to_error)?;
        Ok(items)
    }

    async fn delete(&self, id: Uuid, cascade: bool) -> Result<bool> {
        let mut tx = self.begin().await?;

        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM work_items WHERE id = ?)")
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await
            .map_err(sqlx_error_to_error)?;
        if !exists {
            return Ok(false);
        }

        if !cascade && has_children_tx(&mut *tx, id).await? {
            return Err(OrchestratorError::HasChildren);
        }

        let targets = if cascade {
            collect_descendants(&mut *tx, &[id]).await?
        } else {
            vec![id]
        };
        delete_items_tx(&mut *tx, &targets).await?;
        tx.commit().await.map_err(sqlx_error_to_error)?;
        Ok(true)
    }

    async fn delete_batch(&self, ids: Vec<Uuid>, cascade: bool) -> Result<u64> {
        let mut tx = self.begin().await?;

        for id in &ids {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM work_items WHERE id = ?)")
                    .bind(id.to_string())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(sqlx_error_to_error)?;
            if !exists {
                return Err(OrchestratorError::NotFound(format!(
                    "work item {id} not found"
                )));
            }
            if !cascade && has_children_tx(&mut *tx, *id).await? {
                return Err(OrchestratorError::HasChildren);
            }
        }

        let targets = if cascade {
            collect_descendants(&mut *tx, &ids).await?
        } else {
            ids
        };
        let removed = delete_items_tx(&mut *tx, &targets).await?;
        tx.commit().await.map_err(sqlx_error_to_error)?;
        Ok(removed)
    }

    async fn has_children(&self, id: Uuid) -> Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(sqlx_error_to_error)?;
        has_children_tx(&mut *conn, id).await
    }
}

#[async_trait]
impl DependencyRepository for SqliteEntityStore {
    async fn get_dependency(&self, id: Uuid) -> Result<Option<Dependency>> {
        let row = sqlx::query("SELECT * FROM dependencies WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_error_to_error)?;

        match row {
            Some(row) => Ok(Some(row_to_dependency(&row)?)),
            None => Ok(None),
        }
    }

    async fn create_dependencies(&self, deps: Vec<Dependency>) -> Result<()> {
        let mut tx = self.begin().await?;
        for dep in &deps {
            sqlx::query(
                r#"
                INSERT INTO dependencies (id, from_task_id, to_task_id, dep_type, unblock_at, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(dep.id.to_string())
            .bind(dep.from_task_id.to_string())
            .bind(dep.to_task_id.to_string())
            .bind(dep.dep_type.as_str())
            .bind(dep.unblock_at.map(|r| r.as_str()))
            .bind(dep.created_at)
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_error)?;
        }
        tx.commit().await.map_err(sqlx_error_to_error)?;
        Ok(())
    }

    async fn delete_dependency(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM dependencies WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_by_task(&self, task_id: Uuid, direction: Direction) -> Result<Vec<Dependency>> {
        let id_str = task_id.to_string();
        let sql = match direction {
            Direction::Outgoing => {
                "SELECT * FROM dependencies WHERE from_task_id = ?1 ORDER BY created_at, id"
            }
            Direction::Incoming => {
                "SELECT * FROM dependencies WHERE to_task_id = ?1 ORDER BY created_at, id"
            }
            Direction::All => {
                "SELECT * FROM dependencies WHERE from_task_id = ?1 OR to_task_id = ?1 ORDER BY created_at, id"
            }
        };
        let rows = sqlx::query(sql)
            .bind(&id_str)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_error)?;

        let mut deps = Vec::with_capacity(rows.len());
        for row in rows {
            deps.push(row_to_dependency(&row)?);
        }
        Ok(deps)
    }

    async fn all_dependencies(&self) -> Result<Vec<Dependency>> {
        let rows = sqlx::query("SELECT * FROM dependencies ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_error)?;

        let mut deps = Vec::with_capacity(rows.len());
        for row in rows {
            deps.push(row_to_dependency(&row)?);
        }
        Ok(deps)
    }

    async fn delete_for_task(&self, task_id: Uuid) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM dependencies WHERE from_task_id = ?1 OR to_task_id = ?1")
                .bind(task_id.to_string())
                .execute(&self.pool)
                .await
                .map_err(sqlx_error_to_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl SectionRepository for SqliteEntityStore {
    async fn create_sections(&self, sections: Vec<Section>) -> Result<()> {
        let mut tx = self.begin().await?;
        for section in &sections {
            sqlx::query(
                r#"
                INSERT INTO sections (id, entity_kind, entity_id, title, content, format, ordinal, tags)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(section.id.to_string())
            .bind(section.entity_kind.as_str())
            .bind(section.entity_id.to_string())
            .bind(&section.title)
            .bind(&section.content)
            .bind(section.format.as_str())
            .bind(section.ordinal)
            .bind(encode_tags(&section.tags))
            .execute(&mut *tx)
            .await
            .map_err(sqlx_error_to_error)?;
        }
        tx.commit().await.map_err(sqlx_error_to_error)?;
        Ok(())
    }

    async fn sections_for(&self, entity_id: Uuid) -> Result<Vec<Section>> {
        let rows = sqlx::query("SELECT * FROM sections WHERE entity_id = ? ORDER BY ordinal, id")
            .bind(entity_id.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_error)?;

        let mut sections = Vec::with_capacity(rows.len());
        for row in rows {
            sections.push(row_to_section(&row)?);
        }
        Ok(sections)
    }

    async fn delete_sections_for(&self, entity_id: Uuid) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sections WHERE entity_id = ?")
            .bind(entity_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_error_to_error)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl TransitionLogRepository for SqliteEntityStore {
    async fn append_role_transition(&self, record: RoleTransitionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO role_transitions
                (id, entity_id, entity_kind, from_status, to_status, from_role, to_role,
                 trigger_kind, automatic, summary, config_version, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.entity_id.to_string())
        .bind(record.entity_kind.as_str())
        .bind(&record.from_status)
        .bind(&record.to_status)
        .bind(record.from_role.as_str())
        .bind(record.to_role.as_str())
        .bind(record.trigger.as_str())
        .bind(record.automatic)
        .bind(&record.summary)
        .bind(record.config_version as i64)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_error_to_error)?;
        Ok(())
    }

    async fn list_role_transitions(
        &self,
        entity_id: Uuid,
        range: TimeRange,
    ) -> Result<Vec<RoleTransitionRecord>> {
        let mut qb: sqlx::QueryBuilder<Sqlite> =
            sqlx::QueryBuilder::new("SELECT * FROM role_transitions WHERE entity_id = ");
        qb.push_bind(entity_id.to_string());
        if let Some(from) = range.from {
            qb.push(" AND created_at >= ");
            qb.push_bind(from);
        }
        if let Some(to) = range.to {
            qb.push(" AND created_at <= ");
            qb.push_bind(to);
        }
        qb.push(" ORDER BY created_at, id");

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_error_to_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(row_to_transition(&row)?);
        }
        Ok(records)
    }

    async fn has_role_entry(&self, entity_id: Uuid, role: Role) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM role_transitions WHERE entity_id = ? AND to_role = ?)",
        )
        .bind(entity_id.to_string())
        .bind(role.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_error_to_error)?;
        Ok(exists)
    }
}
