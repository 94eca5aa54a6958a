//! Cross-table cleanup for entities that disappeared upstream.
//!
//! Feature tables reference mirrored entities through `{key}_id` columns
//! (`user_id`, `channel_id`, `community_id`, `role_id`). Those tables are
//! owned by other modules and form a reference graph with cycles, so there
//! is no static cascade order. Instead every table is a `CleanupParticipant`
//! in a `ModelRegistry`, and the resolver purges matching rows one
//! participant at a time. Each purge is an idempotent `DELETE`, so retrying
//! or running the same request twice is safe.

use crate::config::DeclaredTable;
use crate::model::{CleanupRequest, EntityKind};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// A table whose rows may reference mirrored entities.
#[async_trait]
pub trait CleanupParticipant: Send + Sync {
    fn table(&self) -> &str;

    fn has_column(&self, column: &str) -> bool;

    /// Delete every row where `column = id`; returns the number removed.
    async fn delete_where(&self, column: &str, id: i64) -> Result<u64>;
}

/// Plain SQL identifier: ASCII letters, digits and `_`, not starting with a digit.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_mirror_table(table: &str) -> bool {
    [
        EntityKind::Community,
        EntityKind::User,
        EntityKind::Channel,
        EntityKind::Role,
    ]
    .iter()
    .any(|kind| kind.table() == table)
}

/// A SQLite table with a known column set.
pub struct SqlTable {
    pool: SqlitePool,
    table: String,
    columns: BTreeSet<String>,
    soft_deleted_only: bool,
}

impl SqlTable {
    pub fn new<I, S>(pool: SqlitePool, table: impl Into<String>, columns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = table.into();
        if !is_valid_identifier(&table) {
            return Err(anyhow!("invalid table name {table:?}"));
        }
        let columns: BTreeSet<String> = columns.into_iter().map(Into::into).collect();
        if let Some(bad) = columns.iter().find(|c| !is_valid_identifier(c)) {
            return Err(anyhow!("invalid column name {bad:?} in table {table}"));
        }
        Ok(Self {
            pool,
            table,
            columns,
            soft_deleted_only: false,
        })
    }

    /// Only purge rows that are already soft-deleted. Used for the mirror
    /// tables, whose live rows may have been revived since they were listed.
    pub fn soft_deleted_only(mut self) -> Self {
        self.soft_deleted_only = true;
        self
    }
}

impl fmt::Debug for SqlTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlTable")
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("soft_deleted_only", &self.soft_deleted_only)
            .finish()
    }
}

#[async_trait]
impl CleanupParticipant for SqlTable {
    fn table(&self) -> &str {
        &self.table
    }

    fn has_column(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    async fn delete_where(&self, column: &str, id: i64) -> Result<u64> {
        if !self.has_column(column) {
            return Ok(0);
        }
        // Both identifiers were validated in `SqlTable::new` and `column` is
        // one of them.
        let mut sql = format!("DELETE FROM \"{}\" WHERE \"{}\" = ?", self.table, column);
        if self.soft_deleted_only {
            sql.push_str(" AND deleted_at IS NOT NULL");
        }
        let res = sqlx::query(&sql)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("delete from {} where {} = {}", self.table, column, id))?;
        Ok(res.rows_affected())
    }
}

/// The set of tables one process knows about.
#[derive(Clone, Default)]
pub struct ModelRegistry {
    participants: Vec<Arc<dyn CleanupParticipant>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, participant: Arc<dyn CleanupParticipant>) -> &mut Self {
        self.participants.push(participant);
        self
    }

    pub fn with(mut self, participant: Arc<dyn CleanupParticipant>) -> Self {
        self.participants.push(participant);
        self
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn CleanupParticipant>> {
        self.participants.iter()
    }

    pub fn tables(&self) -> Vec<&str> {
        self.participants.iter().map(|p| p.table()).collect()
    }

    /// Build a registry from every user table in the live database schema.
    #[instrument(skip_all)]
    pub async fn discover(pool: &SqlitePool) -> Result<Self> {
        let tables: Vec<String> = sqlx::query_scalar(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(pool)
        .await
        .context("list tables")?;

        let mut registry = Self::new();
        for table in tables {
            if !is_valid_identifier(&table) {
                debug!(table, "skipping table with non-plain name");
                continue;
            }
            let columns: Vec<String> =
                sqlx::query_scalar("SELECT name FROM pragma_table_info(?)")
                    .bind(&table)
                    .fetch_all(pool)
                    .await
                    .with_context(|| format!("inspect columns of {table}"))?;
            let columns: Vec<String> = columns
                .into_iter()
                .filter(|c| is_valid_identifier(c))
                .collect();
            let mirror = is_mirror_table(&table);
            let mut participant = SqlTable::new(pool.clone(), table, columns)?;
            if mirror {
                participant = participant.soft_deleted_only();
            }
            registry.register(Arc::new(participant));
        }
        debug!(tables = registry.len(), "discovered schema registry");
        Ok(registry)
    }

    /// Build a registry from tables declared in configuration. The tables
    /// are not checked against the schema; a missing one fails at delete
    /// time and the request is retried next cycle.
    pub fn declared(pool: &SqlitePool, tables: &[DeclaredTable]) -> Result<Self> {
        let mut registry = Self::new();
        for t in tables {
            registry.register(Arc::new(SqlTable::new(
                pool.clone(),
                t.name.clone(),
                t.columns.iter().cloned(),
            )?));
        }
        Ok(registry)
    }
}

impl fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tables()).finish()
    }
}

/// Purges dependent rows across the primary and scheduler registries.
///
/// The two processes load their table sets independently, so both are
/// scanned. A `(table, column)` pair present in both is purged once.
#[derive(Debug, Clone, Default)]
pub struct CascadingDeletionResolver {
    primary: ModelRegistry,
    scheduler: ModelRegistry,
}

impl CascadingDeletionResolver {
    pub fn new(primary: ModelRegistry, scheduler: ModelRegistry) -> Self {
        Self { primary, scheduler }
    }

    /// Returns `true` when every matching participant was purged, including
    /// when nothing matched. Failures are logged and reported as `false`;
    /// the remaining participants are still processed.
    #[instrument(skip(self), fields(key = request.key.as_str(), id = request.id))]
    pub async fn resolve(&self, request: CleanupRequest) -> bool {
        let column = request.key.column_name();
        let mut purged: HashSet<String> = HashSet::new();
        let mut ok = true;

        for participant in self.primary.iter().chain(self.scheduler.iter()) {
            if !participant.has_column(&column) {
                continue;
            }
            if !purged.insert(participant.table().to_string()) {
                continue;
            }
            match participant.delete_where(&column, request.id).await {
                Ok(removed) => {
                    debug!(table = participant.table(), column, removed, "purged dependent rows");
                }
                Err(err) => {
                    ok = false;
                    error!(
                        ?err,
                        table = participant.table(),
                        column,
                        id = request.id,
                        "Error in deleteRecordInRelatedTable"
                    );
                }
            }
        }
        ok
    }
}
