//! Typed repository for one mirrored entity kind.
//!
//! Every ordinary read and write is paranoid: rows with `deleted_at` set are
//! invisible. The cleanup worklist query, `update_batch_status`, `mark_done`
//! and the `*_with_deleted` lookups are the only statements that see deleted
//! rows.

use crate::error::{RepoError, RepoResult};
use crate::model::{
    BatchStatus, CategoryType, Channel, ChannelType, ClientId, Community, EntityKind, NewEntity,
    Role, User,
};
use chrono::Utc;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{query::Query, FromRow, Row, Sqlite, SqlitePool};
use std::fmt;
use std::marker::PhantomData;
use tracing::{debug, instrument};

/// A row type stored in one of the mirror tables.
pub trait Mirrored: for<'r> FromRow<'r, SqliteRow> + Send + Unpin + 'static {
    const KIND: EntityKind;
}

/// Kinds whose rows belong to a community (everything except Community).
pub trait Scoped: Mirrored {}

impl Mirrored for Community {
    const KIND: EntityKind = EntityKind::Community;
}
impl Mirrored for User {
    const KIND: EntityKind = EntityKind::User;
}
impl Mirrored for Channel {
    const KIND: EntityKind = EntityKind::Channel;
}
impl Mirrored for Role {
    const KIND: EntityKind = EntityKind::Role;
}
impl Scoped for User {}
impl Scoped for Channel {}
impl Scoped for Role {}

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

pub struct EntityRepository<T> {
    pool: SqlitePool,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for EntityRepository<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Mirrored> fmt::Debug for EntityRepository<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityRepository")
            .field("table", &T::KIND.table())
            .finish_non_exhaustive()
    }
}

fn json_ids(ids: &[ClientId]) -> RepoResult<String> {
    serde_json::to_string(ids).map_err(|err| RepoError::Invalid(err.to_string()))
}

impl<T: Mirrored> EntityRepository<T> {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            _entity: PhantomData,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn table() -> &'static str {
        T::KIND.table()
    }

    fn insert_sql(upsert: bool) -> String {
        let kind = T::KIND;
        let table = kind.table();
        let mut columns = vec!["category_type", "client_id"];
        if kind.is_community_scoped() {
            columns.push("community_id");
        }
        if kind == EntityKind::Channel {
            columns.push("channel_type");
        }
        columns.extend(["batch_status", "created_at", "updated_at"]);
        let placeholders = vec!["?"; columns.len()].join(", ");
        let mut sql = format!(
            "INSERT INTO {table} ({}) VALUES ({placeholders})",
            columns.join(", ")
        );
        if upsert {
            let target = if kind.is_community_scoped() {
                "category_type, client_id, community_id"
            } else {
                "category_type, client_id"
            };
            let channel_update = if kind == EntityKind::Channel {
                ", channel_type = excluded.channel_type"
            } else {
                ""
            };
            sql.push_str(&format!(
                " ON CONFLICT({target}) DO UPDATE SET deleted_at = NULL, \
                 batch_status = excluded.batch_status, updated_at = excluded.updated_at{channel_update} \
                 WHERE {table}.deleted_at IS NOT NULL"
            ));
        }
        sql
    }

    fn bind_new<'q>(query: SqliteQuery<'q>, dto: &NewEntity) -> RepoResult<SqliteQuery<'q>> {
        let kind = T::KIND;
        let now = Utc::now();
        let mut query = query.bind(dto.category_type).bind(dto.client_id);
        if kind.is_community_scoped() {
            let community_id = dto.community_id.ok_or_else(|| {
                RepoError::Invalid(format!(
                    "{} row for client {} requires a community_id",
                    kind.table(),
                    dto.client_id
                ))
            })?;
            query = query.bind(community_id);
        }
        if kind == EntityKind::Channel {
            query = query.bind(dto.channel_type.unwrap_or(ChannelType::Other));
        }
        Ok(query.bind(BatchStatus::Yet).bind(now).bind(now))
    }

    /// Insert one row with `batch_status = Yet`. Fails with
    /// `ConstraintViolation` when the key already exists, deleted or not.
    #[instrument(skip_all, fields(table = T::KIND.table(), client_id = dto.client_id))]
    pub async fn create(&self, dto: &NewEntity) -> RepoResult<i64> {
        let sql = format!("{} RETURNING id", Self::insert_sql(false));
        let row = Self::bind_new(sqlx::query(&sql), dto)?
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("id"))
    }

    /// Insert all rows in one transaction; a duplicate anywhere rolls back
    /// the whole batch.
    #[instrument(skip_all, fields(table = T::KIND.table(), count = dtos.len()))]
    pub async fn bulk_create(&self, dtos: &[NewEntity]) -> RepoResult<u64> {
        if dtos.is_empty() {
            return Ok(0);
        }
        let sql = Self::insert_sql(false);
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;
        for dto in dtos {
            inserted += Self::bind_new(sqlx::query(&sql), dto)?
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }

    /// Insert missing rows and revive soft-deleted ones. Live rows are left
    /// untouched, so repeating the call writes nothing.
    #[instrument(skip_all, fields(table = T::KIND.table(), count = dtos.len()))]
    pub async fn bulk_upsert(&self, dtos: &[NewEntity]) -> RepoResult<u64> {
        if dtos.is_empty() {
            return Ok(0);
        }
        let sql = Self::insert_sql(true);
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for dto in dtos {
            written += Self::bind_new(sqlx::query(&sql), dto)?
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(written)
    }

    pub async fn find_by_id_with_deleted(&self, id: i64) -> RepoResult<Option<T>> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", Self::table());
        let row = sqlx::query_as::<_, T>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// The cleanup worklist: soft-deleted rows whose dependents have not
    /// been purged yet.
    #[instrument(skip_all, fields(table = T::KIND.table()))]
    pub async fn find_deletion_targets_by_batch_status_and_deleted_at(&self) -> RepoResult<Vec<T>> {
        let sql = format!(
            "SELECT * FROM {} WHERE batch_status = ? AND deleted_at IS NOT NULL ORDER BY id",
            Self::table()
        );
        let rows = sqlx::query_as::<_, T>(&sql)
            .bind(BatchStatus::Yet)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Requeue a row (`batch_status = Yet`) whether or not it is deleted.
    #[instrument(skip(self), fields(table = T::KIND.table()))]
    pub async fn update_batch_status(&self, id: i64) -> RepoResult<u64> {
        let sql = format!(
            "UPDATE {} SET batch_status = ?, updated_at = ? WHERE id = ?",
            Self::table()
        );
        let res = sqlx::query(&sql)
            .bind(BatchStatus::Yet)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// `Yet -> Done` after a verified cleanup. A row revived in the meantime
    /// stays `Yet`.
    #[instrument(skip(self), fields(table = T::KIND.table()))]
    pub async fn mark_done(&self, id: i64) -> RepoResult<u64> {
        let sql = format!(
            "UPDATE {} SET batch_status = ?, updated_at = ? \
             WHERE id = ? AND batch_status = ? AND deleted_at IS NOT NULL",
            Self::table()
        );
        let res = sqlx::query(&sql)
            .bind(BatchStatus::Done)
            .bind(Utc::now())
            .bind(id)
            .bind(BatchStatus::Yet)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

impl EntityRepository<Community> {
    pub async fn find_by_client_id(
        &self,
        category_type: CategoryType,
        client_id: ClientId,
    ) -> RepoResult<Option<Community>> {
        let row = sqlx::query_as::<_, Community>(
            "SELECT * FROM communities WHERE category_type = ? AND client_id = ? AND deleted_at IS NULL",
        )
        .bind(category_type)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_active(&self, category_type: CategoryType) -> RepoResult<Vec<Community>> {
        let rows = sqlx::query_as::<_, Community>(
            "SELECT * FROM communities WHERE category_type = ? AND deleted_at IS NULL ORDER BY id",
        )
        .bind(category_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Communities of `category_type` whose `client_id` is not in `known`.
    #[instrument(skip_all, fields(known = known.len()))]
    pub async fn get_not_exist_client_id(
        &self,
        category_type: CategoryType,
        known: &[ClientId],
    ) -> RepoResult<Vec<Community>> {
        let rows = sqlx::query_as::<_, Community>(
            "SELECT * FROM communities WHERE category_type = ? AND deleted_at IS NULL \
             AND client_id NOT IN (SELECT value FROM json_each(?)) ORDER BY id",
        )
        .bind(category_type)
        .bind(json_ids(known)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    #[instrument(skip(self))]
    pub async fn delete_by_id(&self, id: i64) -> RepoResult<u64> {
        let now = Utc::now();
        let res = sqlx::query(
            "UPDATE communities SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    /// Revive a soft-deleted community; returns its id if one was revived.
    #[instrument(skip(self))]
    pub async fn restore_by_client_id(
        &self,
        category_type: CategoryType,
        client_id: ClientId,
    ) -> RepoResult<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(
            "UPDATE communities SET deleted_at = NULL, batch_status = ?, updated_at = ? \
             WHERE category_type = ? AND client_id = ? AND deleted_at IS NOT NULL RETURNING id",
        )
        .bind(BatchStatus::Yet)
        .bind(Utc::now())
        .bind(category_type)
        .bind(client_id)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(id) = id {
            debug!(id, client_id, "restored community");
        }
        Ok(id)
    }
}

impl<T: Scoped> EntityRepository<T> {
    pub async fn find_by_community_id_and_client_id(
        &self,
        community_id: i64,
        client_id: ClientId,
    ) -> RepoResult<Option<T>> {
        let sql = format!(
            "SELECT * FROM {} WHERE community_id = ? AND client_id = ? AND deleted_at IS NULL",
            Self::table()
        );
        let row = sqlx::query_as::<_, T>(&sql)
            .bind(community_id)
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn list_by_community_id(&self, community_id: i64) -> RepoResult<Vec<T>> {
        let sql = format!(
            "SELECT * FROM {} WHERE community_id = ? AND deleted_at IS NULL ORDER BY id",
            Self::table()
        );
        let rows = sqlx::query_as::<_, T>(&sql)
            .bind(community_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Soft-delete one row; absent or already-deleted rows are a no-op.
    #[instrument(skip(self), fields(table = T::KIND.table()))]
    pub async fn delete_by_community_id_and_client_id(
        &self,
        community_id: i64,
        client_id: ClientId,
    ) -> RepoResult<u64> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE {} SET deleted_at = ?, updated_at = ? \
             WHERE community_id = ? AND client_id = ? AND deleted_at IS NULL",
            Self::table()
        );
        let res = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(community_id)
            .bind(client_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Soft-delete every live row of `community_id` whose `client_id` is not
    /// in `keep_client_ids`. An empty keep list deletes the whole community,
    /// so callers must not pass the result of a failed fetch.
    #[instrument(skip(self, keep_client_ids), fields(table = T::KIND.table(), keep = keep_client_ids.len()))]
    pub async fn delete_not_belong_by_community_id_and_client_ids(
        &self,
        community_id: i64,
        keep_client_ids: &[ClientId],
    ) -> RepoResult<u64> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE {} SET deleted_at = ?, updated_at = ? \
             WHERE community_id = ? AND deleted_at IS NULL \
             AND client_id NOT IN (SELECT value FROM json_each(?))",
            Self::table()
        );
        let res = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(community_id)
            .bind(json_ids(keep_client_ids)?)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    #[instrument(skip(self), fields(table = T::KIND.table()))]
    pub async fn delete_by_community_id(&self, community_id: i64) -> RepoResult<u64> {
        let now = Utc::now();
        let sql = format!(
            "UPDATE {} SET deleted_at = ?, updated_at = ? WHERE community_id = ? AND deleted_at IS NULL",
            Self::table()
        );
        let res = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(community_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Revive a soft-deleted row when the platform object reappears.
    #[instrument(skip(self), fields(table = T::KIND.table()))]
    pub async fn restore_by_community_id_and_client_id(
        &self,
        community_id: i64,
        client_id: ClientId,
    ) -> RepoResult<u64> {
        let sql = format!(
            "UPDATE {} SET deleted_at = NULL, batch_status = ?, updated_at = ? \
             WHERE community_id = ? AND client_id = ? AND deleted_at IS NOT NULL",
            Self::table()
        );
        let res = sqlx::query(&sql)
            .bind(BatchStatus::Yet)
            .bind(Utc::now())
            .bind(community_id)
            .bind(client_id)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    /// Rows of `community_id` still waiting for their own cleanup.
    pub async fn count_pending_in_community(&self, community_id: i64) -> RepoResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE community_id = ? AND batch_status = ? AND deleted_at IS NOT NULL",
            Self::table()
        );
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .bind(community_id)
            .bind(BatchStatus::Yet)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn community_insert_has_no_scope_column() {
        let sql = EntityRepository::<Community>::insert_sql(false);
        assert_eq!(
            sql,
            "INSERT INTO communities (category_type, client_id, batch_status, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?)"
        );
    }

    #[test]
    fn channel_upsert_targets_scoped_key() {
        let sql = EntityRepository::<Channel>::insert_sql(true);
        assert!(sql.contains("channel_type"));
        assert!(sql.contains("ON CONFLICT(category_type, client_id, community_id)"));
        assert!(sql.ends_with("WHERE channels.deleted_at IS NOT NULL"));
    }
}
