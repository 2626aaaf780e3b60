//! Cache-state rows keyed on `(tag, path)`.
//!
//! The primary key serves the by-tag query; a secondary index on
//! `(path, revalidated_at DESC)` serves the freshest-state-for-path query.
//! The two are maintained independently and only converge eventually, which
//! the contract allows.

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{CacheStateRepo, RepoError};
use crate::domain::entry::CacheEntry;

use super::{PostgresRepositories, map_sqlx_error};

#[derive(sqlx::FromRow)]
struct CacheStateRow {
    tag: String,
    path: String,
    revalidated_at: OffsetDateTime,
    expire_at: OffsetDateTime,
}

impl TryFrom<CacheStateRow> for CacheEntry {
    type Error = RepoError;

    fn try_from(row: CacheStateRow) -> Result<Self, Self::Error> {
        CacheEntry::new(row.path, row.tag, row.revalidated_at, row.expire_at)
            .map_err(RepoError::from_persistence)
    }
}

#[async_trait]
impl CacheStateRepo for PostgresRepositories {
    async fn upsert(&self, entry: CacheEntry) -> Result<(), RepoError> {
        sqlx::query(
            r#"
            INSERT INTO cache_state (tag, path, revalidated_at, expire_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tag, path) DO UPDATE
               SET revalidated_at = EXCLUDED.revalidated_at,
                   expire_at = EXCLUDED.expire_at
            "#,
        )
        .bind(&entry.tag)
        .bind(&entry.path)
        .bind(entry.revalidated_at)
        .bind(entry.expire_at)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn query_by_tag(&self, tag: &str) -> Result<Vec<CacheEntry>, RepoError> {
        let rows = sqlx::query_as::<_, CacheStateRow>(
            r#"
            SELECT tag, path, revalidated_at, expire_at
              FROM cache_state
             WHERE tag = $1
               AND expire_at > now()
            "#,
        )
        .bind(tag)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(CacheEntry::try_from).collect()
    }

    async fn query_by_path(&self, path: &str) -> Result<Vec<CacheEntry>, RepoError> {
        let rows = sqlx::query_as::<_, CacheStateRow>(
            r#"
            SELECT tag, path, revalidated_at, expire_at
              FROM cache_state
             WHERE path = $1
               AND expire_at > now()
             ORDER BY revalidated_at DESC
            "#,
        )
        .bind(path)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(CacheEntry::try_from).collect()
    }
}
