//! Job status records.
//!
//! Records are created by the upload API; this worker only ever flips one
//! to `done`. The update is conditional, never an insert: a missing record
//! is a successful no-op, so a redelivered notification cannot resurrect a
//! job that was deleted in the meantime.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

/// Identity under which a job record is looked up
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobKey {
    Id(String),
    Url(String),
}

impl std::fmt::Display for JobKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKey::Id(id) => write!(f, "id={id}"),
            JobKey::Url(url) => write!(f, "url={url}"),
        }
    }
}

#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Mark the matching job record done. Returns the number of records
    /// matched; zero is not an error.
    async fn mark_done(
        &self,
        key: &JobKey,
        thumb_url: &str,
        thumb2x_url: Option<&str>,
    ) -> Result<u64>;
}

/// Postgres-backed status store over the `jobs` table
/// (`id`, `url`, `status`, `thumb_url`, `thumb2x_url`, `finished_at`).
pub struct PgStatusStore {
    pool: PgPool,
}

impl PgStatusStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StatusStore for PgStatusStore {
    async fn mark_done(
        &self,
        key: &JobKey,
        thumb_url: &str,
        thumb2x_url: Option<&str>,
    ) -> Result<u64> {
        let (query, value) = match key {
            JobKey::Id(id) => (
                r#"
                UPDATE jobs
                SET status = 'done',
                    thumb_url = $2,
                    thumb2x_url = $3,
                    finished_at = $4
                WHERE id = $1
                "#,
                id,
            ),
            JobKey::Url(url) => (
                r#"
                UPDATE jobs
                SET status = 'done',
                    thumb_url = $2,
                    thumb2x_url = $3,
                    finished_at = $4
                WHERE url = $1
                "#,
                url,
            ),
        };

        let result = sqlx::query(query)
            .bind(value)
            .bind(thumb_url)
            .bind(thumb2x_url)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;

        let rows = result.rows_affected();
        if rows == 0 {
            debug!(key = %key, "No job record matched, nothing to update");
        } else {
            debug!(key = %key, "Job record marked done");
        }

        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_key_display_names_the_lookup_field() {
        assert_eq!(JobKey::Id("job1".to_string()).to_string(), "id=job1");
        assert_eq!(
            JobKey::Url("https://example.test/cat.png".to_string()).to_string(),
            "url=https://example.test/cat.png"
        );
    }
}
