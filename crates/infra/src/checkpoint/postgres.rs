//! Postgres-backed checkpoint store.
//!
//! One row per feed in `feed_checkpoints`:
//!
//! ```sql
//! CREATE TABLE IF NOT EXISTS feed_checkpoints (
//!     feed_name    TEXT PRIMARY KEY,
//!     resume_token TEXT NOT NULL,
//!     updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! ```
//!
//! The relay loop is synchronous, so every call blocks on the runtime handle
//! given at construction. Calls must come from a thread that is not itself
//! driving that runtime (the dispatch worker thread, or `spawn_blocking`).

use std::sync::Arc;

use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use tuyau_core::ResumeToken;

use super::{CheckpointError, CheckpointStore};

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS feed_checkpoints (
    feed_name    TEXT PRIMARY KEY,
    resume_token TEXT NOT NULL,
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

#[derive(Debug, Clone)]
pub struct PostgresCheckpointStore {
    pool: Arc<PgPool>,
    handle: Handle,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
        }
    }

    /// Create the table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), CheckpointError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

fn map_sqlx_error(err: sqlx::Error) -> CheckpointError {
    CheckpointError::Storage(err.to_string())
}

impl CheckpointStore for PostgresCheckpointStore {
    #[instrument(skip(self), err)]
    fn load(&self, feed: &str) -> Result<Option<ResumeToken>, CheckpointError> {
        let pool = self.pool.clone();

        let row = self.handle.block_on(async {
            sqlx::query(
                r#"
                SELECT resume_token
                FROM feed_checkpoints
                WHERE feed_name = $1
                "#,
            )
            .bind(feed)
            .fetch_optional(&*pool)
            .await
            .map_err(map_sqlx_error)
        })?;

        let Some(row) = row else {
            return Ok(None);
        };
        let token: String = row
            .try_get("resume_token")
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))?;

        ResumeToken::new(token)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt(e.to_string()))
    }

    #[instrument(skip(self), fields(position = %position), err)]
    fn save(&self, feed: &str, position: &ResumeToken) -> Result<(), CheckpointError> {
        let pool = self.pool.clone();

        self.handle.block_on(async {
            sqlx::query(
                r#"
                INSERT INTO feed_checkpoints (feed_name, resume_token)
                VALUES ($1, $2)
                ON CONFLICT (feed_name)
                DO UPDATE SET
                    resume_token = EXCLUDED.resume_token,
                    updated_at = NOW()
                "#,
            )
            .bind(feed)
            .bind(position.as_str())
            .execute(&*pool)
            .await
            .map_err(map_sqlx_error)
        })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    fn clear(&self, feed: &str) -> Result<(), CheckpointError> {
        let pool = self.pool.clone();

        self.handle.block_on(async {
            sqlx::query("DELETE FROM feed_checkpoints WHERE feed_name = $1")
                .bind(feed)
                .execute(&*pool)
                .await
                .map_err(map_sqlx_error)
        })?;

        Ok(())
    }
}
