use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::{LockError, LockProvider, LockToken, Result};

/// PostgreSQL-backed lock provider.
///
/// Each held key is a row in `workflow_locks`. Acquisition is a single
/// upsert that only overwrites a row whose `expires_at` has passed, so the
/// database arbitrates between competing processes.
#[derive(Clone)]
pub struct PostgresLockProvider {
    pool: PgPool,
}

impl PostgresLockProvider {
    /// Creates a new PostgreSQL lock provider.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Removes rows whose expiry has passed. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM workflow_locks WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn ttl_millis(ttl: Duration) -> Result<i64> {
        i64::try_from(ttl.as_millis())
            .map_err(|_| LockError::Backend(format!("lock ttl too large: {ttl:?}")))
    }
}

#[async_trait]
impl LockProvider for PostgresLockProvider {
    #[tracing::instrument(skip(self))]
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>> {
        let token = LockToken::generate();

        let acquired: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO workflow_locks (lock_key, token, acquired_at, expires_at)
            VALUES ($1, $2, now(), now() + $3 * interval '1 millisecond')
            ON CONFLICT (lock_key) DO UPDATE
                SET token = EXCLUDED.token,
                    acquired_at = EXCLUDED.acquired_at,
                    expires_at = EXCLUDED.expires_at
                WHERE workflow_locks.expires_at <= now()
            RETURNING token
            "#,
        )
        .bind(key)
        .bind(token.as_str())
        .bind(Self::ttl_millis(ttl)?)
        .fetch_optional(&self.pool)
        .await?;

        match acquired {
            Some(value) if value == token.as_str() => Ok(Some(token)),
            _ => Ok(None),
        }
    }

    #[tracing::instrument(skip(self, token))]
    async fn release(&self, key: &str, token: &LockToken) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflow_locks WHERE lock_key = $1 AND token = $2")
            .bind(key)
            .bind(token.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, token))]
    async fn renew(&self, key: &str, token: &LockToken, ttl: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_locks
            SET expires_at = now() + $3 * interval '1 millisecond'
            WHERE lock_key = $1 AND token = $2 AND expires_at > now()
            "#,
        )
        .bind(key)
        .bind(token.as_str())
        .bind(Self::ttl_millis(ttl)?)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
