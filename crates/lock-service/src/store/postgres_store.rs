//! PostgreSQL 租约存储
//!
//! 所有判定都在单条 SQL 中完成，时间统一使用数据库 `NOW()`，
//! 各实例的本地时钟偏差不影响租约有效性。

use std::time::Duration;

use async_trait::async_trait;
use distlock_shared::database::Database;
use tracing::{debug, instrument};

use super::{LeaseStore, LockRecord};
use crate::error::{LockError, Result};

/// 基于 `distributed_locks` 表的租约存储
#[derive(Clone)]
pub struct PostgresLeaseStore {
    db: Database,
    region: String,
}

impl PostgresLeaseStore {
    pub fn new(db: Database, region: impl Into<String>) -> Self {
        Self {
            db,
            region: region.into(),
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn health_check(&self) -> Result<()> {
        self.db
            .health_check()
            .await
            .map(|_| ())
            .map_err(|e| LockError::store_unavailable("postgres", e.to_string()))
    }

    /// INSERT ON CONFLICT DO UPDATE WHERE：记录不存在、已过期或属于自己时写入，
    /// 冲突行由数据库加行锁后重新判定，保证并发下只有一个 owner 胜出
    #[instrument(skip(self), fields(region = %self.region))]
    async fn try_acquire(&self, key: &str, owner_token: &str, lease: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO distributed_locks (region, lock_key, owner_token, acquired_at, expires_at)
            VALUES ($1, $2, $3, NOW(), NOW() + make_interval(secs => $4))
            ON CONFLICT (region, lock_key) DO UPDATE
            SET owner_token = EXCLUDED.owner_token,
                acquired_at = CASE
                    WHEN distributed_locks.owner_token = EXCLUDED.owner_token
                        THEN distributed_locks.acquired_at
                    ELSE EXCLUDED.acquired_at
                END,
                expires_at = EXCLUDED.expires_at
            WHERE distributed_locks.expires_at <= NOW()
               OR distributed_locks.owner_token = EXCLUDED.owner_token
            "#,
        )
        .bind(&self.region)
        .bind(key)
        .bind(owner_token)
        .bind(lease.as_secs_f64())
        .execute(self.db.pool())
        .await?;

        let acquired = result.rows_affected() > 0;
        debug!(key = %key, owner = %owner_token, acquired, "Database lease acquisition attempted");
        Ok(acquired)
    }

    #[instrument(skip(self), fields(region = %self.region))]
    async fn renew(&self, key: &str, owner_token: &str, lease: Duration) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE distributed_locks
            SET expires_at = NOW() + make_interval(secs => $4)
            WHERE region = $1 AND lock_key = $2 AND owner_token = $3 AND expires_at > NOW()
            "#,
        )
        .bind(&self.region)
        .bind(key)
        .bind(owner_token)
        .bind(lease.as_secs_f64())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// 删除自己的记录，同时在同一语句中判断是否存在他人的有效租约
    ///
    /// CTE 与主查询共享快照，`foreign` 看到的是删除前的状态。
    #[instrument(skip(self), fields(region = %self.region))]
    async fn release(&self, key: &str, owner_token: &str) -> Result<bool> {
        let (_deleted, foreign): (bool, bool) = sqlx::query_as(
            r#"
            WITH deleted AS (
                DELETE FROM distributed_locks
                WHERE region = $1 AND lock_key = $2 AND owner_token = $3
                RETURNING 1
            )
            SELECT
                EXISTS (SELECT 1 FROM deleted) AS deleted,
                EXISTS (
                    SELECT 1 FROM distributed_locks
                    WHERE region = $1 AND lock_key = $2 AND owner_token <> $3 AND expires_at > NOW()
                ) AS foreign
            "#,
        )
        .bind(&self.region)
        .bind(key)
        .bind(owner_token)
        .fetch_one(self.db.pool())
        .await?;

        Ok(!foreign)
    }

    async fn current(&self, key: &str) -> Result<Option<LockRecord>> {
        let record = sqlx::query_as::<_, LockRecord>(
            r#"
            SELECT region, lock_key, owner_token, acquired_at, expires_at
            FROM distributed_locks
            WHERE region = $1 AND lock_key = $2 AND expires_at > NOW()
            "#,
        )
        .bind(&self.region)
        .bind(key)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(record)
    }

    async fn delete_expired(&self) -> Result<u64> {
        let result =
            sqlx::query(r#"DELETE FROM distributed_locks WHERE region = $1 AND expires_at <= NOW()"#)
                .bind(&self.region)
                .execute(self.db.pool())
                .await?;

        if result.rows_affected() > 0 {
            debug!(
                region = %self.region,
                deleted = result.rows_affected(),
                "Cleaned up expired database leases"
            );
        }
        Ok(result.rows_affected())
    }
}
