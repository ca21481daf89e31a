//! PostgreSQL 连接池
//!
//! 每个连接都设置服务端 `statement_timeout`，卡住的语句由数据库主动中止，
//! 不会无限期占用租约操作。启动时的连接失败按重试策略退避重试。

use std::str::FromStr;
use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use tokio::time::Instant;
use tracing::{info, instrument};

use crate::config::DatabaseConfig;
use crate::error::{InfraError, Result};
use crate::retry::{RetryPolicy, retry_with_policy};

/// 数据库连接池包装
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// 启动阶段连接重试策略
fn connect_policy(config: &DatabaseConfig) -> RetryPolicy {
    RetryPolicy {
        max_retries: config.connect_retries,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(5),
        multiplier: 2.0,
    }
}

fn connect_options(config: &DatabaseConfig) -> Result<PgConnectOptions> {
    Ok(PgConnectOptions::from_str(&config.url)?
        .options([("statement_timeout", config.statement_timeout_ms)]))
}

impl Database {
    /// 创建连接池，瞬时失败按 `connect_retries` 重试
    #[instrument(skip(config), fields(statement_timeout_ms = config.statement_timeout_ms))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let options = &connect_options(config)?;

        let pool = retry_with_policy(
            &connect_policy(config),
            "database_connect",
            InfraError::is_retryable,
            move || async move {
                Ok(PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(config.min_connections)
                    .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
                    .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
                    .connect_with(options.clone())
                    .await?)
            },
        )
        .await?;

        info!(max_connections = config.max_connections, "Database connection pool created");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 执行 `SELECT 1`，返回往返耗时
    pub async fn health_check(&self) -> Result<Duration> {
        let started = Instant::now();
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(started.elapsed())
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection pool closed");
    }

    /// 运行迁移，创建 distributed_locks 表
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations complete");
        Ok(())
    }
}
