//! 租约存储适配层
//!
//! 对共享持久化锁表的最小抽象：原子获取（空闲或已过期时）、续期、释放。
//! 所有变更都必须是存储端的单次条件写，客户端从不"先读后写"。
//!
//! ## 实现
//!
//! - [`PostgresLeaseStore`]: `INSERT ... ON CONFLICT DO UPDATE ... WHERE`，时间以数据库 `NOW()` 为准
//! - [`RedisLeaseStore`]: Lua 脚本原子校验 owner，过期交给 Redis TTL
//! - [`MemoryLeaseStore`]: 进程内实现，用于测试和单机模拟，支持模拟存储不可用

mod memory_store;
mod postgres_store;
mod redis_store;

pub use memory_store::MemoryLeaseStore;
pub use postgres_store::PostgresLeaseStore;
pub use redis_store::RedisLeaseStore;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;

/// 锁表中的一条租约记录
///
/// 同一 `(region, lock_key)` 任意时刻至多一条有效记录，`now < expires_at` 即有效。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct LockRecord {
    pub region: String,
    pub lock_key: String,
    pub owner_token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// 在给定时刻是否仍有效
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }

    pub fn is_owned_by(&self, owner_token: &str) -> bool {
        self.owner_token == owner_token
    }
}

/// 租约存储接口
///
/// 三个变更操作在重试下都是幂等的：同一 owner 重复 `try_acquire` 返回 true 并刷新过期时间，
/// 重复 `release` 在记录已不存在时视为成功。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// 后端名称，用于日志和错误信息
    fn backend(&self) -> &'static str;

    /// 存储连通性探测
    async fn health_check(&self) -> Result<()>;

    /// 记录不存在或已过期时原子写入，`expires_at = now + lease`
    ///
    /// 返回调用方当前是否持有该租约。
    async fn try_acquire(&self, key: &str, owner_token: &str, lease: Duration) -> Result<bool>;

    /// 仅当记录属于 `owner_token` 且未过期时延长 `expires_at`
    async fn renew(&self, key: &str, owner_token: &str, lease: Duration) -> Result<bool>;

    /// 仅删除属于 `owner_token` 的记录
    ///
    /// 记录被删除或本就不存在时返回 true；有效记录属于其他 owner 时返回 false。
    async fn release(&self, key: &str, owner_token: &str) -> Result<bool>;

    /// 读取当前有效记录（只读诊断）
    async fn current(&self, key: &str) -> Result<Option<LockRecord>>;

    /// 清理已过期记录，返回清理数量
    async fn delete_expired(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(expires_in_secs: i64) -> LockRecord {
        let now = Utc::now();
        LockRecord {
            region: "DEFAULT".to_string(),
            lock_key: "res".to_string(),
            owner_token: "A".to_string(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(expires_in_secs),
        }
    }

    #[test]
    fn test_record_validity_is_strict() {
        let rec = record(2);
        assert!(rec.is_valid_at(rec.acquired_at));
        // expires_at 时刻本身已无效
        assert!(!rec.is_valid_at(rec.expires_at));
        assert!(!rec.is_valid_at(rec.expires_at + chrono::Duration::milliseconds(1)));
    }

    #[test]
    fn test_record_ownership() {
        let rec = record(2);
        assert!(rec.is_owned_by("A"));
        assert!(!rec.is_owned_by("B"));
    }
}
