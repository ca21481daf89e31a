//! Redis 租约存储
//!
//! 每个锁对应一个 hash：`lock:{region}:{key}` → `{owner, acquired_at}`，
//! 过期交给 `PEXPIRE`。所有 owner 校验都在 Lua 脚本中原子完成。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use distlock_shared::config::RedisConfig;
use redis::{Client as RedisClient, Script};
use tracing::{debug, instrument};

use super::{LeaseStore, LockRecord};
use crate::error::{LockError, Result};

const BACKEND: &str = "redis";

// 记录不存在时写入；属于自己时刷新 TTL；其余返回 0
const ACQUIRE_SCRIPT: &str = r#"
local owner = redis.call('HGET', KEYS[1], 'owner')
if not owner then
    local t = redis.call('TIME')
    local now = t[1] * 1000 + math.floor(t[2] / 1000)
    redis.call('HSET', KEYS[1], 'owner', ARGV[1], 'acquired_at', now)
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
elseif owner == ARGV[1] then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
    return 1
end
return 0
"#;

const RENEW_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'owner') == ARGV[1] then
    return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

// 不存在视为已释放
const RELEASE_SCRIPT: &str = r#"
local owner = redis.call('HGET', KEYS[1], 'owner')
if not owner then
    return 1
elseif owner == ARGV[1] then
    redis.call('DEL', KEYS[1])
    return 1
end
return 0
"#;

const CURRENT_SCRIPT: &str = r#"
local fields = redis.call('HMGET', KEYS[1], 'owner', 'acquired_at')
if not fields[1] then
    return nil
end
local ttl = redis.call('PTTL', KEYS[1])
local t = redis.call('TIME')
local now = t[1] * 1000 + math.floor(t[2] / 1000)
return {fields[1], tonumber(fields[2]), ttl, now}
"#;

/// 基于 Redis 的租约存储
#[derive(Clone)]
pub struct RedisLeaseStore {
    client: RedisClient,
    region: String,
    acquire: Script,
    renew: Script,
    release: Script,
    current: Script,
}

impl RedisLeaseStore {
    pub fn new(client: RedisClient, region: impl Into<String>) -> Self {
        Self {
            client,
            region: region.into(),
            acquire: Script::new(ACQUIRE_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
            current: Script::new(CURRENT_SCRIPT),
        }
    }

    /// 根据配置创建存储，并验证连通性
    pub async fn connect(config: &RedisConfig, region: impl Into<String>) -> Result<Self> {
        let store = Self::new(RedisClient::open(config.url.as_str())?, region);
        store.ping().await?;
        Ok(store)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn redis_key(&self, key: &str) -> String {
        format!("lock:{}:{}", self.region, key)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn lease_millis(lease: Duration) -> u64 {
    // PEXPIRE 0 会立即删除 key
    (lease.as_millis() as u64).max(1)
}

fn timestamp(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| LockError::Internal(format!("invalid timestamp from redis: {}", ms)))
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn health_check(&self) -> Result<()> {
        self.ping().await
    }

    #[instrument(skip(self), fields(region = %self.region))]
    async fn try_acquire(&self, key: &str, owner_token: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let acquired: i32 = self
            .acquire
            .key(self.redis_key(key))
            .arg(owner_token)
            .arg(lease_millis(lease))
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %key, owner = %owner_token, acquired = acquired == 1, "Redis lease acquisition attempted");
        Ok(acquired == 1)
    }

    #[instrument(skip(self), fields(region = %self.region))]
    async fn renew(&self, key: &str, owner_token: &str, lease: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let renewed: i32 = self
            .renew
            .key(self.redis_key(key))
            .arg(owner_token)
            .arg(lease_millis(lease))
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    #[instrument(skip(self), fields(region = %self.region))]
    async fn release(&self, key: &str, owner_token: &str) -> Result<bool> {
        let mut conn = self.connection().await?;
        let released: i32 = self
            .release
            .key(self.redis_key(key))
            .arg(owner_token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn current(&self, key: &str) -> Result<Option<LockRecord>> {
        let mut conn = self.connection().await?;
        let row: Option<(String, i64, i64, i64)> = self
            .current
            .key(self.redis_key(key))
            .invoke_async(&mut conn)
            .await?;

        let Some((owner_token, acquired_ms, ttl_ms, now_ms)) = row else {
            return Ok(None);
        };
        // PTTL < 0 表示没有过期时间，不应出现；按已失效处理
        if ttl_ms <= 0 {
            return Ok(None);
        }

        Ok(Some(LockRecord {
            region: self.region.clone(),
            lock_key: key.to_string(),
            owner_token,
            acquired_at: timestamp(acquired_ms)?,
            expires_at: timestamp(now_ms)? + TimeDelta::milliseconds(ttl_ms),
        }))
    }

    /// 过期由 Redis TTL 处理
    async fn delete_expired(&self) -> Result<u64> {
        Ok(0)
    }
}
