//! 进程内租约存储
//!
//! 多个 `LockRegistry` 共享同一个 `Arc<MemoryLeaseStore>` 即可模拟多个进程争用同一张锁表。
//! 时钟基于 `tokio::time::Instant`，在 `start_paused` 的测试中随虚拟时间推进。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{LeaseStore, LockRecord};
use crate::error::{LockError, Result};

const BACKEND: &str = "memory";

/// 进程内租约存储
pub struct MemoryLeaseStore {
    region: String,
    records: Mutex<HashMap<String, LockRecord>>,
    available: AtomicBool,
    wall_base: DateTime<Utc>,
    mono_base: Instant,
}

impl MemoryLeaseStore {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            records: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            wall_base: Utc::now(),
            mono_base: Instant::now(),
        }
    }

    /// 模拟存储连通性：设为 false 后所有操作返回 `StoreUnavailable`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!(available, "Memory lease store availability changed");
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// 存储时钟，随 tokio 时钟单调推进
    pub fn now(&self) -> DateTime<Utc> {
        let elapsed =
            TimeDelta::from_std(self.mono_base.elapsed()).unwrap_or_else(|_| TimeDelta::zero());
        self.wall_base + elapsed
    }

    /// 当前保存的记录数（含已过期但未清理的）
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_available(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(LockError::store_unavailable(BACKEND, "store is unreachable"))
        }
    }
}

fn lease_delta(lease: Duration) -> Result<TimeDelta> {
    TimeDelta::from_std(lease).map_err(|e| LockError::Internal(e.to_string()))
}

impl Default for MemoryLeaseStore {
    fn default() -> Self {
        Self::new("DEFAULT")
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn health_check(&self) -> Result<()> {
        self.ensure_available()
    }

    async fn try_acquire(&self, key: &str, owner_token: &str, lease: Duration) -> Result<bool> {
        self.ensure_available()?;
        let lease = lease_delta(lease)?;
        let now = self.now();

        let mut records = self.records.lock();
        if let Some(existing) = records.get_mut(key).filter(|r| r.is_valid_at(now)) {
            if !existing.is_owned_by(owner_token) {
                return Ok(false);
            }
            existing.expires_at = now + lease;
            return Ok(true);
        }

        records.insert(
            key.to_string(),
            LockRecord {
                region: self.region.clone(),
                lock_key: key.to_string(),
                owner_token: owner_token.to_string(),
                acquired_at: now,
                expires_at: now + lease,
            },
        );
        debug!(key = %key, owner = %owner_token, "Memory lease acquired");
        Ok(true)
    }

    async fn renew(&self, key: &str, owner_token: &str, lease: Duration) -> Result<bool> {
        self.ensure_available()?;
        let lease = lease_delta(lease)?;
        let now = self.now();

        let mut records = self.records.lock();
        match records.get_mut(key) {
            Some(existing) if existing.is_valid_at(now) && existing.is_owned_by(owner_token) => {
                existing.expires_at = now + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, key: &str, owner_token: &str) -> Result<bool> {
        self.ensure_available()?;
        let now = self.now();

        let mut records = self.records.lock();
        let state = records
            .get(key)
            .map(|r| (r.is_owned_by(owner_token), r.is_valid_at(now)));
        match state {
            Some((true, _)) => {
                records.remove(key);
                Ok(true)
            }
            Some((false, true)) => Ok(false),
            _ => Ok(true),
        }
    }

    async fn current(&self, key: &str) -> Result<Option<LockRecord>> {
        self.ensure_available()?;
        let now = self.now();
        Ok(self
            .records
            .lock()
            .get(key)
            .filter(|r| r.is_valid_at(now))
            .cloned())
    }

    async fn delete_expired(&self) -> Result<u64> {
        self.ensure_available()?;
        let now = self.now();
        let mut records = self.records.lock();
        let before = records.len();
        records.retain(|_, r| r.is_valid_at(now));
        Ok((before - records.len()) as u64)
    }
}
