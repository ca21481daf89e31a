//! 锁注册表
//!
//! 进程内锁的工厂与本地状态缓存。同一进程内对同一 key 的所有句柄共享一个本地闸门，
//! 句柄必须先拿到闸门才会访问存储，因此一个进程内至多一个句柄认为自己持有某个 key。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::config::LockConfig;
use super::handle::LockHandle;
use crate::error::Result;
use crate::store::LeaseStore;

/// 单个 key 的本地状态
pub(crate) struct KeyState {
    pub(crate) gate: Arc<tokio::sync::Mutex<()>>,
    last_used: Mutex<Instant>,
}

impl KeyState {
    fn new() -> Self {
        Self {
            gate: Arc::new(tokio::sync::Mutex::new(())),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub(crate) fn touch(&self) {
        *self.last_used.lock() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

/// 分布式锁注册表
///
/// 注册表自身从不访问存储，获取与释放都由 [`LockHandle`] 完成。
pub struct LockRegistry {
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    /// 实例唯一标识，作为 owner token 前缀区分不同进程
    instance_id: Arc<str>,
    locks: DashMap<String, Arc<KeyState>>,
}

impl LockRegistry {
    pub fn new(store: Arc<dyn LeaseStore>, config: LockConfig) -> Result<Self> {
        config.validate()?;
        let instance_id: Arc<str> = Arc::from(Uuid::new_v4().to_string());
        info!(instance_id = %instance_id, "Lock registry created");

        Ok(Self {
            store,
            config,
            instance_id,
            locks: DashMap::new(),
        })
    }

    /// 获取 key 对应的锁句柄
    ///
    /// 每次调用返回新的句柄实例，它们共享同一个本地闸门。
    pub fn obtain(&self, key: &str) -> LockHandle {
        let state = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyState::new()))
            .clone();
        state.touch();

        LockHandle::new(
            key.to_string(),
            self.store.clone(),
            self.config.clone(),
            self.instance_id.clone(),
            state,
        )
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn LeaseStore> {
        &self.store
    }

    /// 本地缓存的 key 数量
    pub fn cached_keys(&self) -> usize {
        self.locks.len()
    }

    /// 清理超过 `age` 未使用且没有句柄引用的本地状态
    pub fn expire_unused_older_than(&self, age: Duration) -> usize {
        let before = self.locks.len();
        self.locks
            .retain(|_, state| Arc::strong_count(state) > 1 || state.idle_for() < age);
        let evicted = before.saturating_sub(self.locks.len());
        if evicted > 0 {
            debug!(evicted, "Evicted unused local lock state");
        }
        evicted
    }

    /// 在锁保护下执行 `work`
    ///
    /// 无论 `work` 的结果如何都会释放锁；未能在 `timeout` 内获取时返回
    /// `AcquisitionTimeout`，`work` 不会执行。
    #[instrument(skip(self, work), fields(instance_id = %self.instance_id))]
    pub async fn execute_locked<F, Fut, T>(&self, key: &str, timeout: Duration, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut handle = self.obtain(key);
        handle.lock(timeout).await?;

        let output = work().await;

        if let Err(e) = handle.unlock().await {
            warn!(key = %key, error = %e, "Failed to release lock after critical section");
        }
        Ok(output)
    }

    /// 启动后台清理任务：定期删除存储中的过期记录并回收本地空闲状态
    pub fn spawn_housekeeping(
        self: &Arc<Self>,
        interval: Duration,
        idle: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);

        tokio::spawn(async move {
            info!(interval_ms = interval.as_millis() as u64, "Lock housekeeping started");
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("Shutdown signal received, lock housekeeping stopped");
                            break;
                        }
                    }

                    _ = tokio::time::sleep(interval) => {
                        match registry.store.delete_expired().await {
                            Ok(deleted) if deleted > 0 => {
                                debug!(deleted, "Expired leases purged");
                            }
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Failed to purge expired leases"),
                        }
                        registry.expire_unused_older_than(idle);
                    }
                }
            }
        })
    }
}
