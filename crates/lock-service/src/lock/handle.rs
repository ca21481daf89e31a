//! 锁句柄
//!
//! 调用方获取和释放锁的单元。获取流程：先拿本进程内该 key 的闸门，
//! 再按 `poll_interval` 轮询存储的 `try_acquire`，直到成功或超时。
//!
//! ## 注意事项
//!
//! 临界区执行时间超过租约时长时，租约可能过期并被其他进程接管。
//! 长时间的临界区需要显式调用 [`LockHandle::renew`]。

use std::sync::Arc;
use std::time::Duration;

use distlock_shared::observability::metrics::{
    record_lock_acquisition, record_lock_release, record_lock_renewal,
};
use distlock_shared::retry::retry_with_policy;
use tokio::runtime::Handle;
use tokio::sync::{OwnedMutexGuard, watch};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::config::LockConfig;
use super::registry::KeyState;
use crate::error::{LockError, Result};
use crate::store::LeaseStore;

/// 当前持有的租约
struct HeldLease {
    owner_token: String,
    /// 本地估计的租约截止时间，以发起请求的时刻为起点，偏保守
    deadline: Instant,
    _gate: OwnedMutexGuard<()>,
}

/// 锁句柄
///
/// 由 [`LockRegistry::obtain`](super::LockRegistry::obtain) 创建，归调用方独占。
/// 不可重入：已持有时再次 `try_lock` 等同于续期。
pub struct LockHandle {
    key: String,
    store: Arc<dyn LeaseStore>,
    config: LockConfig,
    instance_id: Arc<str>,
    state: Arc<KeyState>,
    held: Option<HeldLease>,
}

/// 等待取消信号；未提供接收端或发送端已关闭时永不返回
async fn cancelled(cancel: Option<&mut watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => {
            let closed = rx.wait_for(|c| *c).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending::<()>().await,
    }
}

impl LockHandle {
    pub(crate) fn new(
        key: String,
        store: Arc<dyn LeaseStore>,
        config: LockConfig,
        instance_id: Arc<str>,
        state: Arc<KeyState>,
    ) -> Self {
        Self {
            key,
            store,
            config,
            instance_id,
            state,
            held: None,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// 是否持有锁（本地租约截止时间之前）
    pub fn is_held(&self) -> bool {
        self.held
            .as_ref()
            .is_some_and(|held| Instant::now() < held.deadline)
    }

    pub fn owner_token(&self) -> Option<&str> {
        self.held.as_ref().map(|held| held.owner_token.as_str())
    }

    /// 本地估计的剩余租约时长
    pub fn lease_remaining(&self) -> Option<Duration> {
        self.held
            .as_ref()
            .map(|held| held.deadline.saturating_duration_since(Instant::now()))
    }

    /// 在 `timeout` 内尝试获取锁
    ///
    /// 超时返回 `Ok(false)` 而不是错误。存储不可达时在窗口内持续重试，
    /// 截止时最后一次尝试仍因存储不可达失败则返回 `StoreUnavailable`。
    /// 单次存储请求同样受 `timeout` 约束，未应答的请求按存储不可达处理。
    /// `timeout` 为零时只尝试一次，该次请求以租约时长为上限。
    pub async fn try_lock(&mut self, timeout: Duration) -> Result<bool> {
        self.acquire(timeout, None).await
    }

    /// 与 [`try_lock`](Self::try_lock) 相同，`cancel` 变为 true 时立即返回 `Ok(false)`
    pub async fn try_lock_cancellable(
        &mut self,
        timeout: Duration,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<bool> {
        self.acquire(timeout, Some(cancel)).await
    }

    /// 获取锁，超时返回 `AcquisitionTimeout`
    pub async fn lock(&mut self, timeout: Duration) -> Result<()> {
        if self.try_lock(timeout).await? {
            Ok(())
        } else {
            Err(LockError::AcquisitionTimeout {
                key: self.key.clone(),
                timeout,
            })
        }
    }

    #[instrument(skip(self, cancel), fields(key = %self.key))]
    async fn acquire(
        &mut self,
        timeout: Duration,
        mut cancel: Option<&mut watch::Receiver<bool>>,
    ) -> Result<bool> {
        if self.held.is_some() {
            match self.renew().await {
                Ok(()) => return Ok(true),
                // 租约已丢失，按全新获取处理
                Err(LockError::OwnershipMismatch { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let started = Instant::now();
        let deadline = started + timeout;
        self.state.touch();

        let gate = tokio::select! {
            biased;

            _ = cancelled(cancel.as_deref_mut()) => {
                record_lock_acquisition("cancelled", started.elapsed().as_secs_f64());
                return Ok(false);
            }

            guard = tokio::time::timeout_at(deadline, self.state.gate.clone().lock_owned()) => {
                match guard {
                    Ok(guard) => guard,
                    Err(_) => {
                        debug!("Local lock gate is busy, acquisition timed out");
                        record_lock_acquisition("timeout", started.elapsed().as_secs_f64());
                        return Ok(false);
                    }
                }
            }
        };

        let mut owner_token = self.new_owner_token();
        let lease = self.config.lease_duration;
        let mut last_error: Option<LockError> = None;
        let mut answered = false;
        let mut attempt: u32 = 0;

        loop {
            let attempt_started = Instant::now();
            let lease_deadline = attempt_started + lease;
            let attempt_deadline = if timeout.is_zero() {
                lease_deadline
            } else {
                deadline.min(lease_deadline)
            };

            let outcome = tokio::time::timeout_at(
                attempt_deadline,
                self.store.try_acquire(&self.key, &owner_token, lease),
            )
            .await;
            answered |= outcome.is_ok();

            match outcome {
                Ok(Ok(true)) if Instant::now() < lease_deadline => {
                    debug!(owner = %owner_token, attempt, "Lock acquired");
                    record_lock_acquisition("acquired", started.elapsed().as_secs_f64());
                    self.held = Some(HeldLease {
                        owner_token,
                        deadline: lease_deadline,
                        _gate: gate,
                    });
                    return Ok(true);
                }
                Ok(Ok(true)) => {
                    // 应答晚于本地租约截止时间，这次获取不可用
                    warn!(owner = %owner_token, attempt, "Lease granted after it had already lapsed locally");
                    self.discard_attempt(&mut owner_token);
                    last_error = None;
                }
                Ok(Ok(false)) => last_error = None,
                Ok(Err(e)) if e.is_retryable() => {
                    debug!(error = %e, attempt, "Lease store unavailable, retrying acquisition");
                    last_error = Some(e);
                }
                Ok(Err(e)) => {
                    record_lock_acquisition("error", started.elapsed().as_secs_f64());
                    return Err(e);
                }
                Err(_) => {
                    debug!(attempt, "Lease store did not answer before the attempt deadline");
                    self.discard_attempt(&mut owner_token);
                    // 之前有过应答时沿用上一次的结果
                    if !answered {
                        last_error = Some(LockError::store_unavailable(
                            self.store.backend(),
                            "request timed out",
                        ));
                    }
                }
            }
            attempt += 1;

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let pause = self.config.poll_interval.min(deadline - now);

            tokio::select! {
                biased;

                _ = cancelled(cancel.as_deref_mut()) => {
                    debug!("Lock acquisition cancelled");
                    record_lock_acquisition("cancelled", started.elapsed().as_secs_f64());
                    return Ok(false);
                }

                _ = tokio::time::sleep(pause) => {}
            }
        }

        let waited = started.elapsed().as_secs_f64();
        match last_error {
            Some(e) => {
                warn!(error = %e, attempt, "Lock acquisition gave up, lease store unavailable");
                record_lock_acquisition("error", waited);
                Err(e)
            }
            None => {
                debug!(attempt, "Lock acquisition timed out");
                record_lock_acquisition("timeout", waited);
                Ok(false)
            }
        }
    }

    /// 续期当前持有的租约
    ///
    /// 租约已被接管或已过期时返回 `OwnershipMismatch`，句柄回到未持有状态；
    /// 存储不可达时返回 `StoreUnavailable`，句柄仍认为自己持有（直到本地截止时间）。
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn renew(&mut self) -> Result<()> {
        let Some(held) = self.held.as_ref() else {
            return Err(self.mismatch());
        };

        let lease = self.config.lease_duration;
        let started = Instant::now();
        if started >= held.deadline {
            self.mark_lost("Lease lapsed locally before renewal");
            return Err(self.mismatch());
        }

        // 单次续期不能越过本地截止时间
        let outcome = tokio::time::timeout_at(
            held.deadline,
            self.store.renew(&self.key, &held.owner_token, lease),
        )
        .await;

        match outcome {
            Ok(Ok(true)) => {
                if let Some(held) = self.held.as_mut() {
                    held.deadline = started + lease;
                }
                self.state.touch();
                record_lock_renewal("renewed");
                Ok(())
            }
            Ok(Ok(false)) => {
                self.mark_lost("Lease was lost before renewal");
                Err(self.mismatch())
            }
            Ok(Err(e)) => {
                record_lock_renewal("error");
                Err(e)
            }
            Err(_) => {
                // 迟到的续期可能仍会写入，按 owner 清理
                if let Some(owner_token) =
                    self.mark_lost("Lease store did not answer renewal before the lease lapsed")
                {
                    spawn_release(self.store.clone(), self.key.clone(), owner_token, None);
                }
                Err(self.mismatch())
            }
        }
    }

    fn mismatch(&self) -> LockError {
        LockError::OwnershipMismatch {
            key: self.key.clone(),
        }
    }

    /// 本地放弃持有状态，返回丢失租约的 owner token
    fn mark_lost(&mut self, reason: &str) -> Option<String> {
        let held = self.held.take()?;
        warn!(owner = %held.owner_token, reason, "Lease lost");
        record_lock_renewal("lost");
        Some(held.owner_token)
    }

    fn new_owner_token(&self) -> String {
        format!("{}:{}", self.instance_id, Uuid::new_v4())
    }

    /// 丢弃一次结果不可用的获取尝试：后台按 owner 清理可能写入的记录，后续尝试换用新 token
    fn discard_attempt(&self, owner_token: &mut String) {
        let stale = std::mem::replace(owner_token, self.new_owner_token());
        spawn_release(self.store.clone(), self.key.clone(), stale, None);
    }

    /// 释放锁
    ///
    /// 未持有时为空操作，重复调用无害。存储瞬时故障按 `release_retry` 重试，
    /// 重试耗尽后返回错误，租约最终会自然过期。永远不会删除其他 owner 的租约。
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn unlock(&mut self) -> Result<()> {
        let Some(held) = self.held.take() else {
            return Ok(());
        };
        self.state.touch();

        let store = &self.store;
        let key = self.key.as_str();
        let owner_token = held.owner_token.as_str();
        let result = retry_with_policy(
            &self.config.release_retry,
            "lock_release",
            LockError::is_retryable,
            || store.release(key, owner_token),
        )
        .await;

        match result {
            Ok(true) => {
                debug!(owner = %owner_token, "Lock released");
                record_lock_release("released");
                Ok(())
            }
            Ok(false) => {
                // 租约已过期并被其他 owner 接管
                warn!(owner = %owner_token, "Lock was already taken over by another owner");
                record_lock_release("mismatch");
                Ok(())
            }
            Err(e) => {
                warn!(owner = %owner_token, error = %e, "Failed to release lock, lease will expire via TTL");
                record_lock_release("error");
                Err(e)
            }
        }
    }

    /// 放弃本地持有状态而不访问存储，租约交给 TTL 过期
    pub fn abandon(&mut self) {
        if let Some(held) = self.held.take() {
            warn!(key = %self.key, owner = %held.owner_token, "Lock abandoned without release");
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("key", &self.key)
            .field("owner_token", &self.owner_token())
            .field("held", &self.is_held())
            .finish()
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let Some(held) = self.held.take() else {
            return;
        };

        let HeldLease {
            owner_token,
            _gate: gate,
            ..
        } = held;
        let key = std::mem::take(&mut self.key);
        // 闸门随任务一起移动，释放完成前本进程其他句柄不会抢先访问存储
        spawn_release(self.store.clone(), key, owner_token, Some(gate));
    }
}

/// 在当前 tokio 运行时中后台释放 `owner_token` 的租约，不在运行时内时只记录日志
fn spawn_release(
    store: Arc<dyn LeaseStore>,
    key: String,
    owner_token: String,
    gate: Option<OwnedMutexGuard<()>>,
) {
    match Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                match store.release(&key, &owner_token).await {
                    Ok(_) => {
                        debug!(key = %key, owner = %owner_token, "Lock released in background");
                        record_lock_release("released");
                    }
                    Err(e) => {
                        warn!(key = %key, error = %e, "Failed to release lock in background, lease will expire via TTL");
                        record_lock_release("error");
                    }
                }
                drop(gate);
            });
        }
        Err(_) => {
            warn!(
                key = %key,
                owner = %owner_token,
                "No tokio runtime to release lock - lock will expire via TTL"
            );
        }
    }
}
