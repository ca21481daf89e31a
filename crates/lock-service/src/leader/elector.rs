//! 选主器
//!
//! 在锁注册表之上运行的后台循环：争抢 `leader:{role}` 锁，成为 leader 后按心跳续期，
//! 续期失败或主动让出时回到 follower 并继续争抢。
//!
//! ## 状态流转
//!
//! ```text
//! Follower ──尝试获取──▶ Candidate ──成功──▶ Leader
//!    ▲                      │                  │
//!    └──────失败/超时───────┘                  │
//!    └──────续期失败 / yield ──────────────────┘
//! 任意状态 ──stop──▶ Stopped
//! ```

use std::sync::Arc;
use std::time::Duration;

use distlock_shared::config::CoordinationConfig;
use distlock_shared::observability::metrics::record_leadership_transition;
use distlock_shared::retry::RetryPolicy;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::listener::{LeadershipListener, Term};
use crate::error::{LockError, Result};
use crate::lock::{LockHandle, LockRegistry};

/// 选主器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectorState {
    Follower,
    Candidate,
    Leader,
    Stopped,
}

/// 对外发布的领导权状态，只由选主任务写入
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeadershipState {
    pub state: ElectorState,
    pub is_leader: bool,
    /// 当前任期，仅 leader 状态下存在
    pub term: Option<Term>,
}

impl LeadershipState {
    fn new(state: ElectorState, term: Option<Term>) -> Self {
        Self {
            state,
            is_leader: state == ElectorState::Leader,
            term,
        }
    }
}

impl Default for LeadershipState {
    fn default() -> Self {
        Self::new(ElectorState::Follower, None)
    }
}

/// 选主配置
#[derive(Debug, Clone)]
pub struct ElectorConfig {
    /// 角色名，锁 key 为 `leader:{role}`
    pub role: String,
    /// 续期间隔，必须小于租约时长
    pub heartbeat_interval: Duration,
    /// 每轮争抢的等待时长
    pub acquisition_timeout: Duration,
    /// 两轮争抢之间的间隔
    pub busy_wait: Duration,
    /// 续期遇到存储故障时的重试策略，总时长同时受本地租约截止时间约束
    pub renew_retry: RetryPolicy,
}

impl Default for ElectorConfig {
    fn default() -> Self {
        Self {
            role: "leader".to_string(),
            heartbeat_interval: Duration::from_secs(3),
            acquisition_timeout: Duration::from_secs(3),
            busy_wait: Duration::from_millis(500),
            renew_retry: RetryPolicy {
                max_retries: 10,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(1),
                multiplier: 2.0,
            },
        }
    }
}

impl ElectorConfig {
    pub fn from_coordination(config: &CoordinationConfig) -> Self {
        Self {
            role: config.leader_role.clone(),
            heartbeat_interval: config.heartbeat_interval(),
            acquisition_timeout: config.leader_acquisition_timeout(),
            busy_wait: config.busy_wait(),
            ..Self::default()
        }
    }

    pub fn validate(&self, lease_duration: Duration) -> Result<()> {
        if self.role.trim().is_empty() {
            return Err(LockError::InvalidConfig("role must not be empty".to_string()));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(LockError::InvalidConfig(
                "heartbeat_interval must be greater than zero".to_string(),
            ));
        }
        if self.acquisition_timeout.is_zero() {
            return Err(LockError::InvalidConfig(
                "acquisition_timeout must be greater than zero".to_string(),
            ));
        }
        if self.heartbeat_interval >= lease_duration {
            return Err(LockError::InvalidConfig(format!(
                "heartbeat_interval ({:?}) must be shorter than lease_duration ({:?})",
                self.heartbeat_interval, lease_duration
            )));
        }
        Ok(())
    }
}

/// 退出 leader 状态的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeadExit {
    Shutdown,
    Yielded,
    Lost,
}

/// 选主器
pub struct LeaderElector {
    registry: Arc<LockRegistry>,
    config: ElectorConfig,
    listener: Arc<dyn LeadershipListener>,
}

impl LeaderElector {
    pub fn new(
        registry: Arc<LockRegistry>,
        config: ElectorConfig,
        listener: Arc<dyn LeadershipListener>,
    ) -> Result<Self> {
        config.validate(registry.config().lease_duration)?;
        Ok(Self {
            registry,
            config,
            listener,
        })
    }

    pub fn lock_key(&self) -> String {
        format!("leader:{}", self.config.role)
    }

    /// 启动选主循环
    pub fn start(self) -> ElectorHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (yield_tx, yield_rx) = mpsc::channel(1);
        let (state_tx, state_rx) = watch::channel(LeadershipState::default());
        let role = self.config.role.clone();

        let task = tokio::spawn(self.run(shutdown_rx, yield_rx, state_tx));

        ElectorHandle {
            role,
            shutdown_tx,
            yield_tx,
            state_rx,
            task: Some(task),
        }
    }

    async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        mut yields: mpsc::Receiver<()>,
        state_tx: watch::Sender<LeadershipState>,
    ) {
        let role = self.config.role.as_str();
        let mut handle = self.registry.obtain(&self.lock_key());
        let mut term_number: u64 = 0;

        info!(role = %role, instance_id = %self.registry.instance_id(), "Leader elector started");

        while !*shutdown.borrow() {
            publish(&state_tx, ElectorState::Candidate, None);

            let acquired = handle
                .try_lock_cancellable(self.config.acquisition_timeout, &mut shutdown)
                .await;
            match acquired {
                Ok(true) if *shutdown.borrow() => {
                    // 拿到锁的同时收到关闭信号，不再授予领导权
                    release(&mut handle, role).await;
                    break;
                }
                Ok(true) => {
                    term_number += 1;
                    let term = Term {
                        number: term_number,
                        owner_token: handle.owner_token().unwrap_or_default().to_string(),
                        role: role.to_string(),
                    };

                    publish(&state_tx, ElectorState::Leader, Some(term.clone()));
                    record_leadership_transition(role, "granted", true);
                    info!(role = %role, term = term.number, "Became leader");
                    self.listener.on_granted(&term);

                    // 丢弃成为 leader 之前积压的让出请求
                    while yields.try_recv().is_ok() {}

                    let exit = self.lead(&mut handle, &mut shutdown, &mut yields).await;
                    match exit {
                        LeadExit::Shutdown => {
                            publish(&state_tx, ElectorState::Stopped, None);
                            release(&mut handle, role).await;
                        }
                        LeadExit::Yielded => {
                            publish(&state_tx, ElectorState::Follower, None);
                            release(&mut handle, role).await;
                        }
                        LeadExit::Lost => {
                            publish(&state_tx, ElectorState::Follower, None);
                            handle.abandon();
                        }
                    }
                    record_leadership_transition(role, "revoked", false);
                    info!(role = %role, term = term.number, reason = ?exit, "Leadership revoked");
                    self.listener.on_revoked(&term);

                    if exit == LeadExit::Shutdown {
                        break;
                    }
                }
                Ok(false) => {
                    debug!(role = %role, "Leadership lock not acquired");
                    publish(&state_tx, ElectorState::Follower, None);
                }
                Err(e) => {
                    warn!(role = %role, error = %e, "Leadership acquisition failed");
                    publish(&state_tx, ElectorState::Follower, None);
                }
            }

            if !pause(self.config.busy_wait, &mut shutdown).await {
                break;
            }
        }

        publish(&state_tx, ElectorState::Stopped, None);
        info!(role = %role, "Leader elector stopped");
    }

    /// leader 状态下的心跳循环，返回退出原因
    async fn lead(
        &self,
        handle: &mut LockHandle,
        shutdown: &mut watch::Receiver<bool>,
        yields: &mut mpsc::Receiver<()>,
    ) -> LeadExit {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.wait_for(|stop| *stop) => return LeadExit::Shutdown,

                Some(()) = yields.recv() => {
                    info!(role = %self.config.role, "Yielding leadership");
                    return LeadExit::Yielded;
                }

                _ = tokio::time::sleep(self.config.heartbeat_interval) => {}
            }

            if !self.heartbeat(handle, shutdown).await {
                return LeadExit::Lost;
            }
        }
    }

    /// 提前让位的余量，吸收本地与存储之间的时钟误差
    ///
    /// 取租约的十分之一，且不超过租约与心跳间隔之差的一半，保证每次续期都有执行时间。
    fn step_down_margin(&self) -> Duration {
        let lease = self.registry.config().lease_duration;
        let slack = lease.saturating_sub(self.config.heartbeat_interval) / 2;
        (lease / 10).min(slack)
    }

    /// 续期；存储故障按 `renew_retry` 重试，下一次重试来不及在租约过期前完成时放弃
    ///
    /// 单次续期最多等到本地截止时间减去余量，存储不应答同样视为丢失。
    /// 返回 false 表示领导权已丢失。
    async fn heartbeat(&self, handle: &mut LockHandle, shutdown: &mut watch::Receiver<bool>) -> bool {
        let policy = &self.config.renew_retry;
        let margin = self.step_down_margin();
        let mut attempt: u32 = 0;

        loop {
            let budget = handle
                .lease_remaining()
                .unwrap_or_default()
                .saturating_sub(margin);

            let renewed = match tokio::time::timeout(budget, handle.renew()).await {
                Ok(renewed) => renewed,
                Err(_) => {
                    error!(
                        role = %self.config.role,
                        attempt,
                        budget_ms = budget.as_millis() as u64,
                        "Leadership renewal did not complete in time, stepping down before lease lapses"
                    );
                    return false;
                }
            };

            match renewed {
                Ok(()) => {
                    if attempt > 0 {
                        info!(role = %self.config.role, attempt, "Leadership renewed after retry");
                    }
                    return true;
                }
                Err(LockError::OwnershipMismatch { .. }) => {
                    warn!(role = %self.config.role, "Leadership lease was taken over");
                    return false;
                }
                Err(e) => {
                    let remaining = handle
                        .lease_remaining()
                        .unwrap_or_default()
                        .saturating_sub(margin);
                    let delay = policy.delay_for_attempt(attempt);
                    if !policy.should_retry(attempt) || delay >= remaining {
                        error!(
                            role = %self.config.role,
                            attempt,
                            remaining_ms = remaining.as_millis() as u64,
                            error = %e,
                            "Leadership renewal failed, stepping down before lease lapses"
                        );
                        return false;
                    }

                    warn!(
                        role = %self.config.role,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Leadership renewal failed, retrying"
                    );
                    if !pause(delay, shutdown).await {
                        // 由 lead 循环处理关闭
                        return true;
                    }
                    attempt += 1;
                }
            }
        }
    }
}

fn publish(state_tx: &watch::Sender<LeadershipState>, state: ElectorState, term: Option<Term>) {
    state_tx.send_replace(LeadershipState::new(state, term));
}

async fn release(handle: &mut LockHandle, role: &str) {
    if let Err(e) = handle.unlock().await {
        warn!(role = %role, error = %e, "Failed to release leadership lock");
    }
}

/// 等待 `duration`，期间收到关闭信号返回 false
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        biased;

        _ = shutdown.wait_for(|stop| *stop) => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// 运行中选主器的控制句柄
///
/// drop 时发送关闭信号；需要等待锁释放完成时使用 [`ElectorHandle::stop`]。
pub struct ElectorHandle {
    role: String,
    shutdown_tx: watch::Sender<bool>,
    yield_tx: mpsc::Sender<()>,
    state_rx: watch::Receiver<LeadershipState>,
    task: Option<JoinHandle<()>>,
}

impl ElectorHandle {
    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn state(&self) -> LeadershipState {
        self.state_rx.borrow().clone()
    }

    pub fn is_leader(&self) -> bool {
        self.state_rx.borrow().is_leader
    }

    pub fn subscribe(&self) -> watch::Receiver<LeadershipState> {
        self.state_rx.clone()
    }

    /// 请求让出领导权；非 leader 时请求会被忽略
    pub fn yield_leadership(&self) {
        // channel 满说明已有未处理的让出请求
        let _ = self.yield_tx.try_send(());
    }

    /// 停止选主：取消进行中的等待，持有领导权时先释放锁并触发 revoked
    pub async fn stop(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            error!(role = %self.role, error = %e, "Leader elector task failed");
        }
    }
}

impl Drop for ElectorHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
