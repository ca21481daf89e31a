//! 锁配置

use std::time::Duration;

use distlock_shared::config::CoordinationConfig;
use distlock_shared::retry::RetryPolicy;

use crate::error::{LockError, Result};

/// 锁配置
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// 每次获取或续期写入的租约时长
    pub lease_duration: Duration,
    /// 获取失败后的轮询间隔
    pub poll_interval: Duration,
    /// `lock()` / `execute_locked` 未显式指定时使用的等待时长
    pub acquisition_timeout: Duration,
    /// 释放锁时对存储瞬时故障的重试策略
    pub release_retry: RetryPolicy,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
            acquisition_timeout: Duration::from_secs(5),
            release_retry: RetryPolicy::default(),
        }
    }
}

impl LockConfig {
    pub fn from_coordination(config: &CoordinationConfig) -> Self {
        Self {
            lease_duration: config.lease_duration(),
            poll_interval: config.acquisition_poll_interval(),
            acquisition_timeout: config.acquisition_timeout(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.lease_duration.is_zero() {
            return Err(LockError::InvalidConfig(
                "lease_duration must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(LockError::InvalidConfig(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
