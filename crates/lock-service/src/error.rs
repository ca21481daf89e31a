//! 分布式锁错误类型
//!
//! 定义租约存储、锁句柄和选主器共用的错误分类

use std::time::Duration;

use thiserror::Error;

/// 分布式锁错误类型
#[derive(Debug, Error)]
pub enum LockError {
    /// 在超时时间内未能获取锁，调用方自行决定重试或放弃
    #[error("获取锁超时: key={key}, timeout={timeout:?}")]
    AcquisitionTimeout { key: String, timeout: Duration },

    /// 无法访问租约存储
    #[error("锁存储不可用: backend={backend}, {message}")]
    StoreUnavailable {
        backend: &'static str,
        message: String,
    },

    /// 租约已被其他持有者接管
    #[error("锁持有者不匹配: key={key}")]
    OwnershipMismatch { key: String },

    #[error("配置无效: {0}")]
    InvalidConfig(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 分布式锁 Result 类型别名
pub type Result<T> = std::result::Result<T, LockError>;

impl LockError {
    pub fn store_unavailable(backend: &'static str, message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            backend,
            message: message.into(),
        }
    }

    /// 检查错误是否可重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// 获取错误码（用于 API 响应）
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::AcquisitionTimeout { .. } => "ACQUISITION_TIMEOUT",
            Self::StoreUnavailable { .. } => "STORE_UNAVAILABLE",
            Self::OwnershipMismatch { .. } => "OWNERSHIP_MISMATCH",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<sqlx::Error> for LockError {
    fn from(err: sqlx::Error) -> Self {
        Self::store_unavailable("postgres", err.to_string())
    }
}

impl From<redis::RedisError> for LockError {
    fn from(err: redis::RedisError) -> Self {
        Self::store_unavailable("redis", err.to_string())
    }
}
