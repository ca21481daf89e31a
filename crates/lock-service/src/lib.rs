//! 基于共享存储的分布式锁与选主
//!
//! 多个独立进程只通过一张共享的租约表协调：互斥访问共享资源，并在彼此之间选出唯一的 leader。
//! 进程之间没有任何直接网络通信。
//!
//! ## 模块结构
//!
//! - `store`: 租约存储适配层（PostgreSQL / Redis / 内存）
//! - `lock`: 锁注册表与锁句柄
//! - `leader`: 选主器
//! - `error`: 错误类型定义
//! - `http`: 演示用 HTTP 接口
//! - `file_repository`: 受锁保护的共享文件

pub mod error;
pub mod file_repository;
pub mod http;
pub mod leader;
pub mod lock;
pub mod store;

pub use error::{LockError, Result};
pub use leader::{
    ChannelListener, ElectorConfig, ElectorHandle, ElectorState, LeaderElector, LeaderEvent,
    LeadershipListener, LeadershipState, LoggingListener, Term,
};
pub use lock::{LockConfig, LockHandle, LockRegistry};
pub use store::{LeaseStore, LockRecord, MemoryLeaseStore, PostgresLeaseStore, RedisLeaseStore};
