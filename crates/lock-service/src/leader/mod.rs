//! 基于分布式锁的选主
//!
//! 每个进程运行一个 [`LeaderElector`]，它们通过同一个租约存储争抢 `leader:{role}` 锁，
//! 持有锁的进程即为 leader。除存储的原子写之外不引入任何额外协调。

mod elector;
mod listener;

pub use elector::{ElectorConfig, ElectorHandle, ElectorState, LeaderElector, LeadershipState};
pub use listener::{ChannelListener, LeaderEvent, LeadershipListener, LoggingListener, Term};
