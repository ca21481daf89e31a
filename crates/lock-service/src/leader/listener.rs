//! 选主事件与监听器

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::info;

/// 一段连续持有领导权的任期
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Term {
    /// 本地任期号，每个选主器单调递增
    pub number: u64,
    /// 本任期持有锁使用的 owner token
    pub owner_token: String,
    pub role: String,
}

/// 选主事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaderEvent {
    Granted(Term),
    Revoked(Term),
}

impl LeaderEvent {
    pub fn term(&self) -> &Term {
        match self {
            Self::Granted(term) | Self::Revoked(term) => term,
        }
    }
}

/// 领导权变更监听器
///
/// 回调在选主任务中同步执行，不应阻塞。同一任期内 `on_granted` 总在 `on_revoked` 之前，
/// 且各自只触发一次。
pub trait LeadershipListener: Send + Sync {
    fn on_granted(&self, term: &Term);

    fn on_revoked(&self, term: &Term);
}

/// 只记录日志的监听器
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl LeadershipListener for LoggingListener {
    fn on_granted(&self, term: &Term) {
        info!(role = %term.role, term = term.number, owner = %term.owner_token, "Leadership granted");
    }

    fn on_revoked(&self, term: &Term) {
        info!(role = %term.role, term = term.number, owner = %term.owner_token, "Leadership revoked");
    }
}

/// 把事件转发到 channel 的监听器
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<LeaderEvent>,
}

impl ChannelListener {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LeaderEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LeadershipListener for ChannelListener {
    fn on_granted(&self, term: &Term) {
        // 接收端已关闭时丢弃事件
        let _ = self.tx.send(LeaderEvent::Granted(term.clone()));
    }

    fn on_revoked(&self, term: &Term) {
        let _ = self.tx.send(LeaderEvent::Revoked(term.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn term(number: u64) -> Term {
        Term {
            number,
            owner_token: format!("instance:{}", number),
            role: "scheduler".to_string(),
        }
    }

    #[test]
    fn test_channel_listener_forwards_events_in_order() {
        let (listener, mut rx) = ChannelListener::new();
        listener.on_granted(&term(1));
        listener.on_revoked(&term(1));

        assert_eq!(rx.try_recv().unwrap(), LeaderEvent::Granted(term(1)));
        assert_eq!(rx.try_recv().unwrap(), LeaderEvent::Revoked(term(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_channel_listener_ignores_closed_receiver() {
        let (listener, rx) = ChannelListener::new();
        drop(rx);
        listener.on_granted(&term(1));
    }

    #[test]
    fn test_event_term() {
        assert_eq!(LeaderEvent::Revoked(term(3)).term().number, 3);
    }

    #[test]
    fn test_term_serializes() {
        let json = serde_json::to_value(term(2)).unwrap();
        assert_eq!(json["number"], 2);
        assert_eq!(json["role"], "scheduler");
    }
}
