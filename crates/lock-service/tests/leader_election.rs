//! 选主集成测试
//!
//! 多个选主器各自拥有独立的 `LockRegistry`，通过同一个内存存储争抢领导权。
//! 每个进程的存储连接可以单独断开，用于模拟网络分区；
//! 也可以让写请求长时间挂起，模拟响应缓慢的存储。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use distlock::{
    ChannelListener, ElectorConfig, ElectorHandle, LeaderElector, LeaderEvent, LeaseStore,
    LockConfig, LockError, LockRecord, LockRegistry, MemoryLeaseStore, Result,
};
use distlock_shared::test_utils::millis;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

const LEADER_KEY: &str = "leader:scheduler";

/// 挂起的请求在这段时间后才到达共享存储
const STALL: Duration = Duration::from_secs(30);

/// 单个进程到共享存储的连接
struct ProcessStore {
    shared: Arc<MemoryLeaseStore>,
    connected: AtomicBool,
    slow: AtomicBool,
}

impl ProcessStore {
    fn new(shared: Arc<MemoryLeaseStore>) -> Self {
        Self {
            shared,
            connected: AtomicBool::new(true),
            slow: AtomicBool::new(false),
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// `try_acquire` 和 `renew` 挂起 [`STALL`]，其余操作不受影响
    fn set_slow(&self, slow: bool) {
        self.slow.store(slow, Ordering::SeqCst);
    }

    async fn stall(&self) {
        if self.slow.load(Ordering::SeqCst) {
            tokio::time::sleep(STALL).await;
        }
    }

    fn check(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LockError::store_unavailable("memory", "network partition"))
        }
    }
}

#[async_trait]
impl LeaseStore for ProcessStore {
    fn backend(&self) -> &'static str {
        self.shared.backend()
    }

    async fn try_acquire(&self, key: &str, owner_token: &str, lease: Duration) -> Result<bool> {
        self.check()?;
        self.stall().await;
        self.shared.try_acquire(key, owner_token, lease).await
    }

    async fn renew(&self, key: &str, owner_token: &str, lease: Duration) -> Result<bool> {
        self.check()?;
        self.stall().await;
        self.shared.renew(key, owner_token, lease).await
    }

    async fn release(&self, key: &str, owner_token: &str) -> Result<bool> {
        self.check()?;
        self.shared.release(key, owner_token).await
    }

    async fn current(&self, key: &str) -> Result<Option<LockRecord>> {
        self.check()?;
        self.shared.current(key).await
    }

    async fn delete_expired(&self) -> Result<u64> {
        self.check()?;
        self.shared.delete_expired().await
    }

    async fn health_check(&self) -> Result<()> {
        self.check()?;
        self.shared.health_check().await
    }
}

struct Process {
    store: Arc<ProcessStore>,
    elector: ElectorHandle,
    events: UnboundedReceiver<LeaderEvent>,
}

fn process_registry(store: Arc<ProcessStore>) -> Arc<LockRegistry> {
    Arc::new(
        LockRegistry::new(
            store,
            LockConfig {
                lease_duration: Duration::from_secs(3),
                poll_interval: millis(50),
                ..LockConfig::default()
            },
        )
        .unwrap(),
    )
}

/// 租约 3 秒，心跳 1 秒
fn spawn_process(shared: &Arc<MemoryLeaseStore>) -> Process {
    let store = Arc::new(ProcessStore::new(shared.clone()));
    let registry = process_registry(store.clone());
    let (listener, events) = ChannelListener::new();
    let elector = LeaderElector::new(
        registry,
        ElectorConfig {
            role: "scheduler".to_string(),
            heartbeat_interval: Duration::from_secs(1),
            acquisition_timeout: millis(500),
            busy_wait: millis(100),
            ..ElectorConfig::default()
        },
        Arc::new(listener),
    )
    .unwrap()
    .start();

    Process {
        store,
        elector,
        events,
    }
}

fn leader_count(procs: &[Process]) -> usize {
    procs.iter().filter(|p| p.elector.is_leader()).count()
}

fn leader_index(procs: &[Process]) -> Option<usize> {
    procs.iter().position(|p| p.elector.is_leader())
}

/// 在 `window` 内每 50ms 采样一次，断言任意时刻至多一个 leader
async fn assert_single_leader_for(procs: &[Process], window: Duration) {
    let until = Instant::now() + window;
    while Instant::now() < until {
        tokio::time::sleep(millis(50)).await;
        assert!(leader_count(procs) <= 1, "more than one leader observed");
    }
}

fn drain(events: &mut UnboundedReceiver<LeaderEvent>) -> Vec<LeaderEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

mod singularity {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_leader_among_many() {
        let shared = Arc::new(MemoryLeaseStore::default());
        let procs: Vec<Process> = (0..4).map(|_| spawn_process(&shared)).collect();

        assert_single_leader_for(&procs, Duration::from_secs(20)).await;
        assert_eq!(leader_count(&procs), 1);

        for p in procs {
            p.elector.stop().await;
        }
        assert!(shared.current(LEADER_KEY).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopping_leader_hands_over_to_exactly_one_follower() {
        let shared = Arc::new(MemoryLeaseStore::default());
        let mut procs: Vec<Process> = (0..3).map(|_| spawn_process(&shared)).collect();

        tokio::time::sleep(millis(500)).await;
        let idx = leader_index(&procs).expect("a leader must be elected");
        let mut old = procs.remove(idx);
        let term = match old.events.recv().await.unwrap() {
            LeaderEvent::Granted(term) => term,
            other => panic!("unexpected event: {:?}", other),
        };

        old.elector.stop().await;
        assert_eq!(old.events.recv().await.unwrap(), LeaderEvent::Revoked(term));

        // 旧 leader 主动释放锁，新 leader 不需要等租约过期
        let started = Instant::now();
        while leader_count(&procs) == 0 {
            tokio::time::sleep(millis(50)).await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_single_leader_for(&procs, Duration::from_secs(5)).await;
        assert_eq!(leader_count(&procs), 1);

        for p in procs {
            p.elector.stop().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_partitioned_leader_steps_down_before_takeover() {
        let shared = Arc::new(MemoryLeaseStore::default());
        let mut procs: Vec<Process> = (0..3).map(|_| spawn_process(&shared)).collect();

        tokio::time::sleep(millis(500)).await;
        let idx = leader_index(&procs).expect("a leader must be elected");
        procs[idx].store.set_connected(false);

        assert_single_leader_for(&procs, Duration::from_secs(8)).await;
        let new_idx = leader_index(&procs).expect("a follower must take over");
        assert_ne!(new_idx, idx);

        let events = drain(&mut procs[idx].events);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], LeaderEvent::Granted(_)));
        assert!(matches!(events[1], LeaderEvent::Revoked(_)));

        for p in procs {
            p.elector.stop().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_yield_hands_leadership_away() {
        let shared = Arc::new(MemoryLeaseStore::default());
        let mut procs: Vec<Process> = (0..2).map(|_| spawn_process(&shared)).collect();

        tokio::time::sleep(millis(500)).await;
        let idx = leader_index(&procs).expect("a leader must be elected");
        procs[idx].elector.yield_leadership();

        let revoked = loop {
            match procs[idx].events.recv().await.unwrap() {
                LeaderEvent::Revoked(term) => break term,
                LeaderEvent::Granted(_) => continue,
            }
        };
        assert_eq!(revoked.number, 1);

        assert_single_leader_for(&procs, Duration::from_secs(3)).await;
        assert_eq!(leader_count(&procs), 1);

        for p in procs {
            p.elector.stop().await;
        }
    }
}

mod store_outage {
    use super::*;

    /// 心跳 1 秒、租约 3 秒，存储中断 0.5 秒：重试期间恢复，不触发 revoked
    #[tokio::test(start_paused = true)]
    async fn test_short_outage_keeps_leadership() {
        let shared = Arc::new(MemoryLeaseStore::default());
        let mut p = spawn_process(&shared);

        assert!(matches!(p.events.recv().await.unwrap(), LeaderEvent::Granted(ref t) if t.number == 1));

        tokio::time::sleep(millis(900)).await;
        shared.set_available(false);
        tokio::time::sleep(millis(500)).await;
        shared.set_available(true);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(p.elector.is_leader());
        assert!(drain(&mut p.events).is_empty());
        assert_eq!(p.elector.state().term.unwrap().number, 1);

        p.elector.stop().await;
    }

    /// 存储中断 4 秒：租约到期前恰好 revoked 一次，恢复后重新成为 leader
    #[tokio::test(start_paused = true)]
    async fn test_long_outage_revokes_once_then_reacquires() {
        let shared = Arc::new(MemoryLeaseStore::default());
        let mut p = spawn_process(&shared);
        let started = Instant::now();

        let first = match p.events.recv().await.unwrap() {
            LeaderEvent::Granted(term) => term,
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(first.number, 1);

        tokio::time::sleep(millis(900)).await;
        shared.set_available(false);
        let outage_ends = started + millis(4_900);

        assert_eq!(p.events.recv().await.unwrap(), LeaderEvent::Revoked(first));
        // 在租约过期之前主动让位
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!p.elector.is_leader());

        tokio::time::sleep_until(outage_ends).await;
        shared.set_available(true);

        match p.events.recv().await.unwrap() {
            LeaderEvent::Granted(term) => assert_eq!(term.number, 2),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(started.elapsed() >= millis(4_900));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(drain(&mut p.events).is_empty());
        assert!(p.elector.is_leader());

        p.elector.stop().await;
    }

    /// 断开连接的 leader 停止时释放失败也不会阻塞关闭
    #[tokio::test(start_paused = true)]
    async fn test_stop_during_outage_completes() {
        let shared = Arc::new(MemoryLeaseStore::default());
        let mut p = spawn_process(&shared);
        assert!(matches!(p.events.recv().await.unwrap(), LeaderEvent::Granted(_)));

        p.store.set_connected(false);
        p.elector.stop().await;
        assert!(matches!(p.events.recv().await.unwrap(), LeaderEvent::Revoked(_)));
    }
}

mod slow_store {
    use super::*;

    /// 续期挂起的 leader 在租约过期前让位，接管期间不会出现两个 leader
    #[tokio::test(start_paused = true)]
    async fn test_hung_renewal_steps_down_before_takeover() {
        let shared = Arc::new(MemoryLeaseStore::default());
        let started = Instant::now();
        let mut procs: Vec<Process> = (0..2).map(|_| spawn_process(&shared)).collect();

        tokio::time::sleep(millis(500)).await;
        let idx = leader_index(&procs).expect("a leader must be elected");
        procs[idx].store.set_slow(true);

        let term = match procs[idx].events.recv().await.unwrap() {
            LeaderEvent::Granted(term) => term,
            other => panic!("unexpected event: {:?}", other),
        };
        assert_eq!(procs[idx].events.recv().await.unwrap(), LeaderEvent::Revoked(term));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(!procs[idx].elector.is_leader());

        assert_single_leader_for(&procs, Duration::from_secs(8)).await;
        let new_idx = leader_index(&procs).expect("the other process must take over");
        assert_ne!(new_idx, idx);
        assert!(drain(&mut procs[idx].events).is_empty());

        procs[idx].store.set_slow(false);
        for p in procs {
            p.elector.stop().await;
        }
    }

    /// 挂起的获取请求不会拖过等待时长，也不会留下锁记录
    #[tokio::test(start_paused = true)]
    async fn test_hung_acquire_is_bounded_by_timeout() {
        let shared = Arc::new(MemoryLeaseStore::default());
        let store = Arc::new(ProcessStore::new(shared.clone()));
        store.set_slow(true);
        let registry = process_registry(store.clone());
        let mut handle = registry.obtain("orders");

        let started = Instant::now();
        let result = handle.try_lock(millis(500)).await;
        assert!(matches!(result, Err(LockError::StoreUnavailable { .. })));
        assert_eq!(started.elapsed(), millis(500));
        assert!(!handle.is_held());

        // 被丢弃的请求永远不会写入
        tokio::time::sleep(STALL * 2).await;
        assert!(shared.current("orders").await.unwrap().is_none());
    }

    /// 续期挂起时在本地截止时间返回 OwnershipMismatch，句柄不再持有锁
    #[tokio::test(start_paused = true)]
    async fn test_hung_renewal_gives_up_at_local_deadline() {
        let shared = Arc::new(MemoryLeaseStore::default());
        let store = Arc::new(ProcessStore::new(shared.clone()));
        let registry = process_registry(store.clone());
        let mut handle = registry.obtain("orders");

        let acquired_at = Instant::now();
        assert!(handle.try_lock(millis(500)).await.unwrap());

        tokio::time::sleep(Duration::from_secs(1)).await;
        store.set_slow(true);
        let result = handle.renew().await;

        assert!(matches!(result, Err(LockError::OwnershipMismatch { .. })));
        assert_eq!(acquired_at.elapsed(), Duration::from_secs(3));
        assert!(!handle.is_held());
    }
}
