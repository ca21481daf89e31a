//! 分布式锁演示服务
//!
//! 启动租约存储、锁注册表和选主器，并通过 HTTP 暴露受锁保护的共享文件。

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use distlock::file_repository::FileRepository;
use distlock::http::{self, AppState};
use distlock::{
    ElectorConfig, LeaderElector, LeaseStore, LockConfig, LockRegistry, LoggingListener,
    MemoryLeaseStore, PostgresLeaseStore, RedisLeaseStore,
};
use distlock_shared::config::{AppConfig, LockBackend};
use distlock_shared::database::Database;
use distlock_shared::observability;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};

/// 后台清理的执行间隔
const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(60);
/// 本地锁状态闲置多久后回收
const IDLE_LOCK_STATE: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置并初始化可观测性
    let config = AppConfig::load("distlock-server")?;
    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!(
        environment = %config.environment,
        backend = ?config.coordination.backend,
        region = %config.coordination.region,
        "Starting distlock-server on {}",
        config.server_addr()
    );

    // 2. 初始化租约存储
    let mut database = None;
    let store: Arc<dyn LeaseStore> = match config.coordination.backend {
        LockBackend::Postgres => {
            let db = Database::connect(&config.database).await?;
            if config.database.run_migrations {
                db.run_migrations().await?;
            }
            let store = PostgresLeaseStore::new(db.clone(), &config.coordination.region);
            database = Some(db);
            Arc::new(store)
        }
        LockBackend::Redis => Arc::new(
            RedisLeaseStore::connect(&config.redis, &config.coordination.region).await?,
        ),
        LockBackend::Memory => {
            warn!("Using in-memory lease store, locks are not shared across processes");
            Arc::new(MemoryLeaseStore::new(&config.coordination.region))
        }
    };
    info!(backend = store.backend(), "Lease store initialized");

    // 3. 锁注册表与后台清理
    let registry = Arc::new(LockRegistry::new(
        store,
        LockConfig::from_coordination(&config.coordination),
    )?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let housekeeping =
        registry.spawn_housekeeping(HOUSEKEEPING_INTERVAL, IDLE_LOCK_STATE, shutdown_rx);

    // 4. 选主
    let elector = if config.coordination.leader_election_enabled {
        let elector = LeaderElector::new(
            registry.clone(),
            ElectorConfig::from_coordination(&config.coordination),
            Arc::new(LoggingListener),
        )?;
        Some(elector.start())
    } else {
        info!("Leader election disabled");
        None
    };

    // 5. HTTP 服务
    let state = AppState::new(
        registry.clone(),
        Arc::new(FileRepository::new(&config.file_repository_path)),
        elector.as_ref().map(|e| e.subscribe()),
    );
    let app = http::router(state);

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("HTTP server listening on {}", config.server_addr());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. 优雅关闭：先交出领导权，再停止后台任务和连接池
    if let Some(elector) = elector {
        elector.stop().await;
    }
    let _ = shutdown_tx.send(true);
    if let Err(e) = housekeeping.await {
        warn!(error = %e, "Lock housekeeping task failed");
    }
    if let Some(db) = database {
        db.close().await;
    }

    info!("Service shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号，用于 Kubernetes 优雅关闭
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
