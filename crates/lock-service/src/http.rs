//! HTTP 演示接口
//!
//! - `GET /{name}/{wait_ms}`: 持锁写入共享文件，等待 `wait_ms` 后释放，返回文件内容
//! - `GET /leader`: 选主状态
//! - `GET /locks/{key}`: 锁表中的当前记录
//! - `GET /health`: 健康检查，包含存储连通性

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router, middleware};
use chrono::Utc;
use distlock_shared::observability::middleware::http_tracing;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::error::LockError;
use crate::file_repository::FileRepository;
use crate::leader::LeadershipState;
use crate::lock::LockRegistry;
use crate::store::LockRecord;

/// 演示接口使用的固定锁 key
pub const DEMO_LOCK_KEY: &str = "synchronized-file";

/// 单次请求允许的最长持锁等待
const MAX_WAIT: Duration = Duration::from_secs(60);

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Axum 应用共享状态
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<LockRegistry>,
    pub files: Arc<FileRepository>,
    /// 选主未启用时为 None
    pub leadership: Option<watch::Receiver<LeadershipState>>,
    pub acquisition_timeout: Duration,
}

impl AppState {
    pub fn new(
        registry: Arc<LockRegistry>,
        files: Arc<FileRepository>,
        leadership: Option<watch::Receiver<LeadershipState>>,
    ) -> Self {
        let acquisition_timeout = registry.config().acquisition_timeout;
        Self {
            registry,
            files,
            leadership,
            acquisition_timeout,
        }
    }
}

/// 统一响应包装
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            code: "SUCCESS".to_string(),
            data: Some(data),
        }
    }
}

/// 接口错误
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("文件读写失败: {0}")]
    Io(#[from] std::io::Error),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Lock(LockError::AcquisitionTimeout { .. }) => StatusCode::CONFLICT,
            Self::Lock(LockError::StoreUnavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Lock(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Lock(e) => e.error_code(),
            Self::Io(_) => "IO_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        let body = json!({
            "success": false,
            "code": self.error_code(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<ApiResponse<T>>, ApiError>;

#[derive(Debug, Serialize)]
pub struct HelloResponse {
    pub acquired: bool,
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct LeaderResponse {
    pub enabled: bool,
    pub leadership: Option<LeadershipState>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub backend: &'static str,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 持锁写入问候语，等待 `wait_ms` 后释放锁并返回文件内容
///
/// 未能在超时内拿到锁时不写入，只返回当前内容。
async fn hello(
    State(state): State<AppState>,
    Path((name, wait_ms)): Path<(String, u64)>,
) -> ApiResult<HelloResponse> {
    let wait = Duration::from_millis(wait_ms).min(MAX_WAIT);
    let mut handle = state.registry.obtain(DEMO_LOCK_KEY);

    let acquired = handle.try_lock(state.acquisition_timeout).await?;
    if acquired {
        let message = format!("Hello {}@ {}!", name, Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"));
        let written = async {
            state.files.update(&message).await?;
            tokio::time::sleep(wait).await;
            Ok::<_, std::io::Error>(())
        }
        .await;

        if let Err(e) = handle.unlock().await {
            warn!(key = DEMO_LOCK_KEY, error = %e, "Failed to unlock after guarded write");
        }
        written?;
        info!(name = %name, wait_ms = wait.as_millis() as u64, "Guarded write completed");
    } else {
        info!(name = %name, "Lock not acquired, skipping guarded write");
    }

    let content = state.files.read().await?;
    Ok(Json(ApiResponse::success(HelloResponse { acquired, content })))
}

async fn leader(State(state): State<AppState>) -> ApiResult<LeaderResponse> {
    let leadership = state.leadership.as_ref().map(|rx| rx.borrow().clone());
    Ok(Json(ApiResponse::success(LeaderResponse {
        enabled: leadership.is_some(),
        leadership,
    })))
}

async fn lock_record(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Option<LockRecord>> {
    let record = state.registry.store().current(&key).await?;
    Ok(Json(ApiResponse::success(record)))
}

/// 存储不可达时返回 503，便于负载均衡摘除实例
async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store = state.registry.store();
    let checked = match tokio::time::timeout(HEALTH_CHECK_TIMEOUT, store.health_check()).await {
        Ok(result) => result,
        Err(_) => Err(LockError::store_unavailable(store.backend(), "health check timed out")),
    };

    let (status, health, error) = match checked {
        Ok(()) => (StatusCode::OK, "healthy", None),
        Err(e) => {
            warn!(backend = store.backend(), error = %e, "Store health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unhealthy", Some(e.to_string()))
        }
    };

    (
        status,
        Json(HealthResponse {
            status: health,
            backend: store.backend(),
            instance_id: state.registry.instance_id().to_string(),
            error,
        }),
    )
}

/// 构建路由
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/leader", get(leader))
        .route("/locks/{key}", get(lock_record))
        .route("/{name}/{wait_ms}", get(hello))
        .layer(middleware::from_fn(http_tracing))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
