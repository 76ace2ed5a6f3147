//! 运维用 HTTP 接口
//!
//! 查询运行实例与任务实例状态（含失败原因），取消运行实例，暂停/恢复工作流。
//!
//! ```text
//! GET  /health
//! GET  /api/runs?workflow=&state=&limit=
//! GET  /api/runs/{id}
//! POST /api/runs/{id}/cancel
//! GET  /api/workflows
//! POST /api/workflows/{name}/pause
//! POST /api/workflows/{name}/unpause
//! ```

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use tokio::sync::broadcast;
use tower::ServiceBuilder;
use tracing::info;

use orchestrator_core::{
    config::ApiConfig, traits::MetadataStore, SchedulerError, SchedulerResult,
};
use orchestrator_dispatcher::{RunController, WorkflowRegistry};

use middleware::{cors_layer, request_logging, trace_layer};
pub use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(
    store: Arc<dyn MetadataStore>,
    controller: Arc<RunController>,
    registry: Arc<WorkflowRegistry>,
    api_config: &ApiConfig,
) -> Router {
    let state = AppState {
        store,
        controller,
        registry,
    };

    let router = create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    );

    if api_config.cors_enabled {
        router.layer(cors_layer(api_config))
    } else {
        router
    }
}

/// 绑定地址并提供服务，收到关闭信号后优雅退出
pub async fn serve(
    app: Router,
    api_config: &ApiConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> SchedulerResult<()> {
    let listener = tokio::net::TcpListener::bind(&api_config.bind_address)
        .await
        .map_err(|e| {
            SchedulerError::FatalConfig(format!(
                "无法绑定API地址 {}: {e}",
                api_config.bind_address
            ))
        })?;
    info!("API服务监听于 {}", api_config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await
        .map_err(|e| SchedulerError::Internal(format!("API服务异常退出: {e}")))?;

    info!("API服务已停止");
    Ok(())
}
