use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use orchestrator_core::traits::MetadataStore;
use orchestrator_dispatcher::{RunController, WorkflowRegistry};

use crate::handlers::{
    health::health_check,
    runs::{cancel_run, get_run, list_runs},
    workflows::{list_workflows, pause_workflow, unpause_workflow},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MetadataStore>,
    pub controller: Arc<RunController>,
    /// 当前进程加载的工作流定义，仅用于补充展示信息
    pub registry: Arc<WorkflowRegistry>,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        // 健康检查
        .route("/health", get(health_check))
        // 运行实例
        .route("/api/runs", get(list_runs))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        // 工作流
        .route("/api/workflows", get(list_workflows))
        .route("/api/workflows/{name}/pause", post(pause_workflow))
        .route("/api/workflows/{name}/unpause", post(unpause_workflow))
        .with_state(state)
}
