use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use orchestrator_core::{
    models::{Run, RunFilter, RunState, TaskInstance},
    SchedulerError,
};

use crate::{
    error::{ApiError, ApiResult},
    response::{success, success_with_message},
    routes::AppState,
};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

/// 运行实例查询参数
#[derive(Debug, Deserialize)]
pub struct RunQueryParams {
    pub workflow: Option<String>,
    pub state: Option<String>,
    pub limit: Option<i64>,
}

impl RunQueryParams {
    fn into_filter(self) -> ApiResult<RunFilter> {
        let state = self
            .state
            .map(|s| s.parse::<RunState>())
            .transpose()
            .map_err(ApiError::BadRequest)?;
        let limit = self.limit.unwrap_or(DEFAULT_LIMIT);
        if limit <= 0 {
            return Err(ApiError::BadRequest("limit 必须大于0".to_string()));
        }

        Ok(RunFilter {
            workflow_name: self.workflow,
            state,
            limit: Some(limit.min(MAX_LIMIT)),
        })
    }
}

/// 运行实例详情：包含每个任务实例的状态和失败原因
#[derive(Debug, Serialize)]
pub struct RunDetail {
    pub run: Run,
    pub tasks: Vec<TaskInstance>,
}

/// 获取运行实例列表，最新的在前
pub async fn list_runs(
    State(state): State<AppState>,
    Query(params): Query<RunQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let filter = params.into_filter()?;
    let runs = state.store.list_runs(&filter).await?;
    Ok(success(runs))
}

/// 获取单个运行实例
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let run = state
        .store
        .get_run(id)
        .await?
        .ok_or(SchedulerError::RunNotFound { id })?;
    let tasks = state.store.list_task_instances(id).await?;
    Ok(success(RunDetail { run, tasks }))
}

/// 取消运行实例
pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state.controller.cancel_run(id).await?;
    info!(run_id = id, cancelled = outcome.cancelled_instances.len(), "通过API取消运行实例");

    let message = if outcome.already_finished {
        "运行实例已结束"
    } else {
        "运行实例已取消"
    };
    Ok(success_with_message(outcome, message))
}
