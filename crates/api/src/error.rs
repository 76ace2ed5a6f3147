use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use orchestrator_core::SchedulerError;
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, String, &'static str) {
        match self {
            ApiError::Scheduler(SchedulerError::RunNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("运行实例 {id} 不存在"),
                "RUN_NOT_FOUND",
            ),
            ApiError::Scheduler(SchedulerError::TaskInstanceNotFound { id }) => (
                StatusCode::NOT_FOUND,
                format!("任务实例 {id} 不存在"),
                "TASK_INSTANCE_NOT_FOUND",
            ),
            ApiError::Scheduler(SchedulerError::WorkflowNotFound { name }) => (
                StatusCode::NOT_FOUND,
                format!("工作流 {name} 不存在"),
                "WORKFLOW_NOT_FOUND",
            ),
            ApiError::Scheduler(SchedulerError::InvalidTransition { .. }) => (
                StatusCode::CONFLICT,
                self.to_string(),
                "INVALID_TRANSITION",
            ),
            ApiError::Scheduler(e) if e.is_transient() => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("依赖服务暂时不可用: {e}"),
                "SERVICE_UNAVAILABLE",
            ),
            ApiError::Scheduler(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("系统内部错误: {e}"),
                "INTERNAL_ERROR",
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "BAD_REQUEST"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, error_type) = self.parts();
        if status.is_server_error() {
            tracing::error!(error = %self, "API请求失败");
        }

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_mapping() {
        let response = ApiError::from(SchedulerError::RunNotFound { id: 7 }).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError::from(SchedulerError::WorkflowNotFound {
            name: "etl".to_string(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_transient_maps_to_unavailable() {
        let response =
            ApiError::from(SchedulerError::TransientInfra("locked".to_string())).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_bad_request() {
        let response = ApiError::BadRequest("无效的状态".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
