use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::routes::AppState;

/// 存储可读时返回 ok，否则返回 503
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let (status, store) = match state.store.list_workflows().await {
        Ok(_) => (StatusCode::OK, "ok".to_string()),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
    };

    let overall = if status.is_success() { "ok" } else { "degraded" };
    (
        status,
        Json(json!({
            "status": overall,
            "store": store,
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "service": "orchestrator",
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}
