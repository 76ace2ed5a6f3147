use anyhow::Result;
use axum::{http::StatusCode, routing::get, Router};
use chrono::Utc;
use serde_json::json;

use orchestrator_core::{
    models::{FailureKind, TaskExecutionContext},
    traits::TaskExecutor,
};
use orchestrator_worker::HttpExecutor;

async fn serve() -> Result<String> {
    let app = Router::new()
        .route("/ok", get(|| async { "fetched" }))
        .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
        .route("/broken", get(|| async { StatusCode::SERVICE_UNAVAILABLE }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}"))
}

fn context(url: String) -> TaskExecutionContext {
    TaskExecutionContext {
        task_instance_id: 1,
        run_id: 1,
        workflow_name: "newsapi_crawler".to_string(),
        task_id: "fetch".to_string(),
        executor: "http".to_string(),
        params: json!({ "url": url }),
        logical_date: Utc::now(),
        attempt: 1,
        worker_id: "w1".to_string(),
    }
}

#[tokio::test]
async fn test_http_status_classification() -> Result<()> {
    let base = serve().await?;
    let executor = HttpExecutor::new();

    let ok = executor.execute_task(&context(format!("{base}/ok"))).await?;
    assert!(ok.success);
    assert_eq!(ok.output.as_deref(), Some("fetched"));
    assert_eq!(ok.exit_code, Some(200));

    let missing = executor
        .execute_task(&context(format!("{base}/missing")))
        .await?;
    assert!(!missing.success);
    assert_eq!(missing.failure_kind, Some(FailureKind::Fatal));
    assert_eq!(missing.exit_code, Some(404));

    let broken = executor
        .execute_task(&context(format!("{base}/broken")))
        .await?;
    assert_eq!(broken.failure_kind, Some(FailureKind::Retryable));
    Ok(())
}
