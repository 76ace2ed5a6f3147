use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{TimeZone, Utc};
use serde_json::Value;
use tower::ServiceExt;

use orchestrator_api::create_app;
use orchestrator_core::{
    config::ApiConfig,
    models::{
        ExecutionOutcome, ExecutionRequest, ExecutionStatus, NewRun, RetryPolicy, RunState,
        StateTransition, TaskDefinition, TaskState, WorkflowDefinition,
    },
    traits::{DefinitionScan, ExecutorStrategy, MetadataStore},
    SchedulerResult,
};
use orchestrator_dispatcher::{RunController, WorkflowRegistry};
use orchestrator_infrastructure::InMemoryMetadataStore;

/// 接受一切请求的执行策略
struct IdleStrategy;

#[async_trait]
impl ExecutorStrategy for IdleStrategy {
    fn name(&self) -> &str {
        "idle"
    }

    async fn execute(&self, _request: ExecutionRequest) -> SchedulerResult<ExecutionOutcome> {
        Ok(ExecutionOutcome::Submitted)
    }

    async fn status(&self, _task_instance_id: i64) -> SchedulerResult<ExecutionStatus> {
        Ok(ExecutionStatus::NotRunning)
    }

    async fn cancel(&self, _task_instance_id: i64) -> SchedulerResult<()> {
        Ok(())
    }
}

struct TestApp {
    store: Arc<dyn MetadataStore>,
    router: Router,
}

async fn test_app() -> TestApp {
    let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    let controller = Arc::new(RunController::new(store.clone(), Arc::new(IdleStrategy)));
    let registry = Arc::new(WorkflowRegistry::new());
    registry
        .apply_scan(DefinitionScan {
            definitions: vec![WorkflowDefinition {
                name: "newsapi_crawler".to_string(),
                description: None,
                schedule: "@daily".to_string(),
                start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                end_date: None,
                paused: None,
                catchup: None,
                max_active_tasks: None,
                tasks: vec![TaskDefinition {
                    id: "crawl".to_string(),
                    executor: "noop".to_string(),
                    params: serde_json::json!({}),
                    retry: RetryPolicy::default(),
                    depends_on: vec![],
                    depends_on_past: false,
                    timeout_seconds: None,
                }],
            }],
            errors: vec![],
            changed: true,
        })
        .await;

    let router = create_app(store.clone(), controller, registry, &ApiConfig::default());
    TestApp { store, router }
}

async fn call(router: &Router, method: &str, uri: &str) -> Result<(StatusCode, Value)> {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())?,
        )
        .await?;
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&bytes)?))
}

async fn seed_run(store: &Arc<dyn MetadataStore>, day: u32) -> Result<i64> {
    let logical_date = Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap();
    let run = store
        .create_run(&NewRun {
            workflow_name: "newsapi_crawler".to_string(),
            logical_date,
            data_interval_start: logical_date,
            data_interval_end: logical_date + chrono::Duration::days(1),
        })
        .await?
        .run;
    Ok(run.id)
}

#[tokio::test]
async fn test_health_check() -> Result<()> {
    let app = test_app().await;
    let (status, body) = call(&app.router, "GET", "/health").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn test_list_runs_filters_by_state() -> Result<()> {
    let app = test_app().await;
    let first = seed_run(&app.store, 1).await?;
    seed_run(&app.store, 2).await?;
    app.store
        .cas_run_state(first, RunState::Running, RunState::Failed)
        .await?;

    let (status, body) = call(&app.router, "GET", "/api/runs").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (_, body) = call(&app.router, "GET", "/api/runs?state=failed").await?;
    let runs = body["data"].as_array().unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0]["id"], first);

    let (status, _) = call(&app.router, "GET", "/api/runs?state=exploded").await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn test_get_run_includes_failure_reasons() -> Result<()> {
    let app = test_app().await;
    let run_id = seed_run(&app.store, 1).await?;
    let run = app.store.get_run(run_id).await?.unwrap();
    let ti = app.store.create_or_get_task_instance(&run, "crawl", 1).await?;
    app.store
        .cas_task_instance_state(ti.id, TaskState::Pending, &StateTransition::to(TaskState::Queued))
        .await?;
    app.store
        .cas_task_instance_state(ti.id, TaskState::Queued, &StateTransition::to(TaskState::Running))
        .await?;
    app.store
        .cas_task_instance_state(
            ti.id,
            TaskState::Running,
            &StateTransition::to(TaskState::Failed).with_message("exit status 2"),
        )
        .await?;

    let (status, body) = call(&app.router, "GET", &format!("/api/runs/{run_id}")).await?;
    assert_eq!(status, StatusCode::OK);
    let tasks = body["data"]["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["state"], "failed");
    assert_eq!(tasks[0]["error_message"], "exit status 2");
    Ok(())
}

#[tokio::test]
async fn test_unknown_run_is_not_found() -> Result<()> {
    let app = test_app().await;
    let (status, body) = call(&app.router, "GET", "/api/runs/404").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "RUN_NOT_FOUND");

    let (status, _) = call(&app.router, "POST", "/api/runs/404/cancel").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn test_cancel_run() -> Result<()> {
    let app = test_app().await;
    let run_id = seed_run(&app.store, 1).await?;
    let run = app.store.get_run(run_id).await?.unwrap();
    app.store.create_or_get_task_instance(&run, "crawl", 1).await?;

    let (status, body) = call(&app.router, "POST", &format!("/api/runs/{run_id}/cancel")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["already_finished"], false);
    assert_eq!(body["data"]["cancelled_instances"].as_array().unwrap().len(), 1);

    let (_, body) = call(&app.router, "POST", &format!("/api/runs/{run_id}/cancel")).await?;
    assert_eq!(body["data"]["already_finished"], true);
    Ok(())
}

#[tokio::test]
async fn test_pause_and_unpause_workflow() -> Result<()> {
    let app = test_app().await;
    let (status, _) = call(&app.router, "POST", "/api/workflows/newsapi_crawler/pause").await?;
    assert_eq!(status, StatusCode::NOT_FOUND);

    app.store.register_workflow("newsapi_crawler", false).await?;
    let (status, body) = call(&app.router, "POST", "/api/workflows/newsapi_crawler/pause").await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["paused"], true);

    let (_, body) = call(&app.router, "GET", "/api/workflows").await?;
    let workflows = body["data"].as_array().unwrap();
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0]["paused"], true);
    assert_eq!(workflows[0]["schedule"], "@daily");
    assert_eq!(workflows[0]["tasks"][0], "crawl");

    let (_, body) = call(&app.router, "POST", "/api/workflows/newsapi_crawler/unpause").await?;
    assert_eq!(body["data"]["paused"], false);
    Ok(())
}
