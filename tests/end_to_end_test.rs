use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};

use orchestrator_core::{
    config::{AppConfig, DispatcherConfig, SchedulerConfig},
    models::{FailureKind, RunFilter, RunState, TaskExecutionContext, TaskResult, TaskState},
    traits::{DefinitionSource, ExecutorStrategy, MetadataStore, TaskExecutor},
    SchedulerResult,
};
use orchestrator_dispatcher::SchedulerLoop;
use orchestrator_domain::WorkflowGraph;
use orchestrator_infrastructure::{
    load_definitions_dir, FileDefinitionSource, InMemoryMetadataStore,
};
use orchestrator_worker::{InProcessStrategy, InstanceRunner, TaskExecutorRegistry};

/// 总是以可重试错误失败的执行器
struct FlakyExecutor {
    calls: AtomicU32,
}

#[async_trait]
impl TaskExecutor for FlakyExecutor {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn execute_task(&self, _context: &TaskExecutionContext) -> SchedulerResult<TaskResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(TaskResult::failure(
            FailureKind::Retryable,
            "connection reset",
            None,
            1,
        ))
    }

    async fn cancel(&self, _task_instance_id: i64) -> SchedulerResult<()> {
        Ok(())
    }

    async fn is_running(&self, _task_instance_id: i64) -> SchedulerResult<bool> {
        Ok(false)
    }
}

struct Pipeline {
    store: Arc<dyn MetadataStore>,
    scheduler: SchedulerLoop,
    flaky: Arc<FlakyExecutor>,
}

fn pipeline(dir: &Path) -> Pipeline {
    let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    let flaky = Arc::new(FlakyExecutor {
        calls: AtomicU32::new(0),
    });

    let mut executors = TaskExecutorRegistry::with_defaults();
    executors.register(flaky.clone());
    let config = AppConfig::default();
    let runner = Arc::new(InstanceRunner::new(
        store.clone(),
        Arc::new(executors),
        &config.worker,
        config.retry.clone(),
    ));
    let strategy: Arc<dyn ExecutorStrategy> = Arc::new(InProcessStrategy::new(runner));

    let scheduler_config = SchedulerConfig {
        definitions_dir: dir.display().to_string(),
        min_definition_reload_seconds: 0,
        source_list_interval_seconds: 0,
        ..SchedulerConfig::default()
    };
    let source: Arc<dyn DefinitionSource> =
        Arc::new(FileDefinitionSource::from_config(&scheduler_config));
    let scheduler = SchedulerLoop::new(
        source,
        store.clone(),
        strategy,
        scheduler_config,
        DispatcherConfig::default(),
    );

    Pipeline {
        store,
        scheduler,
        flaky,
    }
}

/// 开始日期在三天前，保证至少有一个完整区间
fn start_date() -> String {
    (Utc::now() - Duration::days(3)).format("%Y-%m-%dT00:00:00Z").to_string()
}

#[tokio::test]
async fn test_definition_file_to_successful_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("etl.toml"),
        format!(
            r#"
            name = "etl"
            schedule = "@daily"
            start_date = "{}"
            paused = false

            [[tasks]]
            id = "extract"
            executor = "shell"
            params = {{ command = "echo extracted" }}

            [[tasks]]
            id = "load"
            executor = "noop"
            depends_on = ["extract"]
            "#,
            start_date()
        ),
    )?;
    let p = pipeline(dir.path());

    let mut finished = Vec::new();
    for _ in 0..5 {
        finished.extend(p.scheduler.run_cycle(Utc::now()).await?.runs_finished);
    }

    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].1, RunState::Success);
    let instances = p.store.list_task_instances(finished[0].0).await?;
    assert_eq!(instances.len(), 2);
    for ti in &instances {
        assert_eq!(ti.state, TaskState::Succeeded);
        assert_eq!(ti.attempt, 1);
    }
    let extract = instances.iter().find(|t| t.task_id == "extract").unwrap();
    let load = instances.iter().find(|t| t.task_id == "load").unwrap();
    assert!(extract.ended_at.unwrap() <= load.started_at.unwrap());
    Ok(())
}

#[tokio::test]
async fn test_transient_failures_exhaust_attempts() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("flaky.toml"),
        format!(
            r#"
            name = "flaky"
            schedule = "@daily"
            start_date = "{}"
            paused = false

            [[tasks]]
            id = "fetch"
            executor = "flaky"
            [tasks.retry]
            max_attempts = 3
            backoff_seconds = 0

            [[tasks]]
            id = "store"
            executor = "noop"
            depends_on = ["fetch"]
            "#,
            start_date()
        ),
    )?;
    let p = pipeline(dir.path());

    let mut finished = Vec::new();
    for _ in 0..8 {
        finished.extend(p.scheduler.run_cycle(Utc::now()).await?.runs_finished);
    }

    assert_eq!(p.flaky.calls.load(Ordering::SeqCst), 3);
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].1, RunState::Failed);

    let instances = p.store.list_task_instances(finished[0].0).await?;
    let fetch = instances.iter().find(|t| t.task_id == "fetch").unwrap();
    assert_eq!(fetch.state, TaskState::Failed);
    assert_eq!(fetch.attempt, 3);
    assert_eq!(fetch.error_message.as_deref(), Some("connection reset"));
    let store = instances.iter().find(|t| t.task_id == "store").unwrap();
    assert_eq!(store.state, TaskState::UpstreamFailed);
    Ok(())
}

#[tokio::test]
async fn test_paused_by_default_until_unpaused() -> Result<()> {
    let dir = tempfile::tempdir()?;
    std::fs::write(
        dir.path().join("quiet.json"),
        format!(
            r#"{{
                "name": "quiet",
                "schedule": "every 1d",
                "start_date": "{}",
                "tasks": [{{ "id": "a", "executor": "noop" }}]
            }}"#,
            start_date()
        ),
    )?;
    let p = pipeline(dir.path());

    let report = p.scheduler.run_cycle(Utc::now()).await?;
    assert_eq!(report.runs_created, 0);
    assert!(p.store.list_workflows().await?[0].paused);

    p.store.set_workflow_paused("quiet", false).await?;
    let report = p.scheduler.run_cycle(Utc::now()).await?;
    assert_eq!(report.runs_created, 1);
    assert_eq!(p.store.list_runs(&RunFilter::default()).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_bundled_config_and_definitions_are_valid() -> Result<()> {
    let config = AppConfig::load(Some("config/orchestrator.toml"))?;
    assert_eq!(config.scheduler.definitions_dir, "workflows");

    let scan = load_definitions_dir(Path::new(&config.scheduler.definitions_dir)).await?;
    assert!(scan.errors.is_empty());
    let (graphs, errors) = WorkflowGraph::load_all(scan.definitions);
    assert!(errors.is_empty());
    assert!(graphs.iter().any(|g| g.name() == "newsapi_crawler"));
    Ok(())
}
