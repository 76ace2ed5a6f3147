#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::json;

use orchestrator_core::{
    config::WorkerConfig,
    models::{
        ExecutionRequest, FailureKind, NewRun, RetryPolicy, StateTransition, TaskExecutionContext,
        TaskInstance, TaskResult, TaskState,
    },
    traits::{MetadataStore, TaskExecutor},
    RetryConfig, SchedulerResult,
};
use orchestrator_infrastructure::InMemoryMetadataStore;
use orchestrator_worker::{InstanceRunner, TaskExecutorRegistry};

/// 总是按给定结果返回并计数的执行器
pub struct CountingExecutor {
    pub calls: AtomicU32,
    failure: Option<FailureKind>,
}

impl CountingExecutor {
    pub fn new(failure: Option<FailureKind>) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            failure,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskExecutor for CountingExecutor {
    fn name(&self) -> &str {
        "counting"
    }

    async fn execute_task(&self, _context: &TaskExecutionContext) -> SchedulerResult<TaskResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(match self.failure {
            Some(kind) => TaskResult::failure(kind, "exit 1", Some(1), 1),
            None => TaskResult::success("ok", 1),
        })
    }

    async fn cancel(&self, _task_instance_id: i64) -> SchedulerResult<()> {
        Ok(())
    }

    async fn is_running(&self, _task_instance_id: i64) -> SchedulerResult<bool> {
        Ok(false)
    }
}

pub fn worker_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: "test-worker".to_string(),
        heartbeat_interval_seconds: 1,
        poll_timeout_ms: 50,
        ..WorkerConfig::default()
    }
}

pub fn fast_retry() -> RetryConfig {
    RetryConfig {
        max_attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 2,
        backoff_multiplier: 2.0,
        jitter_factor: 0.0,
    }
}

pub fn runner_with(
    store: Arc<dyn MetadataStore>,
    extra: Option<Arc<dyn TaskExecutor>>,
) -> Arc<InstanceRunner> {
    let mut registry = TaskExecutorRegistry::with_defaults();
    if let Some(executor) = extra {
        registry.register(executor);
    }
    Arc::new(InstanceRunner::new(
        store,
        Arc::new(registry),
        &worker_config(),
        fast_retry(),
    ))
}

pub fn memory_store() -> Arc<dyn MetadataStore> {
    Arc::new(InMemoryMetadataStore::new())
}

/// 创建一个 queued 状态的实例，并返回对应的执行请求
pub async fn queued_request(
    store: &Arc<dyn MetadataStore>,
    task_id: &str,
    executor: &str,
    params: serde_json::Value,
    max_attempts: u32,
) -> SchedulerResult<(TaskInstance, ExecutionRequest)> {
    let logical_date = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    let run = store
        .create_run(&NewRun {
            workflow_name: "etl".to_string(),
            logical_date,
            data_interval_start: logical_date,
            data_interval_end: logical_date + chrono::Duration::days(1),
        })
        .await?
        .run;
    let instance = store
        .create_or_get_task_instance(&run, task_id, max_attempts)
        .await?;
    let queued = store
        .cas_task_instance_state(
            instance.id,
            TaskState::Pending,
            &StateTransition::to(TaskState::Queued),
        )
        .await?
        .unwrap();
    let request = ExecutionRequest {
        task_instance_id: queued.id,
        run_id: run.id,
        workflow_name: run.workflow_name.clone(),
        task_id: task_id.to_string(),
        executor: executor.to_string(),
        params,
        logical_date,
        timeout_seconds: None,
        retry: RetryPolicy {
            max_attempts,
            backoff_seconds: 0,
            ..RetryPolicy::default()
        },
    };
    Ok((queued, request))
}

pub fn noop_params(sleep_ms: u64) -> serde_json::Value {
    json!({ "sleep_ms": sleep_ms })
}
