//! 为元数据存储的每次调用加上超时
//!
//! 超时被映射为 `SchedulerError::Timeout`，属于瞬时错误，调用方可按瞬时错误重试。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;

use orchestrator_core::{
    models::{
        NewRun, Run, RunCreation, RunFilter, RunState, StateTransition, TaskInstance, TaskState,
        WorkflowRecord,
    },
    traits::MetadataStore,
    SchedulerError, SchedulerResult,
};

pub struct TimeoutMetadataStore {
    inner: Arc<dyn MetadataStore>,
    timeout: Duration,
}

impl TimeoutMetadataStore {
    pub fn new(inner: Arc<dyn MetadataStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn guarded<T, F>(&self, operation: &str, fut: F) -> SchedulerResult<T>
    where
        F: Future<Output = SchedulerResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                error!("存储操作超时: {} ({:?})", operation, self.timeout);
                Err(SchedulerError::Timeout {
                    operation: operation.to_string(),
                })
            }
        }
    }
}

#[async_trait]
impl MetadataStore for TimeoutMetadataStore {
    async fn register_workflow(&self, name: &str, paused: bool) -> SchedulerResult<WorkflowRecord> {
        self.guarded("register_workflow", self.inner.register_workflow(name, paused))
            .await
    }

    async fn set_workflow_paused(
        &self,
        name: &str,
        paused: bool,
    ) -> SchedulerResult<WorkflowRecord> {
        self.guarded("set_workflow_paused", self.inner.set_workflow_paused(name, paused))
            .await
    }

    async fn list_workflows(&self) -> SchedulerResult<Vec<WorkflowRecord>> {
        self.guarded("list_workflows", self.inner.list_workflows()).await
    }

    async fn create_run(&self, new_run: &NewRun) -> SchedulerResult<RunCreation> {
        self.guarded("create_run", self.inner.create_run(new_run)).await
    }

    async fn get_run(&self, id: i64) -> SchedulerResult<Option<Run>> {
        self.guarded("get_run", self.inner.get_run(id)).await
    }

    async fn latest_run(&self, workflow_name: &str) -> SchedulerResult<Option<Run>> {
        self.guarded("latest_run", self.inner.latest_run(workflow_name))
            .await
    }

    async fn previous_run(
        &self,
        workflow_name: &str,
        before: DateTime<Utc>,
    ) -> SchedulerResult<Option<Run>> {
        self.guarded("previous_run", self.inner.previous_run(workflow_name, before))
            .await
    }

    async fn list_active_runs(&self) -> SchedulerResult<Vec<Run>> {
        self.guarded("list_active_runs", self.inner.list_active_runs())
            .await
    }

    async fn list_runs(&self, filter: &RunFilter) -> SchedulerResult<Vec<Run>> {
        self.guarded("list_runs", self.inner.list_runs(filter)).await
    }

    async fn cas_run_state(
        &self,
        id: i64,
        expected: RunState,
        next: RunState,
    ) -> SchedulerResult<bool> {
        self.guarded("cas_run_state", self.inner.cas_run_state(id, expected, next))
            .await
    }

    async fn create_or_get_task_instance(
        &self,
        run: &Run,
        task_id: &str,
        max_attempts: u32,
    ) -> SchedulerResult<TaskInstance> {
        self.guarded(
            "create_or_get_task_instance",
            self.inner
                .create_or_get_task_instance(run, task_id, max_attempts),
        )
        .await
    }

    async fn get_task_instance(&self, id: i64) -> SchedulerResult<Option<TaskInstance>> {
        self.guarded("get_task_instance", self.inner.get_task_instance(id))
            .await
    }

    async fn cas_task_instance_state(
        &self,
        id: i64,
        expected: TaskState,
        transition: &StateTransition,
    ) -> SchedulerResult<Option<TaskInstance>> {
        self.guarded(
            "cas_task_instance_state",
            self.inner.cas_task_instance_state(id, expected, transition),
        )
        .await
    }

    async fn list_task_instances(&self, run_id: i64) -> SchedulerResult<Vec<TaskInstance>> {
        self.guarded("list_task_instances", self.inner.list_task_instances(run_id))
            .await
    }

    async fn list_task_instances_by_state(
        &self,
        state: TaskState,
    ) -> SchedulerResult<Vec<TaskInstance>> {
        self.guarded(
            "list_task_instances_by_state",
            self.inner.list_task_instances_by_state(state),
        )
        .await
    }

    async fn count_active_task_instances(&self, run_id: Option<i64>) -> SchedulerResult<usize> {
        self.guarded(
            "count_active_task_instances",
            self.inner.count_active_task_instances(run_id),
        )
        .await
    }

    async fn heartbeat_task_instance(
        &self,
        id: i64,
        worker_id: &str,
        attempt: u32,
    ) -> SchedulerResult<bool> {
        self.guarded(
            "heartbeat_task_instance",
            self.inner.heartbeat_task_instance(id, worker_id, attempt),
        )
        .await
    }
}
