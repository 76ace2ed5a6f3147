#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;

use orchestrator_core::{
    config::{DispatcherConfig, SchedulerConfig},
    models::{
        ExecutionOutcome, ExecutionRequest, ExecutionStatus, FailureKind, RetryPolicy,
        StateTransition, TaskDefinition, TaskState, WorkflowDefinition,
    },
    traits::{ExecutorStrategy, MetadataStore},
    SchedulerError, SchedulerResult,
};
use orchestrator_dispatcher::SchedulerLoop;
use orchestrator_domain::failure_transition;
use orchestrator_infrastructure::{InMemoryMetadataStore, StaticDefinitionSource};

pub fn day(d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap()
}

pub fn task(id: &str, depends_on: &[&str]) -> TaskDefinition {
    TaskDefinition {
        id: id.to_string(),
        executor: "noop".to_string(),
        params: json!({}),
        retry: RetryPolicy::default(),
        depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
        depends_on_past: false,
        timeout_seconds: None,
    }
}

pub fn workflow(name: &str, tasks: Vec<TaskDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        name: name.to_string(),
        description: None,
        schedule: "@daily".to_string(),
        start_date: day(1),
        end_date: None,
        paused: Some(false),
        catchup: Some(false),
        max_active_tasks: None,
        tasks,
    }
}

/// 测试用执行策略的行为
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    /// 同步执行并成功
    Succeed,
    /// 同步执行并按给定类型失败
    Fail(FailureKind),
    /// 只登记，不执行，实例停留在 queued
    Submit,
    /// 交接失败
    Reject,
}

/// 记录所有调用的执行策略
pub struct RecordingStrategy {
    store: Arc<dyn MetadataStore>,
    mode: Mutex<Mode>,
    status: Mutex<ExecutionStatus>,
    executed: Mutex<Vec<ExecutionRequest>>,
    cancelled: Mutex<Vec<i64>>,
}

impl RecordingStrategy {
    pub fn new(store: Arc<dyn MetadataStore>, mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            store,
            mode: Mutex::new(mode),
            status: Mutex::new(ExecutionStatus::Unknown),
            executed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        })
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn set_status(&self, status: ExecutionStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn executed(&self) -> Vec<ExecutionRequest> {
        self.executed.lock().unwrap().clone()
    }

    pub fn executed_tasks(&self) -> Vec<String> {
        self.executed().into_iter().map(|r| r.task_id).collect()
    }

    pub fn cancelled(&self) -> Vec<i64> {
        self.cancelled.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExecutorStrategy for RecordingStrategy {
    fn name(&self) -> &str {
        "recording"
    }

    async fn execute(&self, request: ExecutionRequest) -> SchedulerResult<ExecutionOutcome> {
        let mode = self.mode.lock().unwrap().clone();
        if mode == Mode::Reject {
            return Err(SchedulerError::MessageQueue("broker unavailable".to_string()));
        }
        self.executed.lock().unwrap().push(request.clone());
        if mode == Mode::Submit {
            return Ok(ExecutionOutcome::Submitted);
        }

        let admission = StateTransition::to(TaskState::Running)
            .with_worker("inline")
            .bump_attempt();
        let Some(running) = self
            .store
            .cas_task_instance_state(request.task_instance_id, TaskState::Queued, &admission)
            .await?
        else {
            return Ok(ExecutionOutcome::Skipped);
        };

        match mode {
            Mode::Fail(kind) => {
                let transition =
                    failure_transition(&running, &request.retry, kind, "boom", Utc::now());
                self.store
                    .cas_task_instance_state(running.id, TaskState::Running, &transition)
                    .await?;
                Ok(ExecutionOutcome::Failed {
                    kind,
                    reason: "boom".to_string(),
                })
            }
            _ => {
                self.store
                    .cas_task_instance_state(
                        running.id,
                        TaskState::Running,
                        &StateTransition::to(TaskState::Succeeded),
                    )
                    .await?;
                Ok(ExecutionOutcome::Succeeded)
            }
        }
    }

    async fn status(&self, _task_instance_id: i64) -> SchedulerResult<ExecutionStatus> {
        Ok(*self.status.lock().unwrap())
    }

    async fn cancel(&self, task_instance_id: i64) -> SchedulerResult<()> {
        self.cancelled.lock().unwrap().push(task_instance_id);
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<dyn MetadataStore>,
    pub strategy: Arc<RecordingStrategy>,
    pub source: Arc<StaticDefinitionSource>,
    pub scheduler: SchedulerLoop,
}

pub fn scheduler_config() -> SchedulerConfig {
    SchedulerConfig {
        paused_on_creation: false,
        ..SchedulerConfig::default()
    }
}

pub fn harness(
    definitions: Vec<WorkflowDefinition>,
    mode: Mode,
    config: SchedulerConfig,
    dispatcher: DispatcherConfig,
) -> Harness {
    let store: Arc<dyn MetadataStore> = Arc::new(InMemoryMetadataStore::new());
    let strategy = RecordingStrategy::new(store.clone(), mode);
    let source = Arc::new(StaticDefinitionSource::new(definitions));
    let scheduler = SchedulerLoop::new(
        source.clone(),
        store.clone(),
        strategy.clone(),
        config,
        dispatcher,
    );
    Harness {
        store,
        strategy,
        source,
        scheduler,
    }
}

pub fn hours(h: i64) -> Duration {
    Duration::hours(h)
}
