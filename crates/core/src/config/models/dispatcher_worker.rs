use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStrategyKind {
    InProcess,
    #[default]
    LocalPool,
    RemoteQueue,
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 全局 queued + running 上限
    pub parallelism: usize,
    /// 单个运行实例内的 queued + running 上限
    pub max_active_tasks_per_workflow: usize,
    pub executor_strategy: ExecutorStrategyKind,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            parallelism: 32,
            max_active_tasks_per_workflow: 16,
            executor_strategy: ExecutorStrategyKind::LocalPool,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.parallelism == 0 {
            return Err(SchedulerError::FatalConfig(
                "dispatcher.parallelism 必须大于0".to_string(),
            ));
        }
        if self.max_active_tasks_per_workflow == 0 {
            return Err(SchedulerError::FatalConfig(
                "dispatcher.max_active_tasks_per_workflow 必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub enabled: bool,
    pub worker_id: String,
    pub max_concurrent_tasks: usize,
    pub poll_timeout_ms: u64,
    pub heartbeat_interval_seconds: u64,
    /// 任务未声明 timeout_seconds 时使用
    pub default_task_timeout_seconds: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: "worker-001".to_string(),
            max_concurrent_tasks: 5,
            poll_timeout_ms: 1_000,
            heartbeat_interval_seconds: 15,
            default_task_timeout_seconds: 3_600,
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.worker_id.is_empty() {
            return Err(SchedulerError::FatalConfig("Worker ID不能为空".to_string()));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(SchedulerError::FatalConfig("最大并发任务数必须大于0".to_string()));
        }
        if self.poll_timeout_ms == 0 {
            return Err(SchedulerError::FatalConfig(
                "worker.poll_timeout_ms 必须大于0".to_string(),
            ));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(SchedulerError::FatalConfig("心跳间隔必须大于0".to_string()));
        }
        if self.default_task_timeout_seconds == 0 {
            return Err(SchedulerError::FatalConfig("任务默认超时必须大于0".to_string()));
        }
        Ok(())
    }
}
