//! 任务执行器接口定义
//!
//! 任务执行器负责真正执行任务定义中引用的可执行体（shell 命令、HTTP 调用等），
//! 由执行器注册表按 `executor` 类型查找。核心对 `params` 不做解释。
//!
//! ## 失败分类
//!
//! 执行器返回的 `TaskResult::failure_kind` 决定是否进入重试：
//! - `Fatal`：参数无效、HTTP 4xx、`params.fatal_exit_codes` 中的退出码
//! - `Retryable`：其余非零退出码、超时、HTTP 5xx、网络错误
//!
//! 直接返回 `Err` 时按 [`crate::SchedulerError::failure_kind`] 分类。

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    models::{TaskExecutionContext, TaskResult},
    SchedulerResult,
};

#[async_trait]
pub trait TaskExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn supports_executor(&self, executor: &str) -> bool {
        executor == self.name()
    }

    async fn execute_task(&self, context: &TaskExecutionContext) -> SchedulerResult<TaskResult>;

    async fn cancel(&self, task_instance_id: i64) -> SchedulerResult<()>;

    async fn is_running(&self, task_instance_id: i64) -> SchedulerResult<bool>;
}

/// 按执行器类型查找执行器
pub trait ExecutorRegistry: Send + Sync {
    fn get(&self, executor: &str) -> Option<Arc<dyn TaskExecutor>>;

    fn kinds(&self) -> Vec<String>;
}
