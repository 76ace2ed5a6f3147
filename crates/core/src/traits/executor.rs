use async_trait::async_trait;

use crate::{
    models::{ExecutionOutcome, ExecutionRequest, ExecutionStatus},
    SchedulerResult,
};

/// 执行策略
///
/// 分发器在 pending→queued 成功后调用 `execute`。返回错误表示交接失败，
/// 分发器会把实例回滚为 pending。
#[async_trait]
pub trait ExecutorStrategy: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, request: ExecutionRequest) -> SchedulerResult<ExecutionOutcome>;

    /// 对账时查询执行是否仍在进行
    async fn status(&self, task_instance_id: i64) -> SchedulerResult<ExecutionStatus>;

    /// 协作式取消
    async fn cancel(&self, task_instance_id: i64) -> SchedulerResult<()>;
}
