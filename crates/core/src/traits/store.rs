//! 元数据存储接口
//!
//! 存储是 Run 与 TaskInstance 的唯一持有者。所有状态变更都通过
//! 针对单个实例的比较并交换（CAS）完成，不存在全局锁：
//!
//! ```text
//! cas_task_instance_state(id, expected, transition)
//!   当前状态 == expected  → 写入 transition，返回 Some(新实例)
//!   当前状态 != expected  → 不写入，返回 None
//! ```
//!
//! 实现必须保证：
//! - `(workflow_name, logical_date)` 上最多一个 Run
//! - `(run_id, task_id)` 上最多一个 TaskInstance
//! - 并发 CAS 中对同一实例、同一期望状态最多一个成功

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{
        NewRun, Run, RunCreation, RunFilter, RunState, StateTransition, TaskInstance,
        TaskState, WorkflowRecord,
    },
    SchedulerResult,
};

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// 登记工作流，已存在时返回现有记录（不修改暂停状态）
    async fn register_workflow(&self, name: &str, paused: bool) -> SchedulerResult<WorkflowRecord>;

    /// 设置暂停状态，工作流不存在时返回 `WorkflowNotFound`
    async fn set_workflow_paused(&self, name: &str, paused: bool)
        -> SchedulerResult<WorkflowRecord>;

    async fn list_workflows(&self) -> SchedulerResult<Vec<WorkflowRecord>>;

    /// 幂等创建运行实例
    async fn create_run(&self, new_run: &NewRun) -> SchedulerResult<RunCreation>;

    async fn get_run(&self, id: i64) -> SchedulerResult<Option<Run>>;

    /// 逻辑日期最大的运行实例
    async fn latest_run(&self, workflow_name: &str) -> SchedulerResult<Option<Run>>;

    /// 逻辑日期严格早于 `before` 的最近一个运行实例
    async fn previous_run(
        &self,
        workflow_name: &str,
        before: DateTime<Utc>,
    ) -> SchedulerResult<Option<Run>>;

    /// 所有 running 状态的运行实例，按 (logical_date, id) 排序
    async fn list_active_runs(&self) -> SchedulerResult<Vec<Run>>;

    /// 按过滤条件列出运行实例，最新的在前
    async fn list_runs(&self, filter: &RunFilter) -> SchedulerResult<Vec<Run>>;

    /// 运行实例状态 CAS，返回是否写入
    async fn cas_run_state(
        &self,
        id: i64,
        expected: RunState,
        next: RunState,
    ) -> SchedulerResult<bool>;

    /// 幂等创建任务实例，初始状态为 pending
    async fn create_or_get_task_instance(
        &self,
        run: &Run,
        task_id: &str,
        max_attempts: u32,
    ) -> SchedulerResult<TaskInstance>;

    async fn get_task_instance(&self, id: i64) -> SchedulerResult<Option<TaskInstance>>;

    /// 任务实例状态 CAS
    ///
    /// 非法转换返回 `InvalidTransition`，实例不存在返回 `TaskInstanceNotFound`，
    /// 当前状态与 `expected` 不符时返回 `Ok(None)`。
    async fn cas_task_instance_state(
        &self,
        id: i64,
        expected: TaskState,
        transition: &StateTransition,
    ) -> SchedulerResult<Option<TaskInstance>>;

    /// 某个运行实例的全部任务实例，按 id 排序
    async fn list_task_instances(&self, run_id: i64) -> SchedulerResult<Vec<TaskInstance>>;

    async fn list_task_instances_by_state(
        &self,
        state: TaskState,
    ) -> SchedulerResult<Vec<TaskInstance>>;

    /// queued + running 数量；`run_id` 为 None 时统计全局
    async fn count_active_task_instances(&self, run_id: Option<i64>) -> SchedulerResult<usize>;

    /// 刷新心跳。实例已不再由该 worker 的这次尝试运行时返回 false
    async fn heartbeat_task_instance(
        &self,
        id: i64,
        worker_id: &str,
        attempt: u32,
    ) -> SchedulerResult<bool>;
}
