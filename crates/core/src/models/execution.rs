use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FailureKind, RetryPolicy};

/// 分发器交给执行策略的执行请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRequest {
    pub task_instance_id: i64,
    pub run_id: i64,
    pub workflow_name: String,
    pub task_id: String,
    pub executor: String,
    pub params: serde_json::Value,
    pub logical_date: DateTime<Utc>,
    pub timeout_seconds: Option<u64>,
    pub retry: RetryPolicy,
}

/// 执行策略的返回值
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// 同步执行并已写入 succeeded
    Succeeded,
    /// 同步执行失败，已按重试策略写入 pending 或 failed
    Failed { kind: FailureKind, reason: String },
    /// 已交给异步通道（本地池或远程队列），结果稍后写入存储
    Submitted,
    /// 执行准入 CAS 失败（已被其他执行者处理或已取消）
    Skipped,
}

/// 对账时查询的执行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    NotRunning,
    /// 无法得知（远程执行），以心跳判断
    Unknown,
}

/// 任务执行器拿到的上下文
#[derive(Debug, Clone)]
pub struct TaskExecutionContext {
    pub task_instance_id: i64,
    pub run_id: i64,
    pub workflow_name: String,
    pub task_id: String,
    pub executor: String,
    pub params: serde_json::Value,
    pub logical_date: DateTime<Utc>,
    pub attempt: u32,
    pub worker_id: String,
}

impl TaskExecutionContext {
    pub fn from_request(request: &ExecutionRequest, attempt: u32, worker_id: &str) -> Self {
        Self {
            task_instance_id: request.task_instance_id,
            run_id: request.run_id,
            workflow_name: request.workflow_name.clone(),
            task_id: request.task_id.clone(),
            executor: request.executor.clone(),
            params: request.params.clone(),
            logical_date: request.logical_date,
            attempt,
            worker_id: worker_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskResult {
    pub success: bool,
    pub output: Option<String>,
    pub error_message: Option<String>,
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
    /// 失败时的分类，成功时为 None
    pub failure_kind: Option<FailureKind>,
}

impl TaskResult {
    pub fn success(output: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            output: Some(output.into()),
            error_message: None,
            exit_code: Some(0),
            execution_time_ms,
            failure_kind: None,
        }
    }

    pub fn failure(
        kind: FailureKind,
        message: impl Into<String>,
        exit_code: Option<i32>,
        execution_time_ms: u64,
    ) -> Self {
        Self {
            success: false,
            output: None,
            error_message: Some(message.into()),
            exit_code,
            execution_time_ms,
            failure_kind: Some(kind),
        }
    }
}
