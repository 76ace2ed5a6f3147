use thiserror::Error;

use crate::models::{FailureKind, TaskState};

/// 工作流定义错误
///
/// 只影响单个工作流：加载时被拒绝的定义不会波及其他工作流。
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("定义文件解析失败 {origin}: {message}")]
    Parse { origin: String, message: String },

    #[error("工作流名称不能为空")]
    EmptyName,

    #[error("工作流 {workflow} 没有任何任务")]
    NoTasks { workflow: String },

    #[error("工作流 {workflow} 中任务ID重复: {task}")]
    DuplicateTask { workflow: String, task: String },

    #[error("工作流 {workflow} 的任务 {task} 依赖不存在的任务 {missing}")]
    DanglingDependency {
        workflow: String,
        task: String,
        missing: String,
    },

    #[error("工作流 {workflow} 的任务 {task} 依赖自身")]
    SelfDependency { workflow: String, task: String },

    #[error("工作流 {workflow} 检测到循环依赖: {tasks:?}")]
    Cycle { workflow: String, tasks: Vec<String> },

    #[error("工作流 {workflow} 的调度表达式无效 '{expr}': {message}")]
    InvalidSchedule {
        workflow: String,
        expr: String,
        message: String,
    },

    #[error("工作流 {workflow} 定义无效: {message}")]
    Invalid { workflow: String, message: String },

    #[error("工作流名称重复: {workflow}")]
    DuplicateWorkflow { workflow: String },
}

impl DefinitionError {
    /// 出错的工作流名称（解析阶段无法得知时返回来源）
    pub fn workflow(&self) -> &str {
        match self {
            DefinitionError::Parse { origin, .. } => origin,
            DefinitionError::EmptyName => "",
            DefinitionError::NoTasks { workflow }
            | DefinitionError::DuplicateTask { workflow, .. }
            | DefinitionError::DanglingDependency { workflow, .. }
            | DefinitionError::SelfDependency { workflow, .. }
            | DefinitionError::Cycle { workflow, .. }
            | DefinitionError::InvalidSchedule { workflow, .. }
            | DefinitionError::Invalid { workflow, .. }
            | DefinitionError::DuplicateWorkflow { workflow } => workflow,
        }
    }
}

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("基础设施暂时不可用: {0}")]
    TransientInfra(String),

    #[error("操作超时: {operation}")]
    Timeout { operation: String },

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("工作流定义错误: {0}")]
    Definition(#[from] DefinitionError),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("无效的任务参数: {0}")]
    InvalidTaskParams(String),

    #[error("配置错误: {0}")]
    FatalConfig(String),

    #[error("运行实例未找到: {id}")]
    RunNotFound { id: i64 },

    #[error("任务实例未找到: {id}")]
    TaskInstanceNotFound { id: i64 },

    #[error("工作流未找到: {name}")]
    WorkflowNotFound { name: String },

    #[error("非法的状态转换: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 是否为可重试的基础设施错误
    pub fn is_transient(&self) -> bool {
        match self {
            SchedulerError::Database(e) => !matches!(
                e,
                sqlx::Error::RowNotFound
                    | sqlx::Error::ColumnNotFound(_)
                    | sqlx::Error::ColumnDecode { .. }
                    | sqlx::Error::TypeNotFound { .. }
                    | sqlx::Error::Configuration(_)
            ),
            SchedulerError::TransientInfra(_)
            | SchedulerError::Timeout { .. }
            | SchedulerError::MessageQueue(_) => true,
            _ => false,
        }
    }

    /// 任务执行失败时的分类
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            SchedulerError::InvalidTaskParams(_)
            | SchedulerError::Definition(_)
            | SchedulerError::FatalConfig(_)
            | SchedulerError::Serialization(_) => FailureKind::Fatal,
            _ => FailureKind::Retryable,
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Serialization(e.to_string())
    }
}
