use async_trait::async_trait;

use crate::{errors::DefinitionError, models::WorkflowDefinition, SchedulerResult};

/// 一次扫描的结果
///
/// `definitions` 是当前全部可用的定义；解析失败的文件记录在 `errors` 中，
/// 若该文件之前解析成功过，其上一个版本仍保留在 `definitions` 里。
#[derive(Debug, Clone, Default)]
pub struct DefinitionScan {
    pub definitions: Vec<WorkflowDefinition>,
    pub errors: Vec<DefinitionError>,
    /// 与上一次扫描相比是否有变化
    pub changed: bool,
}

/// 工作流定义来源
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// 扫描定义。单个文件解析失败不会中止扫描。
    async fn scan(&self) -> SchedulerResult<DefinitionScan>;
}
