use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 工作流声明
///
/// 由定义源（目录中的 TOML/JSON 文件）提供，加载时校验为 DAG。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// cron 表达式、`@daily` 等预设、`@once` 或 `every 1d`
    pub schedule: String,
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    /// 未声明时使用 `scheduler.paused_on_creation`
    #[serde(default)]
    pub paused: Option<bool>,
    /// 未声明时使用 `scheduler.catchup_by_default`
    #[serde(default)]
    pub catchup: Option<bool>,
    /// 覆盖单个运行实例内的并发上限
    #[serde(default)]
    pub max_active_tasks: Option<usize>,
    pub tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDefinition {
    pub id: String,
    /// 执行器类型，例如 `shell`、`http`、`noop`
    pub executor: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub depends_on_past: bool,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    /// 总执行次数上限（含首次）
    pub max_attempts: u32,
    pub backoff_seconds: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_seconds: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff_seconds: 300,
            backoff_multiplier: 2.0,
            max_backoff_seconds: 3600,
        }
    }
}

/// 存储中登记的工作流，暂停状态以存储为准
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRecord {
    pub name: String,
    pub paused: bool,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
