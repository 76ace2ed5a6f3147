use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// 调度循环配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub cycle_interval_ms: u64,
    /// 同一个定义文件两次解析之间的最小间隔
    pub min_definition_reload_seconds: u64,
    /// 重新列出定义目录的间隔
    pub source_list_interval_seconds: u64,
    pub definitions_dir: String,
    pub paused_on_creation: bool,
    pub catchup_by_default: bool,
    /// 每个工作流每个周期最多创建的运行实例数
    pub max_backfill_runs_per_cycle: usize,
    pub run_evaluation_concurrency: usize,
    pub reconcile_interval_seconds: u64,
    pub queued_timeout_seconds: u64,
    /// 远程执行心跳超过该时间未刷新视为丢失
    pub running_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cycle_interval_ms: 1_000,
            min_definition_reload_seconds: 30,
            source_list_interval_seconds: 300,
            definitions_dir: "workflows".to_string(),
            paused_on_creation: true,
            catchup_by_default: false,
            max_backfill_runs_per_cycle: 1_000,
            run_evaluation_concurrency: 16,
            reconcile_interval_seconds: 60,
            queued_timeout_seconds: 600,
            running_timeout_seconds: 300,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.cycle_interval_ms == 0 {
            return Err(SchedulerError::FatalConfig(
                "scheduler.cycle_interval_ms 必须大于0".to_string(),
            ));
        }
        if self.max_backfill_runs_per_cycle == 0 {
            return Err(SchedulerError::FatalConfig(
                "scheduler.max_backfill_runs_per_cycle 必须大于0".to_string(),
            ));
        }
        if self.run_evaluation_concurrency == 0 {
            return Err(SchedulerError::FatalConfig(
                "scheduler.run_evaluation_concurrency 必须大于0".to_string(),
            ));
        }
        if self.reconcile_interval_seconds == 0
            || self.queued_timeout_seconds == 0
            || self.running_timeout_seconds == 0
        {
            return Err(SchedulerError::FatalConfig("对账相关超时必须大于0".to_string()));
        }
        if self.definitions_dir.is_empty() {
            return Err(SchedulerError::FatalConfig("定义目录不能为空".to_string()));
        }
        Ok(())
    }
}
