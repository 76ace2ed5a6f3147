use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use orchestrator_core::{
    models::{RunState, StateTransition, TaskState, WorkflowRecord},
    traits::{ExecutorStrategy, MetadataStore},
    SchedulerError, SchedulerResult,
};
use orchestrator_infrastructure::StructuredLogger;

/// 单个实例被并发修改时重读的次数
const CANCEL_REREAD_LIMIT: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CancelOutcome {
    pub run_id: i64,
    /// 运行实例在取消前已经结束
    pub already_finished: bool,
    pub cancelled_instances: Vec<i64>,
}

/// 运行实例与工作流的外部控制操作
pub struct RunController {
    store: Arc<dyn MetadataStore>,
    strategy: Arc<dyn ExecutorStrategy>,
}

impl RunController {
    pub fn new(store: Arc<dyn MetadataStore>, strategy: Arc<dyn ExecutorStrategy>) -> Self {
        Self { store, strategy }
    }

    /// 取消运行实例及其所有未结束的任务实例
    ///
    /// queued/running 的实例会通知执行策略；远程 worker 在下一次心跳时发现取消。
    #[instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: i64) -> SchedulerResult<CancelOutcome> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or(SchedulerError::RunNotFound { id: run_id })?;

        if run.state.is_terminal()
            || !self
                .store
                .cas_run_state(run_id, RunState::Running, RunState::Cancelled)
                .await?
        {
            info!("运行实例 {} 已结束，无需取消", run_id);
            return Ok(CancelOutcome {
                run_id,
                already_finished: true,
                cancelled_instances: Vec::new(),
            });
        }

        let mut cancelled = Vec::new();
        for instance in self.store.list_task_instances(run_id).await? {
            let mut current = instance;
            for _ in 0..CANCEL_REREAD_LIMIT {
                if current.state.is_terminal() {
                    break;
                }
                let transition =
                    StateTransition::to(TaskState::Cancelled).with_message("运行实例已取消");
                if self
                    .store
                    .cas_task_instance_state(current.id, current.state, &transition)
                    .await?
                    .is_some()
                {
                    StructuredLogger::log_task_state_change(
                        current.id,
                        &current.task_id,
                        current.state,
                        TaskState::Cancelled,
                        Some("运行实例已取消"),
                    );
                    if current.state.is_active() {
                        if let Err(e) = self.strategy.cancel(current.id).await {
                            warn!("通知执行策略取消任务实例 {} 失败: {}", current.id, e);
                        }
                    }
                    cancelled.push(current.id);
                    break;
                }
                match self.store.get_task_instance(current.id).await? {
                    Some(latest) => current = latest,
                    None => break,
                }
            }
        }

        info!(
            "运行实例 {} 已取消，{} 个任务实例被取消",
            run_id,
            cancelled.len()
        );
        Ok(CancelOutcome {
            run_id,
            already_finished: false,
            cancelled_instances: cancelled,
        })
    }

    pub async fn pause_workflow(&self, name: &str) -> SchedulerResult<WorkflowRecord> {
        let record = self.store.set_workflow_paused(name, true).await?;
        info!("工作流 {} 已暂停", name);
        Ok(record)
    }

    pub async fn unpause_workflow(&self, name: &str) -> SchedulerResult<WorkflowRecord> {
        let record = self.store.set_workflow_paused(name, false).await?;
        info!("工作流 {} 已恢复", name);
        Ok(record)
    }
}
