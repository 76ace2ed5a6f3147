use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, instrument, warn};

use orchestrator_core::{
    config::DispatcherConfig,
    models::{
        ExecutionOutcome, ExecutionRequest, StateTransition, TaskDefinition, TaskState,
    },
    traits::{ExecutorStrategy, MetadataStore},
    SchedulerResult,
};
use orchestrator_infrastructure::{MetricsCollector, StructuredLogger};

/// 一个可分发的任务实例
#[derive(Debug, Clone)]
pub struct DispatchCandidate {
    pub run_id: i64,
    pub logical_date: DateTime<Utc>,
    pub workflow_name: String,
    pub task_instance_id: i64,
    pub task: TaskDefinition,
    /// 任务在拓扑序中的位置
    pub position: usize,
    /// 工作流自身声明的单运行实例并发上限
    pub max_active_tasks: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub enqueued: Vec<i64>,
    pub deferred: Vec<i64>,
}

/// 在并发上限内把候选实例交给执行策略
///
/// 上限统计的是 queued + running：全局 `parallelism`，以及单个运行实例的
/// `max_active_tasks_per_workflow`（工作流声明了 `max_active_tasks` 时以其为准）。
/// 放不下的候选保持 pending，留给后续周期。
pub struct TaskDispatcher {
    store: Arc<dyn MetadataStore>,
    strategy: Arc<dyn ExecutorStrategy>,
    config: DispatcherConfig,
    metrics: MetricsCollector,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        strategy: Arc<dyn ExecutorStrategy>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            strategy,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn strategy(&self) -> &Arc<dyn ExecutorStrategy> {
        &self.strategy
    }

    #[instrument(skip_all, fields(candidates = candidates.len(), strategy = self.strategy.name()))]
    pub async fn dispatch(
        &self,
        mut candidates: Vec<DispatchCandidate>,
    ) -> SchedulerResult<DispatchReport> {
        let mut report = DispatchReport::default();
        if candidates.is_empty() {
            return Ok(report);
        }

        // 最早的运行实例优先，同一运行实例内按拓扑序
        candidates.sort_by(|a, b| {
            (a.logical_date, a.run_id, a.position).cmp(&(b.logical_date, b.run_id, b.position))
        });

        let mut global_active = self.store.count_active_task_instances(None).await?;
        let mut run_active: HashMap<i64, usize> = HashMap::new();

        for candidate in candidates {
            let run_limit = candidate
                .max_active_tasks
                .unwrap_or(self.config.max_active_tasks_per_workflow);
            let active_in_run = match run_active.get(&candidate.run_id) {
                Some(count) => *count,
                None => {
                    let count = self
                        .store
                        .count_active_task_instances(Some(candidate.run_id))
                        .await?;
                    run_active.insert(candidate.run_id, count);
                    count
                }
            };

            if global_active >= self.config.parallelism || active_in_run >= run_limit {
                debug!(
                    "并发已满，推迟任务实例 {} (全局 {}/{}, 运行实例 {}/{})",
                    candidate.task_instance_id,
                    global_active,
                    self.config.parallelism,
                    active_in_run,
                    run_limit
                );
                report.deferred.push(candidate.task_instance_id);
                continue;
            }

            let Some(queued) = self
                .store
                .cas_task_instance_state(
                    candidate.task_instance_id,
                    TaskState::Pending,
                    &StateTransition::to(TaskState::Queued),
                )
                .await?
            else {
                debug!("任务实例 {} 已不是 pending，跳过", candidate.task_instance_id);
                continue;
            };

            global_active += 1;
            *run_active.entry(candidate.run_id).or_insert(0) += 1;

            let request = ExecutionRequest {
                task_instance_id: queued.id,
                run_id: candidate.run_id,
                workflow_name: candidate.workflow_name.clone(),
                task_id: candidate.task.id.clone(),
                executor: candidate.task.executor.clone(),
                params: candidate.task.params.clone(),
                logical_date: candidate.logical_date,
                timeout_seconds: candidate.task.timeout_seconds,
                retry: candidate.task.retry.clone(),
            };

            match self.strategy.execute(request).await {
                Ok(outcome) => {
                    StructuredLogger::log_task_dispatched(
                        queued.id,
                        candidate.run_id,
                        &candidate.task.id,
                        &candidate.task.executor,
                    );
                    report.enqueued.push(queued.id);
                    // 同步策略返回时实例已不再占用并发
                    if !matches!(outcome, ExecutionOutcome::Submitted) {
                        global_active = global_active.saturating_sub(1);
                        if let Some(count) = run_active.get_mut(&candidate.run_id) {
                            *count = count.saturating_sub(1);
                        }
                    }
                }
                Err(e) => {
                    warn!("任务实例 {} 交接失败，回滚为 pending: {}", queued.id, e);
                    let rollback = StateTransition::to(TaskState::Pending)
                        .with_message(format!("交接失败: {e}"));
                    match self
                        .store
                        .cas_task_instance_state(queued.id, TaskState::Queued, &rollback)
                        .await
                    {
                        Ok(Some(_)) => {
                            global_active = global_active.saturating_sub(1);
                            if let Some(count) = run_active.get_mut(&candidate.run_id) {
                                *count = count.saturating_sub(1);
                            }
                        }
                        Ok(None) => debug!("任务实例 {} 状态已变化，无需回滚", queued.id),
                        Err(rollback_err) => {
                            error!("任务实例 {} 回滚失败: {}", queued.id, rollback_err)
                        }
                    }
                    report.deferred.push(queued.id);
                }
            }
        }

        self.metrics
            .record_dispatch(report.enqueued.len(), report.deferred.len());
        Ok(report)
    }
}
