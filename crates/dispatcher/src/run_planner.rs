use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, instrument};

use orchestrator_core::{
    config::SchedulerConfig,
    models::{NewRun, Run, TaskInstance},
    traits::MetadataStore,
    SchedulerResult,
};
use orchestrator_domain::WorkflowGraph;
use orchestrator_infrastructure::{MetricsCollector, StructuredLogger};

/// 按调度表达式和 catchup 策略创建运行实例
pub struct RunPlanner {
    store: Arc<dyn MetadataStore>,
    paused_on_creation: bool,
    catchup_by_default: bool,
    max_backfill_runs_per_cycle: usize,
    metrics: MetricsCollector,
}

impl RunPlanner {
    pub fn new(store: Arc<dyn MetadataStore>, config: &SchedulerConfig) -> Self {
        Self {
            store,
            paused_on_creation: config.paused_on_creation,
            catchup_by_default: config.catchup_by_default,
            max_backfill_runs_per_cycle: config.max_backfill_runs_per_cycle,
            metrics: MetricsCollector::new(),
        }
    }

    /// 为一个工作流创建到期的运行实例，返回本次新建的实例
    ///
    /// 暂停状态以存储中的记录为准，定义里的 `paused` 只在首次注册时生效。
    #[instrument(skip(self, graph), fields(workflow = graph.name()))]
    pub async fn plan(&self, graph: &WorkflowGraph, now: DateTime<Utc>) -> SchedulerResult<Vec<Run>> {
        let definition = graph.definition();
        let record = self
            .store
            .register_workflow(
                graph.name(),
                definition.paused.unwrap_or(self.paused_on_creation),
            )
            .await?;
        if record.paused {
            debug!("工作流 {} 已暂停，跳过", graph.name());
            return Ok(Vec::new());
        }

        let catchup = definition.catchup.unwrap_or(self.catchup_by_default);
        let last = self
            .store
            .latest_run(graph.name())
            .await?
            .map(|run| run.logical_date);
        let intervals =
            graph
                .schedule()
                .due_intervals(last, now, catchup, self.max_backfill_runs_per_cycle);

        let mut created = Vec::new();
        for interval in intervals {
            let creation = self
                .store
                .create_run(&NewRun {
                    workflow_name: graph.name().to_string(),
                    logical_date: interval.start,
                    data_interval_start: interval.start,
                    data_interval_end: interval.end,
                })
                .await?;
            self.ensure_instances(graph, &creation.run).await?;
            if creation.created {
                StructuredLogger::log_run_created(
                    creation.run.id,
                    graph.name(),
                    creation.run.logical_date,
                );
                created.push(creation.run);
            }
        }
        if !created.is_empty() {
            self.metrics.record_runs_created(graph.name(), created.len());
        }
        Ok(created)
    }

    /// 保证运行实例的每个任务都有任务实例，返回该运行实例的全部任务实例
    pub async fn ensure_instances(
        &self,
        graph: &WorkflowGraph,
        run: &Run,
    ) -> SchedulerResult<Vec<TaskInstance>> {
        let existing = self.store.list_task_instances(run.id).await?;
        let missing: Vec<_> = graph
            .tasks_in_order()
            .filter(|task| !existing.iter().any(|ti| ti.task_id == task.id))
            .collect();
        if missing.is_empty() {
            return Ok(existing);
        }
        for task in missing {
            self.store
                .create_or_get_task_instance(run, &task.id, task.retry.max_attempts)
                .await?;
        }
        self.store.list_task_instances(run.id).await
    }
}
