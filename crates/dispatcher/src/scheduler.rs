use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn, Instrument};

use orchestrator_core::{
    config::{DispatcherConfig, SchedulerConfig},
    models::{Run, RunState, StateTransition, TaskInstance, TaskState},
    traits::{DefinitionSource, ExecutorStrategy, MetadataStore},
    SchedulerResult,
};
use orchestrator_domain::{run_outcome, WorkflowGraph};
use orchestrator_infrastructure::{MetricsCollector, StructuredLogger, TaskTracer};

use crate::dispatcher::{DispatchCandidate, TaskDispatcher};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::registry::WorkflowRegistry;
use crate::run_planner::RunPlanner;

/// 一个调度周期的结果
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub runs_created: usize,
    pub candidates: usize,
    pub enqueued: usize,
    pub deferred: usize,
    pub runs_finished: Vec<(i64, RunState)>,
    pub definition_errors: usize,
    pub reconcile: Option<ReconcileReport>,
}

/// 单个运行实例的评估结果
struct RunEvaluation {
    run: Run,
    candidates: Vec<DispatchCandidate>,
    outcome: Option<RunState>,
}

/// 调度循环
///
/// 每个周期：重新扫描定义，按 catchup 策略创建运行实例，并发评估所有活跃运行实例，
/// 把就绪任务交给分发器，最后结束所有任务实例都已终结的运行实例。
/// 存储出错只中止当前周期，下一个周期重新开始。
pub struct SchedulerLoop {
    source: Arc<dyn DefinitionSource>,
    registry: Arc<WorkflowRegistry>,
    store: Arc<dyn MetadataStore>,
    planner: RunPlanner,
    dispatcher: TaskDispatcher,
    reconciler: Reconciler,
    config: SchedulerConfig,
    metrics: MetricsCollector,
    cycle: AtomicU64,
    last_reconcile: Mutex<Option<Instant>>,
}

impl SchedulerLoop {
    pub fn new(
        source: Arc<dyn DefinitionSource>,
        store: Arc<dyn MetadataStore>,
        strategy: Arc<dyn ExecutorStrategy>,
        config: SchedulerConfig,
        dispatcher_config: DispatcherConfig,
    ) -> Self {
        Self {
            source,
            registry: Arc::new(WorkflowRegistry::new()),
            planner: RunPlanner::new(store.clone(), &config),
            dispatcher: TaskDispatcher::new(store.clone(), strategy.clone(), dispatcher_config),
            reconciler: Reconciler::new(store.clone(), strategy, &config),
            store,
            config,
            metrics: MetricsCollector::new(),
            cycle: AtomicU64::new(0),
            last_reconcile: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> Arc<WorkflowRegistry> {
        self.registry.clone()
    }

    /// 按固定节奏运行，直到收到关闭信号
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!(
            "调度循环启动，周期 {}ms，定义目录 {}",
            self.config.cycle_interval_ms, self.config.definitions_dir
        );
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.cycle_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let started = std::time::Instant::now();
                    let result = self.run_cycle(Utc::now()).await;
                    let elapsed = started.elapsed().as_secs_f64();
                    match result {
                        Ok(report) => {
                            self.metrics.record_cycle(elapsed, true);
                            debug!("调度周期完成: {:?}", report);
                        }
                        Err(e) => {
                            self.metrics.record_cycle(elapsed, false);
                            StructuredLogger::log_system_error("scheduler", "run_cycle", &e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("调度循环收到关闭信号");
                    break;
                }
            }
        }
        Ok(())
    }

    /// 执行一个调度周期
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> SchedulerResult<CycleReport> {
        let cycle = self.cycle.fetch_add(1, Ordering::Relaxed) + 1;
        self.run_cycle_inner(now)
            .instrument(TaskTracer::scheduler_cycle_span(cycle))
            .await
    }

    async fn run_cycle_inner(&self, now: DateTime<Utc>) -> SchedulerResult<CycleReport> {
        let mut report = CycleReport::default();

        let scan = self.source.scan().await?;
        if scan.changed {
            let update = self.registry.apply_scan(scan).await;
            report.definition_errors = update.rejected.len();
            self.metrics.record_definition_errors(update.rejected.len());
        }

        for graph in self.registry.all().await {
            report.runs_created += self.planner.plan(&graph, now).await?.len();
        }

        let active_runs = self.store.list_active_runs().await?;
        let evaluations: Vec<SchedulerResult<Option<RunEvaluation>>> = stream::iter(active_runs)
            .map(|run| self.evaluate_run(run, now))
            .buffer_unordered(self.config.run_evaluation_concurrency.max(1))
            .collect()
            .await;

        let mut candidates = Vec::new();
        let mut finished = Vec::new();
        for evaluation in evaluations {
            let Some(evaluation) = evaluation? else {
                continue;
            };
            candidates.extend(evaluation.candidates);
            if let Some(outcome) = evaluation.outcome {
                finished.push((evaluation.run, outcome));
            }
        }

        report.candidates = candidates.len();
        let dispatch = self.dispatcher.dispatch(candidates).await?;
        report.enqueued = dispatch.enqueued.len();
        report.deferred = dispatch.deferred.len();

        for (run, outcome) in finished {
            if self
                .store
                .cas_run_state(run.id, RunState::Running, outcome)
                .await?
            {
                StructuredLogger::log_run_finished(run.id, &run.workflow_name, outcome.as_str());
                self.metrics
                    .record_run_finished(&run.workflow_name, outcome.as_str());
                report.runs_finished.push((run.id, outcome));
            }
        }

        if self.reconcile_due().await {
            report.reconcile = Some(self.reconciler.reconcile(now).await?);
        }

        self.metrics
            .update_active_tasks(self.store.count_active_task_instances(None).await?);
        Ok(report)
    }

    async fn reconcile_due(&self) -> bool {
        let mut last = self.last_reconcile.lock().await;
        let interval = Duration::from_secs(self.config.reconcile_interval_seconds);
        let due = last.map_or(true, |at| at.elapsed() >= interval);
        if due {
            *last = Some(Instant::now());
        }
        due
    }

    async fn evaluate_run(
        &self,
        run: Run,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<RunEvaluation>> {
        let Some(graph) = self.registry.get(&run.workflow_name).await else {
            debug!("运行实例 {} 所属工作流 {} 未加载，跳过", run.id, run.workflow_name);
            return Ok(None);
        };
        let span = TaskTracer::evaluate_run_span(run.id, &run.workflow_name);
        self.evaluate_with_graph(run, &graph, now)
            .instrument(span)
            .await
            .map(Some)
    }

    async fn evaluate_with_graph(
        &self,
        run: Run,
        graph: &WorkflowGraph,
        now: DateTime<Utc>,
    ) -> SchedulerResult<RunEvaluation> {
        let mut instances = self.planner.ensure_instances(graph, &run).await?;
        self.cancel_removed_tasks(graph, &mut instances).await?;
        self.propagate_upstream_failed(graph, &mut instances).await?;

        let previous = if graph.tasks_in_order().any(|t| t.depends_on_past) {
            match self
                .store
                .previous_run(&run.workflow_name, run.logical_date)
                .await?
            {
                Some(prev) => Some(self.store.list_task_instances(prev.id).await?),
                None => None,
            }
        } else {
            None
        };

        let max_active_tasks = graph.definition().max_active_tasks;
        let candidates = graph
            .ready_tasks(&instances, previous.as_deref(), now)
            .into_iter()
            .filter_map(|task| {
                let instance = instances.iter().find(|ti| ti.task_id == task.id)?;
                Some(DispatchCandidate {
                    run_id: run.id,
                    logical_date: run.logical_date,
                    workflow_name: run.workflow_name.clone(),
                    task_instance_id: instance.id,
                    task: task.clone(),
                    position: graph.position(&task.id).unwrap_or(usize::MAX),
                    max_active_tasks,
                })
            })
            .collect();

        // 已从定义中移除的任务不影响运行实例的结果，但仍需先到达终态
        let outcome = if instances.iter().all(|ti| ti.state.is_terminal()) {
            let current: Vec<TaskInstance> = instances
                .iter()
                .filter(|ti| graph.task(&ti.task_id).is_some())
                .cloned()
                .collect();
            run_outcome(&current)
        } else {
            None
        };
        Ok(RunEvaluation {
            run,
            candidates,
            outcome,
        })
    }

    /// 新版本定义中已不存在的任务：pending 实例直接取消
    ///
    /// queued/running 的实例照常执行完毕，回到 pending 后在下个周期取消。
    async fn cancel_removed_tasks(
        &self,
        graph: &WorkflowGraph,
        instances: &mut [TaskInstance],
    ) -> SchedulerResult<()> {
        for slot in instances.iter_mut() {
            if slot.state != TaskState::Pending || graph.task(&slot.task_id).is_some() {
                continue;
            }
            let transition =
                StateTransition::to(TaskState::Cancelled).with_message("任务已从定义中移除");
            match self
                .store
                .cas_task_instance_state(slot.id, TaskState::Pending, &transition)
                .await?
            {
                Some(updated) => {
                    StructuredLogger::log_task_state_change(
                        updated.id,
                        &updated.task_id,
                        TaskState::Pending,
                        TaskState::Cancelled,
                        Some("任务已从定义中移除"),
                    );
                    *slot = updated;
                }
                None => {
                    if let Some(latest) = self.store.get_task_instance(slot.id).await? {
                        *slot = latest;
                    }
                }
            }
        }
        Ok(())
    }

    /// 把前驱失败的 pending 实例标记为 upstream_failed，直到不再有新的标记
    async fn propagate_upstream_failed(
        &self,
        graph: &WorkflowGraph,
        instances: &mut [TaskInstance],
    ) -> SchedulerResult<()> {
        loop {
            let blocked: Vec<String> = graph
                .upstream_failed_tasks(instances)
                .into_iter()
                .map(|t| t.id.clone())
                .collect();
            if blocked.is_empty() {
                return Ok(());
            }

            let mut progressed = false;
            for task_id in blocked {
                let Some(slot) = instances.iter_mut().find(|ti| ti.task_id == task_id) else {
                    continue;
                };
                let transition = StateTransition::to(TaskState::UpstreamFailed)
                    .with_message("上游任务失败");
                match self
                    .store
                    .cas_task_instance_state(slot.id, TaskState::Pending, &transition)
                    .await?
                {
                    Some(updated) => {
                        StructuredLogger::log_task_state_change(
                            updated.id,
                            &updated.task_id,
                            TaskState::Pending,
                            TaskState::UpstreamFailed,
                            Some("上游任务失败"),
                        );
                        *slot = updated;
                        progressed = true;
                    }
                    None => match self.store.get_task_instance(slot.id).await? {
                        Some(latest) => *slot = latest,
                        None => warn!("任务实例 {} 不存在", slot.id),
                    },
                }
            }
            if !progressed {
                debug!("上游失败传播没有进展，留待下个周期");
                return Ok(());
            }
        }
    }
}
