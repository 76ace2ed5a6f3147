use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn, Instrument};

use orchestrator_core::{
    config::WorkerConfig,
    models::{
        ExecutionOutcome, ExecutionRequest, FailureKind, StateTransition, TaskExecutionContext,
        TaskInstance, TaskResult, TaskState,
    },
    retry_transient,
    traits::{ExecutorRegistry, MetadataStore, TaskExecutor},
    RetryConfig, SchedulerResult,
};
use orchestrator_domain::failure_transition;
use orchestrator_infrastructure::{MetricsCollector, StructuredLogger, TaskTracer};

/// 一次执行的结局
enum Completion {
    Finished(SchedulerResult<TaskResult>),
    TimedOut(Duration),
    /// 心跳发现实例已不再属于本执行者（被取消或被对账接管）
    Abandoned,
}

/// 执行单个任务实例：准入、执行、心跳、写入结果
///
/// 只有赢得 `queued→running` CAS 的执行者才会真正执行。结果写入失败时
/// 记录错误并让实例停留在 running，由对账处理。
pub struct InstanceRunner {
    store: Arc<dyn MetadataStore>,
    executors: Arc<dyn ExecutorRegistry>,
    worker_id: String,
    heartbeat_interval: Duration,
    default_timeout: Duration,
    retry: RetryConfig,
    active: RwLock<HashMap<i64, Arc<dyn TaskExecutor>>>,
    metrics: MetricsCollector,
}

impl InstanceRunner {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        executors: Arc<dyn ExecutorRegistry>,
        config: &WorkerConfig,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            executors,
            worker_id: config.worker_id.clone(),
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_seconds.max(1)),
            default_timeout: Duration::from_secs(config.default_task_timeout_seconds),
            retry,
            active: RwLock::new(HashMap::new()),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn is_executing(&self, task_instance_id: i64) -> bool {
        self.active.read().await.contains_key(&task_instance_id)
    }

    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    /// 通知正在执行该实例的执行器停止
    pub async fn cancel(&self, task_instance_id: i64) -> SchedulerResult<()> {
        let executor = self.active.read().await.get(&task_instance_id).cloned();
        match executor {
            Some(executor) => executor.cancel(task_instance_id).await,
            None => {
                debug!("任务实例 {} 不在本地执行", task_instance_id);
                Ok(())
            }
        }
    }

    pub async fn run(&self, request: &ExecutionRequest) -> SchedulerResult<ExecutionOutcome> {
        let span = TaskTracer::execute_task_span(
            request.task_instance_id,
            &request.task_id,
            &request.executor,
            &self.worker_id,
        );
        self.run_inner(request).instrument(span).await
    }

    async fn run_inner(&self, request: &ExecutionRequest) -> SchedulerResult<ExecutionOutcome> {
        let admission = StateTransition::to(TaskState::Running)
            .with_worker(self.worker_id.as_str())
            .bump_attempt();
        let admitted = retry_transient("admit_task_instance", &self.retry, || {
            self.store
                .cas_task_instance_state(request.task_instance_id, TaskState::Queued, &admission)
        })
        .await?;
        let Some(running) = admitted else {
            debug!(
                "任务实例 {} 已被其他执行者处理或已取消，跳过",
                request.task_instance_id
            );
            return Ok(ExecutionOutcome::Skipped);
        };
        StructuredLogger::log_task_state_change(
            running.id,
            &running.task_id,
            TaskState::Queued,
            TaskState::Running,
            None,
        );

        let started = Instant::now();
        let completion = match self.executors.get(&request.executor) {
            Some(executor) => {
                let context =
                    TaskExecutionContext::from_request(request, running.attempt, &self.worker_id);
                let timeout = request
                    .timeout_seconds
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_timeout);
                self.active
                    .write()
                    .await
                    .insert(running.id, executor.clone());
                let completion = self.supervise(executor.as_ref(), &context, timeout).await;
                self.active.write().await.remove(&running.id);
                completion
            }
            None => Completion::Finished(Ok(TaskResult::failure(
                FailureKind::Fatal,
                format!("未知的执行器类型: {}", request.executor),
                None,
                0,
            ))),
        };
        let duration = started.elapsed();

        let (success, failure) = match completion {
            Completion::Abandoned => {
                warn!(
                    "任务实例 {} 已被取消或接管，放弃执行结果",
                    running.id
                );
                return Ok(ExecutionOutcome::Skipped);
            }
            Completion::Finished(Ok(result)) if result.success => (true, None),
            Completion::Finished(Ok(result)) => (
                false,
                Some((
                    result.failure_kind.unwrap_or(FailureKind::Retryable),
                    result
                        .error_message
                        .unwrap_or_else(|| "任务执行失败".to_string()),
                )),
            ),
            Completion::Finished(Err(e)) => (false, Some((e.failure_kind(), e.to_string()))),
            Completion::TimedOut(limit) => (
                false,
                Some((
                    FailureKind::Retryable,
                    format!("执行超时 ({}s)", limit.as_secs()),
                )),
            ),
        };

        self.metrics
            .record_task_execution(&request.executor, success, duration.as_secs_f64());
        StructuredLogger::log_task_execution_complete(
            running.id,
            &running.task_id,
            &self.worker_id,
            success,
            duration.as_millis() as u64,
            failure.as_ref().map(|(kind, reason)| (*kind, reason.as_str())),
        );

        let (transition, outcome) = match failure {
            None => (
                StateTransition::to(TaskState::Succeeded),
                ExecutionOutcome::Succeeded,
            ),
            Some((kind, reason)) => (
                failure_transition(&running, &request.retry, kind, &reason, Utc::now()),
                ExecutionOutcome::Failed { kind, reason },
            ),
        };
        if transition.next == TaskState::Pending {
            self.metrics.record_task_retry(&request.executor);
        }
        let transition = transition.for_attempt(running.attempt);
        self.write_terminal(&running, &transition).await;
        Ok(outcome)
    }

    /// 执行并在期间定期心跳，超时或心跳发现取消时通知执行器停止
    async fn supervise(
        &self,
        executor: &dyn TaskExecutor,
        context: &TaskExecutionContext,
        timeout: Duration,
    ) -> Completion {
        let execution = executor.execute_task(context);
        tokio::pin!(execution);
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut execution => return Completion::Finished(result),
                _ = &mut deadline => {
                    if let Err(e) = executor.cancel(context.task_instance_id).await {
                        warn!("超时后取消任务实例 {} 失败: {}", context.task_instance_id, e);
                    }
                    return Completion::TimedOut(timeout);
                }
                _ = heartbeat.tick() => {
                    match self
                        .store
                        .heartbeat_task_instance(
                            context.task_instance_id,
                            &self.worker_id,
                            context.attempt,
                        )
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => {
                            if let Err(e) = executor.cancel(context.task_instance_id).await {
                                warn!("取消任务实例 {} 失败: {}", context.task_instance_id, e);
                            }
                            return Completion::Abandoned;
                        }
                        Err(e) => warn!("任务实例 {} 心跳写入失败: {}", context.task_instance_id, e),
                    }
                }
            }
        }
    }

    async fn write_terminal(&self, running: &TaskInstance, transition: &StateTransition) {
        let written = retry_transient("write_task_result", &self.retry, || {
            self.store
                .cas_task_instance_state(running.id, TaskState::Running, transition)
        })
        .await;
        match written {
            Ok(Some(_)) => StructuredLogger::log_task_state_change(
                running.id,
                &running.task_id,
                TaskState::Running,
                transition.next,
                transition.error_message.as_deref(),
            ),
            Ok(None) => warn!(
                "任务实例 {} 状态已被修改（已取消或已开始新的尝试），丢弃执行结果",
                running.id
            ),
            Err(e) => error!(
                alert = true,
                task_instance.id = running.id,
                "任务实例 {} 结果写入失败，保持 running 等待对账: {}",
                running.id,
                e
            ),
        }
    }
}
