use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use orchestrator_core::{
    config::SchedulerConfig,
    models::{ExecutionStatus, FailureKind, StateTransition, TaskInstance, TaskState},
    traits::{ExecutorStrategy, MetadataStore},
    SchedulerResult,
};
use orchestrator_infrastructure::{MetricsCollector, StructuredLogger};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// 排队超时、退回 pending 等待重新分发
    pub requeued: Vec<i64>,
    /// 执行丢失、还有重试次数
    pub rescheduled: Vec<i64>,
    /// 执行丢失、重试次数已用完
    pub failed: Vec<i64>,
}

/// 对账：处理长时间停留在 queued 或失去心跳的 running 实例
///
/// queued 超时的实例退回 pending，由下一个调度周期重新入队；重复投递的旧消息
/// 会在 `queued→running` 准入时落败。running 实例只有在心跳过期且执行策略确认
/// 不在运行（或无法得知）时才视为丢失。
pub struct Reconciler {
    store: Arc<dyn MetadataStore>,
    strategy: Arc<dyn ExecutorStrategy>,
    queued_timeout: Duration,
    running_timeout: Duration,
    metrics: MetricsCollector,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        strategy: Arc<dyn ExecutorStrategy>,
        config: &SchedulerConfig,
    ) -> Self {
        Self {
            store,
            strategy,
            queued_timeout: Duration::from_secs(config.queued_timeout_seconds),
            running_timeout: Duration::from_secs(config.running_timeout_seconds),
            metrics: MetricsCollector::new(),
        }
    }

    #[instrument(skip(self))]
    pub async fn reconcile(&self, now: DateTime<Utc>) -> SchedulerResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.requeue_stale_queued(now, &mut report).await?;
        self.recover_lost_running(now, &mut report).await?;

        if report != ReconcileReport::default() {
            info!(
                "对账完成: 重新排队 {}, 重新调度 {}, 失败 {}",
                report.requeued.len(),
                report.rescheduled.len(),
                report.failed.len()
            );
        }
        self.metrics.record_reconciled("requeued", report.requeued.len());
        self.metrics
            .record_reconciled("rescheduled", report.rescheduled.len());
        self.metrics.record_reconciled("failed", report.failed.len());
        Ok(report)
    }

    fn older_than(at: Option<DateTime<Utc>>, now: DateTime<Utc>, limit: Duration) -> bool {
        let limit =
            chrono::Duration::from_std(limit).unwrap_or_else(|_| chrono::Duration::days(36_500));
        at.map_or(true, |at| now - at > limit)
    }

    async fn requeue_stale_queued(
        &self,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> SchedulerResult<()> {
        let queued = self
            .store
            .list_task_instances_by_state(TaskState::Queued)
            .await?;
        for instance in queued {
            if !Self::older_than(instance.queued_at, now, self.queued_timeout) {
                continue;
            }
            let transition =
                StateTransition::to(TaskState::Pending).with_message("排队超时，重新分发");
            if self
                .store
                .cas_task_instance_state(instance.id, TaskState::Queued, &transition)
                .await?
                .is_some()
            {
                warn!("任务实例 {} 排队超时，退回 pending", instance.id);
                report.requeued.push(instance.id);
            }
        }
        Ok(())
    }

    async fn recover_lost_running(
        &self,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> SchedulerResult<()> {
        let running = self
            .store
            .list_task_instances_by_state(TaskState::Running)
            .await?;
        for instance in running {
            let last_seen = instance.heartbeat_at.or(instance.started_at);
            if !Self::older_than(last_seen, now, self.running_timeout) {
                continue;
            }
            let status = match self.strategy.status(instance.id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!("查询任务实例 {} 执行状态失败: {}", instance.id, e);
                    continue;
                }
            };
            if status == ExecutionStatus::Running {
                continue;
            }
            self.mark_lost(&instance, report).await?;
        }
        Ok(())
    }

    async fn mark_lost(
        &self,
        instance: &TaskInstance,
        report: &mut ReconcileReport,
    ) -> SchedulerResult<()> {
        let reason = "执行丢失：心跳超时且执行者不再运行该任务";
        let (transition, rescheduled) = if instance.attempts_remaining() {
            (
                StateTransition::to(TaskState::Pending)
                    .with_error(FailureKind::Retryable, reason)
                    .with_retry_at(Utc::now()),
                true,
            )
        } else {
            (
                StateTransition::to(TaskState::Failed).with_error(FailureKind::Retryable, reason),
                false,
            )
        };

        let transition = transition.for_attempt(instance.attempt);
        if self
            .store
            .cas_task_instance_state(instance.id, TaskState::Running, &transition)
            .await?
            .is_none()
        {
            return Ok(());
        }
        StructuredLogger::log_task_state_change(
            instance.id,
            &instance.task_id,
            TaskState::Running,
            transition.next,
            Some(reason),
        );
        if rescheduled {
            report.rescheduled.push(instance.id);
        } else {
            report.failed.push(instance.id);
        }
        Ok(())
    }
}
