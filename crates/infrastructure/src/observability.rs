//! 指标、结构化日志事件与 span 辅助函数

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use tracing::{error, info, warn};

use orchestrator_core::{
    models::{FailureKind, TaskState},
    SchedulerError, SchedulerResult,
};

/// 安装 Prometheus 导出器，需要在 tokio 运行时内调用
pub fn init_metrics(bind_address: &str) -> SchedulerResult<()> {
    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        SchedulerError::FatalConfig(format!("无效的指标监听地址 {bind_address}: {e}"))
    })?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| SchedulerError::FatalConfig(format!("Failed to create Prometheus exporter: {e}")))?;

    info!("Prometheus metrics exporter listening on {}", addr);
    Ok(())
}

/// 编排核心的指标
///
/// 未安装全局 recorder 时所有调用都是空操作。
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    pub fn record_cycle(&self, duration_seconds: f64, ok: bool) {
        histogram!("orchestrator_scheduler_cycle_duration_seconds").record(duration_seconds);
        if !ok {
            counter!("orchestrator_scheduler_cycle_failures_total").increment(1);
        }
    }

    pub fn record_runs_created(&self, workflow: &str, count: usize) {
        counter!("orchestrator_runs_created_total", "workflow" => workflow.to_string())
            .increment(count as u64);
    }

    pub fn record_run_finished(&self, workflow: &str, state: &str) {
        counter!(
            "orchestrator_runs_finished_total",
            "workflow" => workflow.to_string(),
            "state" => state.to_string()
        )
        .increment(1);
    }

    pub fn record_dispatch(&self, enqueued: usize, deferred: usize) {
        counter!("orchestrator_tasks_enqueued_total").increment(enqueued as u64);
        counter!("orchestrator_tasks_deferred_total").increment(deferred as u64);
    }

    pub fn update_active_tasks(&self, active: usize) {
        gauge!("orchestrator_active_task_instances").set(active as f64);
    }

    pub fn record_task_execution(&self, executor: &str, success: bool, duration_seconds: f64) {
        let status = if success { "succeeded" } else { "failed" };
        counter!(
            "orchestrator_task_executions_total",
            "executor" => executor.to_string(),
            "status" => status
        )
        .increment(1);
        histogram!(
            "orchestrator_task_execution_duration_seconds",
            "executor" => executor.to_string()
        )
        .record(duration_seconds);
    }

    pub fn record_task_retry(&self, executor: &str) {
        counter!("orchestrator_task_retries_total", "executor" => executor.to_string())
            .increment(1);
    }

    pub fn record_definition_errors(&self, count: usize) {
        gauge!("orchestrator_definition_errors").set(count as f64);
    }

    pub fn update_queue_depth(&self, queue: &str, depth: u32) {
        gauge!("orchestrator_queue_depth", "queue" => queue.to_string()).set(depth as f64);
    }

    pub fn record_reconciled(&self, kind: &'static str, count: usize) {
        counter!("orchestrator_reconciled_total", "kind" => kind).increment(count as u64);
    }
}

/// Structured logging utilities
pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_run_created(run_id: i64, workflow: &str, logical_date: DateTime<Utc>) {
        info!(
            event = "run_created",
            run.id = run_id,
            workflow.name = workflow,
            run.logical_date = %logical_date,
            "Run created"
        );
    }

    pub fn log_run_finished(run_id: i64, workflow: &str, state: &str) {
        info!(
            event = "run_finished",
            run.id = run_id,
            workflow.name = workflow,
            run.state = state,
            "Run finished"
        );
    }

    pub fn log_task_dispatched(task_instance_id: i64, run_id: i64, task_id: &str, executor: &str) {
        info!(
            event = "task_dispatched",
            task_instance.id = task_instance_id,
            run.id = run_id,
            task.id = task_id,
            task.executor = executor,
            "Task dispatched"
        );
    }

    pub fn log_task_state_change(
        task_instance_id: i64,
        task_id: &str,
        from: TaskState,
        to: TaskState,
        reason: Option<&str>,
    ) {
        match to {
            TaskState::Failed | TaskState::UpstreamFailed => warn!(
                event = "task_state_change",
                task_instance.id = task_instance_id,
                task.id = task_id,
                state.from = %from,
                state.to = %to,
                reason = reason.unwrap_or(""),
                "Task state changed"
            ),
            _ => info!(
                event = "task_state_change",
                task_instance.id = task_instance_id,
                task.id = task_id,
                state.from = %from,
                state.to = %to,
                reason = reason.unwrap_or(""),
                "Task state changed"
            ),
        }
    }

    pub fn log_task_execution_complete(
        task_instance_id: i64,
        task_id: &str,
        worker_id: &str,
        success: bool,
        duration_ms: u64,
        failure: Option<(FailureKind, &str)>,
    ) {
        if success {
            info!(
                event = "task_execution_complete",
                task_instance.id = task_instance_id,
                task.id = task_id,
                worker.id = worker_id,
                duration_ms = duration_ms,
                "Task execution succeeded"
            );
        } else {
            let (kind, reason) = failure.unwrap_or((FailureKind::Retryable, ""));
            warn!(
                event = "task_execution_complete",
                task_instance.id = task_instance_id,
                task.id = task_id,
                worker.id = worker_id,
                duration_ms = duration_ms,
                failure.kind = %kind,
                failure.reason = reason,
                "Task execution failed"
            );
        }
    }

    pub fn log_definition_rejected(origin: &str, reason: &str) {
        warn!(
            event = "definition_rejected",
            definition.origin = origin,
            reason = reason,
            "Workflow definition rejected"
        );
    }

    pub fn log_system_error(component: &str, operation: &str, error: &dyn std::error::Error) {
        error!(
            event = "system_error",
            component = component,
            operation = operation,
            error = %error,
            "System error occurred"
        );
    }
}

pub struct TaskTracer;

impl TaskTracer {
    pub fn scheduler_cycle_span(cycle: u64) -> tracing::Span {
        tracing::info_span!("scheduler_cycle", cycle = cycle)
    }

    pub fn evaluate_run_span(run_id: i64, workflow: &str) -> tracing::Span {
        tracing::info_span!("evaluate_run", run.id = run_id, workflow.name = workflow)
    }

    pub fn execute_task_span(
        task_instance_id: i64,
        task_id: &str,
        executor: &str,
        worker_id: &str,
    ) -> tracing::Span {
        tracing::info_span!(
            "execute_task",
            task_instance.id = task_instance_id,
            task.id = task_id,
            task.executor = executor,
            worker.id = worker_id
        )
    }

    pub fn message_queue_span(operation: &str, queue_name: &str) -> tracing::Span {
        tracing::info_span!(
            "message_queue_operation",
            mq.operation = operation,
            mq.queue = queue_name
        )
    }
}
