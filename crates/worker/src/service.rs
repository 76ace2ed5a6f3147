use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument};

use orchestrator_core::{
    config::WorkerConfig,
    models::{Delivery, MessageType},
    traits::MessageQueue,
    SchedulerError, SchedulerResult,
};
use orchestrator_infrastructure::{MetricsCollector, StructuredLogger, TaskTracer};

use crate::runner::InstanceRunner;

/// 远程 worker：消费任务消息并执行
///
/// 至少一次投递：处理完成（包括准入落败被跳过）后确认消息；准入阶段遇到
/// 基础设施错误时拒绝并重新入队。
pub struct WorkerService {
    queue: Arc<dyn MessageQueue>,
    queue_name: String,
    runner: Arc<InstanceRunner>,
    permits: Arc<Semaphore>,
    poll_timeout: Duration,
    metrics: MetricsCollector,
}

impl WorkerService {
    pub fn new(
        queue: Arc<dyn MessageQueue>,
        queue_name: impl Into<String>,
        runner: Arc<InstanceRunner>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
            runner,
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            poll_timeout: Duration::from_millis(config.poll_timeout_ms.max(1)),
            metrics: MetricsCollector::new(),
        }
    }

    /// 配置的 worker ID 加上主机名，写入任务实例便于定位
    pub fn identity(worker_id: &str) -> String {
        match hostname::get() {
            Ok(host) => format!("{}@{}", worker_id, host.to_string_lossy()),
            Err(_) => worker_id.to_string(),
        }
    }

    /// 持续消费，直到收到关闭信号；关闭时等待正在执行的任务结束
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> SchedulerResult<()> {
        info!(
            "Worker {} 开始消费队列 {}",
            self.runner.worker_id(),
            self.queue_name
        );
        let mut in_flight = JoinSet::new();

        loop {
            while in_flight.try_join_next().is_some() {}

            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = self.permits.clone().acquire_owned() => permit
                    .map_err(|e| SchedulerError::Internal(format!("任务许可获取失败: {e}")))?,
            };

            let delivery = tokio::select! {
                _ = shutdown.recv() => break,
                delivery = self.queue.dequeue(&self.queue_name, self.poll_timeout) => delivery,
            };
            let delivery = match delivery {
                Ok(Some(delivery)) => delivery,
                Ok(None) => continue,
                Err(e) => {
                    StructuredLogger::log_system_error("worker", "dequeue", &e);
                    tokio::time::sleep(self.poll_timeout).await;
                    continue;
                }
            };

            let queue = self.queue.clone();
            let runner = self.runner.clone();
            in_flight.spawn(async move {
                Self::handle_delivery(queue.as_ref(), runner.as_ref(), delivery).await;
                drop(permit);
            });
        }

        info!(
            "Worker {} 停止消费，等待 {} 个任务结束",
            self.runner.worker_id(),
            in_flight.len()
        );
        while in_flight.join_next().await.is_some() {}
        Ok(())
    }

    /// 取出并处理一条消息，队列为空时返回 false
    pub async fn process_next(&self) -> SchedulerResult<bool> {
        match self.queue.dequeue(&self.queue_name, self.poll_timeout).await? {
            Some(delivery) => {
                Self::handle_delivery(self.queue.as_ref(), self.runner.as_ref(), delivery).await;
                if let Ok(depth) = self.queue.queue_size(&self.queue_name).await {
                    self.metrics.update_queue_depth(&self.queue_name, depth);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn handle_delivery(queue: &dyn MessageQueue, runner: &InstanceRunner, delivery: Delivery) {
        let span = TaskTracer::message_queue_span("consume", &delivery.queue);
        async {
            let MessageType::TaskExecution(request) = &delivery.message.message_type;
            match runner.run(request).await {
                Ok(outcome) => {
                    debug!(
                        "任务实例 {} 处理完成: {:?}",
                        request.task_instance_id, outcome
                    );
                    if let Err(e) = queue.ack(&delivery).await {
                        warn!("确认消息 {} 失败: {}", delivery.message.id, e);
                    }
                }
                Err(e) => {
                    error!(
                        "任务实例 {} 处理失败: {}",
                        request.task_instance_id, e
                    );
                    if let Err(e) = queue.nack(&delivery, e.is_transient()).await {
                        warn!("拒绝消息 {} 失败: {}", delivery.message.id, e);
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}
