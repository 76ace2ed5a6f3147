//! 执行策略：分发器把准入的任务实例交给哪里执行
//!
//! - `InProcessStrategy`：在调用方中同步执行
//! - `LocalPoolStrategy`：在本进程内有界并发的任务池中执行
//! - `RemoteQueueStrategy`：发布到消息队列，由独立的 worker 进程消费

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, error, info, instrument};

use orchestrator_core::{
    config::{ExecutorStrategyKind, WorkerConfig},
    models::{ExecutionOutcome, ExecutionRequest, ExecutionStatus, Message},
    traits::{ExecutorStrategy, MessageQueue},
    SchedulerError, SchedulerResult,
};

use crate::runner::InstanceRunner;

pub struct InProcessStrategy {
    runner: Arc<InstanceRunner>,
}

impl InProcessStrategy {
    pub fn new(runner: Arc<InstanceRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl ExecutorStrategy for InProcessStrategy {
    fn name(&self) -> &str {
        "in_process"
    }

    async fn execute(&self, request: ExecutionRequest) -> SchedulerResult<ExecutionOutcome> {
        self.runner.run(&request).await
    }

    async fn status(&self, task_instance_id: i64) -> SchedulerResult<ExecutionStatus> {
        if self.runner.is_executing(task_instance_id).await {
            Ok(ExecutionStatus::Running)
        } else {
            Ok(ExecutionStatus::NotRunning)
        }
    }

    async fn cancel(&self, task_instance_id: i64) -> SchedulerResult<()> {
        self.runner.cancel(task_instance_id).await
    }
}

/// 本地有界任务池
///
/// `execute` 立即返回 `Submitted`；任务等待信号量后执行。等待中的实例
/// 也视为运行中。
pub struct LocalPoolStrategy {
    runner: Arc<InstanceRunner>,
    permits: Arc<Semaphore>,
    submitted: Arc<Mutex<HashSet<i64>>>,
}

impl LocalPoolStrategy {
    pub fn new(runner: Arc<InstanceRunner>, max_concurrent_tasks: usize) -> Self {
        Self {
            runner,
            permits: Arc::new(Semaphore::new(max_concurrent_tasks.max(1))),
            submitted: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.submitted.lock().await.len()
    }
}

#[async_trait]
impl ExecutorStrategy for LocalPoolStrategy {
    fn name(&self) -> &str {
        "local_pool"
    }

    async fn execute(&self, request: ExecutionRequest) -> SchedulerResult<ExecutionOutcome> {
        let id = request.task_instance_id;
        self.submitted.lock().await.insert(id);

        let runner = self.runner.clone();
        let permits = self.permits.clone();
        let submitted = self.submitted.clone();
        tokio::spawn(async move {
            match permits.acquire_owned().await {
                Ok(_permit) => {
                    if let Err(e) = runner.run(&request).await {
                        error!("本地执行任务实例 {} 失败: {}", id, e);
                    }
                }
                Err(e) => error!("任务池已关闭，任务实例 {} 未执行: {}", id, e),
            }
            submitted.lock().await.remove(&id);
        });
        Ok(ExecutionOutcome::Submitted)
    }

    async fn status(&self, task_instance_id: i64) -> SchedulerResult<ExecutionStatus> {
        if self.submitted.lock().await.contains(&task_instance_id) {
            Ok(ExecutionStatus::Running)
        } else {
            Ok(ExecutionStatus::NotRunning)
        }
    }

    async fn cancel(&self, task_instance_id: i64) -> SchedulerResult<()> {
        self.runner.cancel(task_instance_id).await
    }
}

/// 发布到消息队列，远程 worker 通过心跳发现取消
pub struct RemoteQueueStrategy {
    queue: Arc<dyn MessageQueue>,
    queue_name: String,
}

impl RemoteQueueStrategy {
    pub fn new(queue: Arc<dyn MessageQueue>, queue_name: impl Into<String>) -> Self {
        Self {
            queue,
            queue_name: queue_name.into(),
        }
    }
}

#[async_trait]
impl ExecutorStrategy for RemoteQueueStrategy {
    fn name(&self) -> &str {
        "remote_queue"
    }

    #[instrument(skip_all, fields(task_instance.id = request.task_instance_id, queue = %self.queue_name))]
    async fn execute(&self, request: ExecutionRequest) -> SchedulerResult<ExecutionOutcome> {
        let message = Message::task_execution(request);
        self.queue.enqueue(&self.queue_name, &message).await?;
        debug!("任务消息已发布: {}", message.id);
        Ok(ExecutionOutcome::Submitted)
    }

    async fn status(&self, _task_instance_id: i64) -> SchedulerResult<ExecutionStatus> {
        Ok(ExecutionStatus::Unknown)
    }

    async fn cancel(&self, task_instance_id: i64) -> SchedulerResult<()> {
        debug!(
            "任务实例 {} 由远程 worker 执行，等待其心跳发现取消",
            task_instance_id
        );
        Ok(())
    }
}

/// 执行策略工厂
pub struct ExecutorStrategyFactory;

impl ExecutorStrategyFactory {
    pub fn create(
        kind: ExecutorStrategyKind,
        runner: Arc<InstanceRunner>,
        queue: Option<(Arc<dyn MessageQueue>, String)>,
        worker: &WorkerConfig,
    ) -> SchedulerResult<Arc<dyn ExecutorStrategy>> {
        let strategy: Arc<dyn ExecutorStrategy> = match kind {
            ExecutorStrategyKind::InProcess => Arc::new(InProcessStrategy::new(runner)),
            ExecutorStrategyKind::LocalPool => {
                Arc::new(LocalPoolStrategy::new(runner, worker.max_concurrent_tasks))
            }
            ExecutorStrategyKind::RemoteQueue => {
                let (queue, queue_name) = queue.ok_or_else(|| {
                    SchedulerError::FatalConfig("remote_queue 执行策略需要消息队列".to_string())
                })?;
                Arc::new(RemoteQueueStrategy::new(queue, queue_name))
            }
        };
        info!("执行策略: {}", strategy.name());
        Ok(strategy)
    }
}
