use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use orchestrator_api::{create_app, serve};
use orchestrator_core::{
    config::{AppConfig, DatabaseBackend, ExecutorStrategyKind},
    traits::{DefinitionSource, ExecutorStrategy, MessageQueue, MetadataStore},
};
use orchestrator_dispatcher::{RunController, SchedulerLoop, WorkflowRegistry};
use orchestrator_infrastructure::{
    FileDefinitionSource, MessageQueueFactory, MetadataStoreFactory,
};
use orchestrator_worker::{
    ExecutorStrategyFactory, InstanceRunner, TaskExecutorRegistry, WorkerService,
};

/// 应用运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppMode {
    /// 仅运行调度循环
    Scheduler,
    /// 仅运行远程 worker
    Worker,
    /// 仅运行API服务器
    Api,
    /// 运行所有组件
    All,
}

impl AppMode {
    fn runs_scheduler(self) -> bool {
        matches!(self, AppMode::Scheduler | AppMode::All)
    }

    fn runs_api(self) -> bool {
        matches!(self, AppMode::Api | AppMode::All)
    }
}

impl FromStr for AppMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "scheduler" => Ok(AppMode::Scheduler),
            "worker" => Ok(AppMode::Worker),
            "api" => Ok(AppMode::Api),
            "all" => Ok(AppMode::All),
            other => bail!("不支持的运行模式: {other}"),
        }
    }
}

impl fmt::Display for AppMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppMode::Scheduler => "scheduler",
            AppMode::Worker => "worker",
            AppMode::Api => "api",
            AppMode::All => "all",
        };
        f.write_str(name)
    }
}

/// 主应用程序：按运行模式组装并启动各组件
///
/// 所有组件共享同一个元数据存储；remote_queue 策略或 worker 模式下额外连接消息队列。
pub struct Application {
    config: AppConfig,
    mode: AppMode,
    store: Arc<dyn MetadataStore>,
    queue: Option<Arc<dyn MessageQueue>>,
    runner: Arc<InstanceRunner>,
    strategy: Arc<dyn ExecutorStrategy>,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig, mode: AppMode) -> Result<Self> {
        info!("初始化应用程序，模式: {}", mode);
        check_mode(&config, mode)?;

        let store = MetadataStoreFactory::create(&config.database)
            .await
            .context("创建元数据存储失败")?;

        let remote = config.dispatcher.executor_strategy == ExecutorStrategyKind::RemoteQueue;
        let queue = if remote || mode == AppMode::Worker {
            info!("连接消息队列: {}", mask_url(&config.message_queue.url));
            Some(
                MessageQueueFactory::create(&config.message_queue)
                    .await
                    .context("连接消息队列失败")?,
            )
        } else {
            None
        };

        let mut worker = config.worker.clone();
        worker.worker_id = WorkerService::identity(&config.worker.worker_id);
        let runner = Arc::new(InstanceRunner::new(
            store.clone(),
            Arc::new(TaskExecutorRegistry::with_defaults()),
            &worker,
            config.retry.clone(),
        ));

        let strategy = ExecutorStrategyFactory::create(
            config.dispatcher.executor_strategy,
            runner.clone(),
            queue
                .clone()
                .map(|q| (q, config.message_queue.task_queue.clone())),
            &config.worker,
        )
        .context("创建执行策略失败")?;

        Ok(Self {
            config,
            mode,
            store,
            queue,
            runner,
            strategy,
        })
    }

    /// 运行应用程序，直到收到关闭信号且所有组件退出
    pub async fn run(&self, shutdown: broadcast::Receiver<()>) -> Result<()> {
        info!("启动应用程序，模式: {}", self.mode);

        let mut handles: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

        let registry = if self.mode.runs_scheduler() {
            let scheduler = Arc::new(self.build_scheduler());
            let registry = scheduler.registry();
            let rx = shutdown.resubscribe();
            handles.push((
                "scheduler",
                tokio::spawn(async move { scheduler.run(rx).await.map_err(Into::into) }),
            ));
            registry
        } else {
            self.load_registry().await
        };

        if let Some(worker) = self.build_worker() {
            let worker = Arc::new(worker);
            let rx = shutdown.resubscribe();
            handles.push((
                "worker",
                tokio::spawn(async move { worker.run(rx).await.map_err(Into::into) }),
            ));
        }

        if self.mode.runs_api() && self.config.api.enabled {
            let controller = Arc::new(RunController::new(self.store.clone(), self.strategy.clone()));
            let app = create_app(self.store.clone(), controller, registry, &self.config.api);
            let api_config = self.config.api.clone();
            let rx = shutdown.resubscribe();
            handles.push((
                "api",
                tokio::spawn(async move { serve(app, &api_config, rx).await.map_err(Into::into) }),
            ));
        }

        if handles.is_empty() {
            bail!("运行模式 {} 下没有可启动的组件", self.mode);
        }

        let mut failed = false;
        for (name, handle) in handles {
            match handle.await {
                Ok(Ok(())) => info!("组件 {} 已停止", name),
                Ok(Err(e)) => {
                    error!("组件 {} 运行失败: {:#}", name, e);
                    failed = true;
                }
                Err(e) => {
                    error!("组件 {} 异常退出: {}", name, e);
                    failed = true;
                }
            }
        }

        if failed {
            bail!("部分组件运行失败");
        }
        info!("所有组件已停止");
        Ok(())
    }

    fn build_scheduler(&self) -> SchedulerLoop {
        let source: Arc<dyn DefinitionSource> =
            Arc::new(FileDefinitionSource::from_config(&self.config.scheduler));
        SchedulerLoop::new(
            source,
            self.store.clone(),
            self.strategy.clone(),
            self.config.scheduler.clone(),
            self.config.dispatcher.clone(),
        )
    }

    /// 远程 worker 只在 worker 模式，或 all 模式且使用 remote_queue 策略时启动
    fn build_worker(&self) -> Option<WorkerService> {
        let wanted = match self.mode {
            AppMode::Worker => true,
            AppMode::All => {
                self.config.worker.enabled
                    && self.config.dispatcher.executor_strategy == ExecutorStrategyKind::RemoteQueue
            }
            _ => false,
        };
        if !wanted {
            return None;
        }
        let queue = self.queue.clone()?;
        Some(WorkerService::new(
            queue,
            self.config.message_queue.task_queue.clone(),
            self.runner.clone(),
            &self.config.worker,
        ))
    }

    /// 不运行调度循环时只扫描一次定义，供API展示
    async fn load_registry(&self) -> Arc<WorkflowRegistry> {
        let registry = Arc::new(WorkflowRegistry::new());
        if !self.mode.runs_api() {
            return registry;
        }
        let source = FileDefinitionSource::from_config(&self.config.scheduler);
        match source.scan().await {
            Ok(scan) => {
                registry.apply_scan(scan).await;
            }
            Err(e) => warn!("扫描工作流定义失败: {}", e),
        }
        registry
    }
}

fn check_mode(config: &AppConfig, mode: AppMode) -> Result<()> {
    match mode {
        AppMode::Scheduler if !config.scheduler.enabled => {
            bail!("Scheduler模式被禁用，请检查配置")
        }
        AppMode::Worker if !config.worker.enabled => bail!("Worker模式被禁用，请检查配置"),
        AppMode::Api if !config.api.enabled => bail!("API模式被禁用，请检查配置"),
        AppMode::Worker | AppMode::Api if config.database.backend == DatabaseBackend::Memory => {
            bail!("{mode} 模式需要与调度进程共享的持久化存储，不能使用内存存储")
        }
        AppMode::Worker if config.message_queue.is_in_memory() => {
            bail!("worker 模式需要外部消息队列，不能使用内存队列")
        }
        _ => Ok(()),
    }
}

/// 屏蔽URL中的密码
fn mask_url(url: &str) -> String {
    if let Some(at_pos) = url.find('@') {
        if let Some(colon_pos) = url[..at_pos].rfind(':') {
            let mut masked = url.to_string();
            masked.replace_range(colon_pos + 1..at_pos, "***");
            return masked;
        }
    }
    url.to_string()
}
