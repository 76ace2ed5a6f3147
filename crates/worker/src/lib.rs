//! 任务执行：执行器、执行器注册表、实例执行器、执行策略与远程 worker

pub mod executor_registry;
pub mod executors;
pub mod runner;
pub mod service;
pub mod strategies;

pub use executor_registry::TaskExecutorRegistry;
pub use executors::{HttpExecutor, HttpTaskParams, NoopExecutor, ShellExecutor, ShellTaskParams};
pub use runner::InstanceRunner;
pub use service::WorkerService;
pub use strategies::{
    ExecutorStrategyFactory, InProcessStrategy, LocalPoolStrategy, RemoteQueueStrategy,
};
