use std::collections::HashMap;
use std::sync::Arc;

use orchestrator_core::traits::{ExecutorRegistry, TaskExecutor};
use tracing::info;

use crate::executors::{HttpExecutor, NoopExecutor, ShellExecutor};

/// 按执行器类型查找任务执行器
#[derive(Default)]
pub struct TaskExecutorRegistry {
    executors: HashMap<String, Arc<dyn TaskExecutor>>,
}

impl TaskExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 内置的 shell / http / noop 执行器
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ShellExecutor::new()));
        registry.register(Arc::new(HttpExecutor::new()));
        registry.register(Arc::new(NoopExecutor::new()));
        registry
    }

    /// 注册执行器，同名的旧执行器被替换
    pub fn register(&mut self, executor: Arc<dyn TaskExecutor>) {
        let name = executor.name().to_string();
        info!("注册任务执行器: {}", name);
        self.executors.insert(name, executor);
    }
}

impl ExecutorRegistry for TaskExecutorRegistry {
    fn get(&self, executor: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.get(executor).cloned().or_else(|| {
            self.executors
                .values()
                .find(|e| e.supports_executor(executor))
                .cloned()
        })
    }

    fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.executors.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}
