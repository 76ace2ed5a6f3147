use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    database::DatabaseConfig,
    dispatcher_worker::{DispatcherConfig, WorkerConfig},
    message_queue::MessageQueueConfig,
    scheduler::SchedulerConfig,
};
use crate::{error_handling::RetryConfig, SchedulerError, SchedulerResult};

/// System configuration
///
/// 启动时读取一次，之后不再变化。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub message_queue: MessageQueueConfig,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub worker: WorkerConfig,
    pub retry: RetryConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: ORCHESTRATOR_, nested keys separated by `__`)
    pub fn load(config_path: Option<&str>) -> SchedulerResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(SchedulerError::FatalConfig(format!("配置文件不存在: {path}")));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/orchestrator.toml", "orchestrator.toml"];
            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("ORCHESTRATOR")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| SchedulerError::FatalConfig(format!("构建配置失败: {e}")))?
            .try_deserialize()
            .map_err(|e| SchedulerError::FatalConfig(format!("反序列化配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> SchedulerResult<Self> {
        let config: AppConfig = toml::from_str(toml_str)
            .map_err(|e| SchedulerError::FatalConfig(format!("解析TOML配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> SchedulerResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SchedulerError::Serialization(format!("序列化配置为TOML失败: {e}")))
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        self.database.validate()?;
        self.message_queue.validate()?;
        self.scheduler.validate()?;
        self.dispatcher.validate()?;
        self.worker.validate()?;
        self.api.validate()?;
        self.observability.validate()?;
        if self.retry.max_attempts == 0 {
            return Err(SchedulerError::FatalConfig(
                "retry.max_attempts 必须大于0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatabaseBackend, ExecutorStrategyKind, MessageQueueType};
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.scheduler.paused_on_creation);
        assert!(!config.scheduler.catchup_by_default);
        assert_eq!(config.scheduler.max_backfill_runs_per_cycle, 1000);
    }

    #[test]
    fn test_partial_toml_falls_back_to_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [database]
            backend = "memory"

            [dispatcher]
            parallelism = 4
            executor_strategy = "remote_queue"

            [message_queue]
            type = "redis"
            url = "redis://localhost:6379"
            "#,
        )
        .unwrap();
        assert_eq!(config.database.backend, DatabaseBackend::Memory);
        assert_eq!(config.dispatcher.parallelism, 4);
        assert_eq!(
            config.dispatcher.executor_strategy,
            ExecutorStrategyKind::RemoteQueue
        );
        assert_eq!(config.message_queue.r#type, MessageQueueType::Redis);
        assert_eq!(config.worker.max_concurrent_tasks, 5);
    }

    #[test]
    fn test_zero_operation_timeout_is_fatal() {
        let err = AppConfig::from_toml(
            r#"
            [database]
            operation_timeout_seconds = 0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, SchedulerError::FatalConfig(_)));
    }

    #[test]
    fn test_zero_parallelism_is_fatal() {
        let err = AppConfig::from_toml("[dispatcher]\nparallelism = 0\n").unwrap_err();
        assert!(matches!(err, SchedulerError::FatalConfig(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[scheduler]\ncycle_interval_ms = 250\n").unwrap();
        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.scheduler.cycle_interval_ms, 250);
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(AppConfig::load(Some("/nonexistent/orchestrator.toml")).is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = AppConfig::default();
        let raw = config.to_toml().unwrap();
        let back = AppConfig::from_toml(&raw).unwrap();
        assert_eq!(back.dispatcher.parallelism, config.dispatcher.parallelism);
    }
}
