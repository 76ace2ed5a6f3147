use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// 元数据存储后端
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseBackend {
    Memory,
    #[default]
    Sqlite,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub backend: DatabaseBackend,
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout_seconds: u64,
    /// 单次存储调用的超时，必须大于0
    pub operation_timeout_seconds: u64,
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Sqlite,
            url: "sqlite://orchestrator.db".to_string(),
            max_connections: 10,
            min_connections: 1,
            connection_timeout_seconds: 30,
            operation_timeout_seconds: 10,
            busy_timeout_ms: 5_000,
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.operation_timeout_seconds == 0 {
            return Err(SchedulerError::FatalConfig(
                "database.operation_timeout_seconds 必须大于0".to_string(),
            ));
        }
        if self.backend == DatabaseBackend::Sqlite {
            if self.url.is_empty() {
                return Err(SchedulerError::FatalConfig("数据库URL不能为空".to_string()));
            }
            if !self.url.starts_with("sqlite:") {
                return Err(SchedulerError::FatalConfig(
                    "数据库URL必须是SQLite格式".to_string(),
                ));
            }
            if self.max_connections == 0 {
                return Err(SchedulerError::FatalConfig("最大连接数必须大于0".to_string()));
            }
            if self.min_connections > self.max_connections {
                return Err(SchedulerError::FatalConfig(
                    "最小连接数不能大于最大连接数".to_string(),
                ));
            }
            if self.connection_timeout_seconds == 0 {
                return Err(SchedulerError::FatalConfig("连接超时时间必须大于0".to_string()));
            }
        }
        Ok(())
    }
}
