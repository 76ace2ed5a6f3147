//! 元数据存储实现

pub mod memory;
pub mod sqlite;
pub mod timeout;

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use orchestrator_core::{
    config::{DatabaseBackend, DatabaseConfig},
    traits::MetadataStore,
    SchedulerResult,
};

pub use memory::InMemoryMetadataStore;
pub use sqlite::SqliteMetadataStore;
pub use timeout::TimeoutMetadataStore;

/// 按配置创建元数据存储，外层统一包上超时
pub struct MetadataStoreFactory;

impl MetadataStoreFactory {
    pub async fn create(config: &DatabaseConfig) -> SchedulerResult<Arc<dyn MetadataStore>> {
        config.validate()?;
        let inner: Arc<dyn MetadataStore> = match config.backend {
            DatabaseBackend::Memory => {
                info!("使用内存元数据存储");
                Arc::new(InMemoryMetadataStore::new())
            }
            DatabaseBackend::Sqlite => Arc::new(SqliteMetadataStore::connect(config).await?),
        };
        Ok(Arc::new(TimeoutMetadataStore::new(
            inner,
            Duration::from_secs(config.operation_timeout_seconds),
        )))
    }
}
