pub mod api_observability;
pub mod app_config;
pub mod database;
pub mod dispatcher_worker;
pub mod message_queue;
pub mod scheduler;

pub use api_observability::{ApiConfig, ObservabilityConfig};
pub use app_config::AppConfig;
pub use database::{DatabaseBackend, DatabaseConfig};
pub use dispatcher_worker::{DispatcherConfig, ExecutorStrategyKind, WorkerConfig};
pub use message_queue::{MessageQueueConfig, MessageQueueType};
pub use scheduler::SchedulerConfig;
