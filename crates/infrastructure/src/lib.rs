pub mod definitions;
pub mod in_memory_queue;
pub mod message_queue;
pub mod message_queue_factory;
pub mod observability;
pub mod redis_queue;
pub mod store;

pub use definitions::{
    load_definitions_dir, parse_definition, FileDefinitionSource, StaticDefinitionSource,
};
pub use in_memory_queue::{InMemoryMessageQueue, QueueStats};
pub use message_queue::RabbitMQMessageQueue;
pub use message_queue_factory::MessageQueueFactory;
pub use observability::{init_metrics, MetricsCollector, StructuredLogger, TaskTracer};
pub use redis_queue::RedisMessageQueue;
pub use store::{
    InMemoryMetadataStore, MetadataStoreFactory, SqliteMetadataStore, TimeoutMetadataStore,
};
