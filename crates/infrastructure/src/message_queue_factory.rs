use std::sync::Arc;

use tracing::{debug, info};

use orchestrator_core::{
    config::{MessageQueueConfig, MessageQueueType},
    traits::MessageQueue,
    SchedulerResult,
};

use crate::{InMemoryMessageQueue, RabbitMQMessageQueue, RedisMessageQueue};

pub struct MessageQueueFactory;

impl MessageQueueFactory {
    pub async fn create(config: &MessageQueueConfig) -> SchedulerResult<Arc<dyn MessageQueue>> {
        config.validate()?;
        debug!("Creating message queue with type: {:?}", config.r#type);

        let queue: Arc<dyn MessageQueue> = match config.r#type {
            MessageQueueType::Memory => {
                info!("Initializing in-memory message queue");
                Arc::new(InMemoryMessageQueue::new())
            }
            MessageQueueType::Redis => {
                info!("Initializing Redis message queue");
                Arc::new(RedisMessageQueue::new(config.clone()).await?)
            }
            MessageQueueType::Rabbitmq => {
                info!("Initializing RabbitMQ message queue");
                Arc::new(RabbitMQMessageQueue::new(config.clone()).await?)
            }
        };
        queue.create_queue(&config.task_queue, true).await?;
        Ok(queue)
    }
}
