use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// Message queue type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageQueueType {
    #[default]
    Memory,
    Redis,
    Rabbitmq,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    pub r#type: MessageQueueType,
    pub url: String,
    pub task_queue: String,
    pub connection_timeout_seconds: u64,
    /// Redis/RabbitMQ 轮询间隔
    pub poll_interval_ms: u64,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            r#type: MessageQueueType::Memory,
            url: "redis://127.0.0.1:6379".to_string(),
            task_queue: "task_executions".to_string(),
            connection_timeout_seconds: 30,
            poll_interval_ms: 100,
        }
    }
}

impl MessageQueueConfig {
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.task_queue.is_empty() {
            return Err(SchedulerError::FatalConfig("任务队列名称不能为空".to_string()));
        }
        match self.r#type {
            MessageQueueType::Memory => {}
            MessageQueueType::Redis => {
                if !self.url.starts_with("redis://") && !self.url.starts_with("rediss://") {
                    return Err(SchedulerError::FatalConfig(
                        "Redis URL必须以redis://开头".to_string(),
                    ));
                }
            }
            MessageQueueType::Rabbitmq => {
                if !self.url.starts_with("amqp://") && !self.url.starts_with("amqps://") {
                    return Err(SchedulerError::FatalConfig(
                        "RabbitMQ URL必须以amqp://开头".to_string(),
                    ));
                }
            }
        }
        if self.poll_interval_ms == 0 {
            return Err(SchedulerError::FatalConfig("队列轮询间隔必须大于0".to_string()));
        }
        Ok(())
    }

    pub fn is_in_memory(&self) -> bool {
        self.r#type == MessageQueueType::Memory
    }
}
