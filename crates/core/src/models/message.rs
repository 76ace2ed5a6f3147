use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ExecutionRequest;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub message_type: MessageType,
    pub timestamp: DateTime<Utc>,
    pub retry_count: i32,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum MessageType {
    TaskExecution(ExecutionRequest),
}

impl Message {
    pub fn task_execution(request: ExecutionRequest) -> Self {
        let correlation_id = format!("run-{}", request.run_id);
        Self {
            id: Uuid::new_v4().to_string(),
            message_type: MessageType::TaskExecution(request),
            timestamp: Utc::now(),
            retry_count: 0,
            correlation_id: Some(correlation_id),
        }
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    pub fn task_instance_id(&self) -> i64 {
        match &self.message_type {
            MessageType::TaskExecution(req) => req.task_instance_id,
        }
    }

    pub fn serialize_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn deserialize_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn message_type_str(&self) -> &'static str {
        match &self.message_type {
            MessageType::TaskExecution(_) => "task_execution",
        }
    }

    pub fn routing_key(&self) -> String {
        match &self.message_type {
            MessageType::TaskExecution(req) => format!("task.execution.{}", req.executor),
        }
    }
}

/// 从队列取出、尚未确认的消息
///
/// `receipt` 由具体队列实现解释：RabbitMQ 为 delivery tag，
/// Redis 为处理列表中的原始负载，内存队列为消息ID。
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: Message,
    pub queue: String,
    pub receipt: String,
}
