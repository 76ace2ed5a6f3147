use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
    Queue,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use orchestrator_core::{
    config::MessageQueueConfig,
    models::{Delivery, Message},
    traits::MessageQueue,
    SchedulerError, SchedulerResult,
};

/// RabbitMQ消息队列实现
///
/// 通过 `basic_get` 轮询取消息，投递凭证为 delivery tag。
/// 同一通道上的 delivery tag 才有效，所以所有操作共用一个通道。
pub struct RabbitMQMessageQueue {
    connection: Connection,
    channel: Mutex<Channel>,
    config: MessageQueueConfig,
}

impl RabbitMQMessageQueue {
    pub async fn new(config: MessageQueueConfig) -> SchedulerResult<Self> {
        let connect = Connection::connect(&config.url, ConnectionProperties::default());
        let connection = tokio::time::timeout(
            Duration::from_secs(config.connection_timeout_seconds),
            connect,
        )
        .await
        .map_err(|_| SchedulerError::Timeout {
            operation: "连接RabbitMQ".to_string(),
        })?
        .map_err(|e| SchedulerError::MessageQueue(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("创建通道失败: {e}")))?;

        info!("成功连接到RabbitMQ: {}", config.url);

        let queue = Self {
            connection,
            channel: Mutex::new(channel),
            config,
        };
        queue.create_queue(&queue.config.task_queue, true).await?;
        Ok(queue)
    }

    async fn declare_queue(
        &self,
        channel: &Channel,
        queue_name: &str,
        durable: bool,
    ) -> SchedulerResult<Queue> {
        let queue = channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                SchedulerError::MessageQueue(format!("声明队列 {queue_name} 失败: {e}"))
            })?;

        debug!("队列 {} 声明成功", queue_name);
        Ok(queue)
    }

    fn delivery_tag(delivery: &Delivery) -> SchedulerResult<u64> {
        delivery.receipt.parse().map_err(|_| {
            SchedulerError::MessageQueue(format!("无效的delivery tag: {}", delivery.receipt))
        })
    }

    fn is_not_found(error: &lapin::Error) -> bool {
        let message = error.to_string();
        message.contains("NOT_FOUND") || message.contains("404")
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) -> SchedulerResult<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RabbitMQMessageQueue {
    async fn enqueue(&self, queue: &str, message: &Message) -> SchedulerResult<()> {
        let payload = message.serialize_bytes()?;
        let channel = self.channel.lock().await;

        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2), // 2 = persistent
            )
            .await
            .map_err(|e| {
                SchedulerError::MessageQueue(format!("发布消息到队列 {queue} 失败: {e}"))
            })?;

        confirm
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("消息发布确认失败: {e}")))?;

        debug!("消息已发布到队列: {}", queue);
        Ok(())
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> SchedulerResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            let got = {
                let channel = self.channel.lock().await;
                channel.basic_get(queue, BasicGetOptions::default()).await
            };
            match got {
                Ok(Some(got)) => {
                    let tag = got.delivery.delivery_tag;
                    return match Message::deserialize_bytes(&got.delivery.data) {
                        Ok(message) => Ok(Some(Delivery {
                            message,
                            queue: queue.to_string(),
                            receipt: tag.to_string(),
                        })),
                        Err(e) => {
                            // 无法解析的消息直接丢弃，避免反复投递
                            let channel = self.channel.lock().await;
                            channel
                                .basic_nack(
                                    tag,
                                    BasicNackOptions {
                                        requeue: false,
                                        ..Default::default()
                                    },
                                )
                                .await
                                .map_err(|e| {
                                    SchedulerError::MessageQueue(format!("拒绝消息失败: {e}"))
                                })?;
                            Err(SchedulerError::Serialization(format!("反序列化消息: {e}")))
                        }
                    };
                }
                Ok(None) => {}
                Err(e) if Self::is_not_found(&e) => {
                    debug!("队列 {} 不存在，视为空队列", queue);
                }
                Err(e) => {
                    return Err(SchedulerError::MessageQueue(format!(
                        "从队列 {queue} 获取消息失败: {e}"
                    )))
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> SchedulerResult<()> {
        let tag = Self::delivery_tag(delivery)?;
        let channel = self.channel.lock().await;
        channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("确认消息失败: {e}")))?;
        debug!("确认消息: {}", delivery.message.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> SchedulerResult<()> {
        let tag = Self::delivery_tag(delivery)?;
        let channel = self.channel.lock().await;
        channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    requeue,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("拒绝消息失败: {e}")))?;
        debug!("拒绝消息: {}, 重新入队: {}", delivery.message.id, requeue);
        Ok(())
    }

    async fn create_queue(&self, queue: &str, durable: bool) -> SchedulerResult<()> {
        let channel = self.channel.lock().await;
        self.declare_queue(&channel, queue, durable).await?;
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> SchedulerResult<u32> {
        let channel = self.channel.lock().await;
        let queue_info = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;

        match queue_info {
            Ok(info) => Ok(info.message_count()),
            Err(e) if Self::is_not_found(&e) => Ok(0),
            Err(e) => Err(SchedulerError::MessageQueue(format!(
                "获取队列 {queue} 信息失败: {e}"
            ))),
        }
    }

    async fn purge_queue(&self, queue: &str) -> SchedulerResult<()> {
        let channel = self.channel.lock().await;
        channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("清空队列 {queue} 失败: {e}")))?;

        debug!("队列 {} 已清空", queue);
        Ok(())
    }
}
