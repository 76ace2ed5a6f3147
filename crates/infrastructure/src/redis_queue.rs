use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, FromRedisValue};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use orchestrator_core::{
    config::MessageQueueConfig,
    models::{Delivery, Message},
    traits::MessageQueue,
    SchedulerError, SchedulerResult,
};

/// 基于 Redis 列表的可靠队列
///
/// 取消息时用 `LMOVE` 把负载原子地移到 `{queue}:processing`，确认时从处理列表删除。
/// 投递凭证就是原始负载。
pub struct RedisMessageQueue {
    connection: ConnectionManager,
    config: MessageQueueConfig,
}

impl RedisMessageQueue {
    pub async fn new(config: MessageQueueConfig) -> SchedulerResult<Self> {
        let client = Client::open(config.url.as_str()).map_err(|e| {
            SchedulerError::MessageQueue(format!("Failed to create Redis client: {e}"))
        })?;
        let connection = tokio::time::timeout(
            Duration::from_secs(config.connection_timeout_seconds),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| SchedulerError::Timeout {
            operation: "连接Redis".to_string(),
        })?
        .map_err(|e| SchedulerError::MessageQueue(format!("连接Redis失败: {e}")))?;

        info!("成功连接到Redis: {}", config.url);
        Ok(Self { connection, config })
    }

    fn processing_list(queue: &str) -> String {
        format!("{queue}:processing")
    }

    async fn execute<T: FromRedisValue>(&self, cmd: &redis::Cmd, what: &str) -> SchedulerResult<T> {
        let mut conn = self.connection.clone();
        cmd.query_async(&mut conn)
            .await
            .map_err(|e| SchedulerError::MessageQueue(format!("Redis {what} 失败: {e}")))
    }

    async fn remove_from_processing(&self, delivery: &Delivery) -> SchedulerResult<bool> {
        let mut cmd = redis::cmd("LREM");
        cmd.arg(Self::processing_list(&delivery.queue))
            .arg(1)
            .arg(&delivery.receipt);
        let removed: i64 = self.execute(&cmd, "LREM").await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl MessageQueue for RedisMessageQueue {
    async fn enqueue(&self, queue: &str, message: &Message) -> SchedulerResult<()> {
        let payload = serde_json::to_string(message)?;
        let mut cmd = redis::cmd("LPUSH");
        cmd.arg(queue).arg(payload);
        let _: i64 = self.execute(&cmd, "LPUSH").await?;
        debug!("消息已发布到队列: {}", queue);
        Ok(())
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> SchedulerResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        // 连接是多路复用的，不能使用阻塞命令，这里轮询
        let mut cmd = redis::cmd("LMOVE");
        cmd.arg(queue)
            .arg(Self::processing_list(queue))
            .arg("RIGHT")
            .arg("LEFT");
        loop {
            let payload: Option<String> = self.execute(&cmd, "LMOVE").await?;
            if let Some(payload) = payload {
                return match Message::deserialize_bytes(payload.as_bytes()) {
                    Ok(message) => Ok(Some(Delivery {
                        message,
                        queue: queue.to_string(),
                        receipt: payload,
                    })),
                    Err(e) => {
                        warn!("丢弃无法解析的消息: {}", e);
                        let mut lrem = redis::cmd("LREM");
                        lrem.arg(Self::processing_list(queue)).arg(1).arg(&payload);
                        let _: i64 = self.execute(&lrem, "LREM").await?;
                        Err(SchedulerError::Serialization(format!("反序列化消息: {e}")))
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> SchedulerResult<()> {
        if !self.remove_from_processing(delivery).await? {
            warn!("确认的消息不在处理列表中: {}", delivery.message.id);
        }
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> SchedulerResult<()> {
        self.remove_from_processing(delivery).await?;
        if requeue {
            // 从右侧出队，RPUSH 放回队首
            let mut cmd = redis::cmd("RPUSH");
            cmd.arg(&delivery.queue).arg(&delivery.receipt);
            let _: i64 = self.execute(&cmd, "RPUSH").await?;
        }
        debug!("拒绝消息: {}, 重新入队: {}", delivery.message.id, requeue);
        Ok(())
    }

    async fn create_queue(&self, queue: &str, durable: bool) -> SchedulerResult<()> {
        // Redis 列表在首次写入时创建
        debug!("Redis队列无需预先创建: {} (durable: {})", queue, durable);
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> SchedulerResult<u32> {
        let mut cmd = redis::cmd("LLEN");
        cmd.arg(queue);
        let size: u64 = self.execute(&cmd, "LLEN").await?;
        Ok(size.min(u32::MAX as u64) as u32)
    }

    async fn purge_queue(&self, queue: &str) -> SchedulerResult<()> {
        let mut cmd = redis::cmd("DEL");
        cmd.arg(queue);
        let _: i64 = self.execute(&cmd, "DEL").await?;
        info!("队列 {} 已清空", queue);
        Ok(())
    }
}
