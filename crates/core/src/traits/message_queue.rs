use std::time::Duration;

use async_trait::async_trait;

use crate::{
    models::{Delivery, Message},
    SchedulerResult,
};

/// 消息队列抽象接口
///
/// 至少一次投递：消费者处理完成后必须 `ack`，未确认的消息可能被重复投递。
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// 发布消息到指定队列
    async fn enqueue(&self, queue: &str, message: &Message) -> SchedulerResult<()>;

    /// 在超时时间内取出一条消息，队列为空时返回 None
    async fn dequeue(&self, queue: &str, timeout: Duration) -> SchedulerResult<Option<Delivery>>;

    /// 确认消息处理完成
    async fn ack(&self, delivery: &Delivery) -> SchedulerResult<()>;

    /// 拒绝消息，`requeue` 为真时重新入队
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> SchedulerResult<()>;

    /// 创建队列
    async fn create_queue(&self, queue: &str, durable: bool) -> SchedulerResult<()>;

    /// 获取队列中待消费的消息数量
    async fn queue_size(&self, queue: &str) -> SchedulerResult<u32>;

    /// 清空队列
    async fn purge_queue(&self, queue: &str) -> SchedulerResult<()>;
}
