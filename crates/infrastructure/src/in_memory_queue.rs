use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use orchestrator_core::{
    models::{Delivery, Message},
    traits::MessageQueue,
    SchedulerError, SchedulerResult,
};

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    /// 已取出未确认的消息，键为投递凭证
    in_flight: HashMap<String, Message>,
    durable: bool,
}

/// 内存消息队列实现
///
/// 单进程部署使用。语义与外部代理一致：取出的消息在 `ack` 之前保留在
/// 待确认表里，`nack(requeue = true)` 会把消息放回队首。
#[derive(Default)]
pub struct InMemoryMessageQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    next_receipt: Mutex<u64>,
    notify: Notify,
}

/// 队列统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub total_queues: usize,
    pub ready_messages: usize,
    pub in_flight_messages: usize,
}

impl InMemoryMessageQueue {
    pub fn new() -> Self {
        info!("创建内存消息队列");
        Self::default()
    }

    pub async fn get_queue_stats(&self) -> QueueStats {
        let queues = self.queues.lock().await;
        QueueStats {
            total_queues: queues.len(),
            ready_messages: queues.values().map(|q| q.ready.len()).sum(),
            in_flight_messages: queues.values().map(|q| q.in_flight.len()).sum(),
        }
    }

    async fn try_take(&self, queue: &str) -> Option<Delivery> {
        let mut queues = self.queues.lock().await;
        let state = queues.get_mut(queue)?;
        let message = state.ready.pop_front()?;
        let receipt = {
            let mut next = self.next_receipt.lock().await;
            *next += 1;
            next.to_string()
        };
        state.in_flight.insert(receipt.clone(), message.clone());
        Some(Delivery {
            message,
            queue: queue.to_string(),
            receipt,
        })
    }

    async fn settle(&self, delivery: &Delivery) -> SchedulerResult<Message> {
        let mut queues = self.queues.lock().await;
        queues
            .get_mut(&delivery.queue)
            .and_then(|state| state.in_flight.remove(&delivery.receipt))
            .ok_or_else(|| {
                SchedulerError::MessageQueue(format!(
                    "未知的投递凭证: {}/{}",
                    delivery.queue, delivery.receipt
                ))
            })
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn enqueue(&self, queue: &str, message: &Message) -> SchedulerResult<()> {
        {
            let mut queues = self.queues.lock().await;
            queues
                .entry(queue.to_string())
                .or_default()
                .ready
                .push_back(message.clone());
        }
        debug!("消息已入队: {} -> {}", message.id, queue);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn dequeue(&self, queue: &str, timeout: Duration) -> SchedulerResult<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // 先登记等待再检查队列，避免错过检查与等待之间的入队通知
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queue).await {
                return Ok(Some(delivery));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> SchedulerResult<()> {
        self.settle(delivery).await?;
        debug!("消息已确认: {}", delivery.message.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> SchedulerResult<()> {
        let message = self.settle(delivery).await?;
        if requeue {
            {
                let mut queues = self.queues.lock().await;
                queues
                    .entry(delivery.queue.clone())
                    .or_default()
                    .ready
                    .push_front(message);
            }
            self.notify.notify_waiters();
        } else {
            warn!("消息被丢弃: {}", delivery.message.id);
        }
        Ok(())
    }

    async fn create_queue(&self, queue: &str, durable: bool) -> SchedulerResult<()> {
        let mut queues = self.queues.lock().await;
        queues.entry(queue.to_string()).or_default().durable = durable;
        Ok(())
    }

    async fn queue_size(&self, queue: &str) -> SchedulerResult<u32> {
        let queues = self.queues.lock().await;
        Ok(queues.get(queue).map_or(0, |q| q.ready.len() as u32))
    }

    async fn purge_queue(&self, queue: &str) -> SchedulerResult<()> {
        let mut queues = self.queues.lock().await;
        if let Some(state) = queues.get_mut(queue) {
            let purged = state.ready.len();
            state.ready.clear();
            info!("清空队列 {} ({} 条消息, durable={})", queue, purged, state.durable);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use orchestrator_core::models::{ExecutionRequest, RetryPolicy};
    use serde_json::json;
    use std::sync::Arc;

    fn message(task_instance_id: i64) -> Message {
        Message::task_execution(ExecutionRequest {
            task_instance_id,
            run_id: 1,
            workflow_name: "wf".into(),
            task_id: "a".into(),
            executor: "noop".into(),
            params: json!({}),
            logical_date: Utc::now(),
            timeout_seconds: None,
            retry: RetryPolicy::default(),
        })
    }

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let queue = InMemoryMessageQueue::new();
        queue.create_queue("q", true).await.unwrap();
        queue.enqueue("q", &message(1)).await.unwrap();
        queue.enqueue("q", &message(2)).await.unwrap();
        assert_eq!(queue.queue_size("q").await.unwrap(), 2);

        let first = queue
            .dequeue("q", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.message.task_instance_id(), 1);
        assert_eq!(queue.queue_size("q").await.unwrap(), 1);

        queue.ack(&first).await.unwrap();
        assert!(queue.ack(&first).await.is_err());
        assert_eq!(queue.get_queue_stats().await.in_flight_messages, 0);
    }

    #[tokio::test]
    async fn test_dequeue_times_out_on_empty_queue() {
        let queue = InMemoryMessageQueue::new();
        let started = Instant::now();
        let got = queue.dequeue("empty", Duration::from_millis(30)).await.unwrap();
        assert!(got.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(InMemoryMessageQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue("q", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue("q", &message(9)).await.unwrap();
        let delivery = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.message.task_instance_id(), 9);
    }

    #[tokio::test]
    async fn test_nack_requeue_puts_message_back_at_front() {
        let queue = InMemoryMessageQueue::new();
        queue.enqueue("q", &message(1)).await.unwrap();
        queue.enqueue("q", &message(2)).await.unwrap();

        let first = queue.dequeue("q", Duration::ZERO).await.unwrap().unwrap();
        queue.nack(&first, true).await.unwrap();
        let again = queue.dequeue("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.message.id, first.message.id);

        queue.nack(&again, false).await.unwrap();
        assert_eq!(queue.queue_size("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_purge() {
        let queue = InMemoryMessageQueue::new();
        for i in 0..5 {
            queue.enqueue("q", &message(i)).await.unwrap();
        }
        queue.purge_queue("q").await.unwrap();
        assert_eq!(queue.queue_size("q").await.unwrap(), 0);
    }
}
