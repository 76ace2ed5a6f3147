use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::SchedulerResult;

/// 存储/队列调用点的重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 抖动比例，0.0 表示不加抖动
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// 第 `attempt` 次失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        let jitter = if self.jitter_factor > 0.0 {
            rand::rng().random_range(0.0..=capped * self.jitter_factor)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter) as u64)
    }
}

/// 对瞬时错误做带退避的重试，非瞬时错误立即返回
pub async fn retry_transient<T, F, Fut>(
    operation: &str,
    config: &RetryConfig,
    mut f: F,
) -> SchedulerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SchedulerResult<T>>,
{
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => {
                if attempt > 1 {
                    debug!("操作 {} 在第 {} 次尝试时成功", operation, attempt);
                }
                return Ok(v);
            }
            Err(e) if e.is_transient() && attempt < config.max_attempts.max(1) => {
                let delay = config.delay_for(attempt);
                warn!(
                    operation = operation,
                    attempt = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "瞬时错误，稍后重试: {}",
                    e
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
