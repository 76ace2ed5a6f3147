use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use orchestrator_core::models::{
    FailureKind, RetryPolicy, RunState, StateTransition, TaskInstance, TaskState,
};

/// 重试等待的绝对上限（十年），保证 `retry_at` 可以写入存储
const MAX_RETRY_DELAY_SECONDS: f64 = 10.0 * 365.0 * 86_400.0;

/// 第 `attempt` 次执行失败后的重试等待：指数退避、封顶、最多 10% 抖动
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(32) as i32;
    let base = policy.backoff_seconds as f64 * policy.backoff_multiplier.max(1.0).powi(exp);
    let capped = base
        .min(policy.max_backoff_seconds as f64)
        .min(MAX_RETRY_DELAY_SECONDS)
        .max(0.0);
    let jitter = if capped > 0.0 {
        rand::rng().random_range(0.0..=capped * 0.1)
    } else {
        0.0
    };
    Duration::milliseconds(((capped + jitter) * 1000.0) as i64)
}

/// running 实例执行失败后的状态转换
///
/// 可重试且次数未用完 → pending（带 retry_at），否则 → failed。
pub fn failure_transition(
    instance: &TaskInstance,
    policy: &RetryPolicy,
    kind: FailureKind,
    reason: &str,
    now: DateTime<Utc>,
) -> StateTransition {
    if kind == FailureKind::Retryable && instance.attempts_remaining() {
        let retry_at = now
            .checked_add_signed(retry_delay(policy, instance.attempt))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        StateTransition::to(TaskState::Pending)
            .with_error(kind, reason)
            .with_retry_at(retry_at)
    } else {
        StateTransition::to(TaskState::Failed).with_error(kind, reason)
    }
}

/// 所有任务实例都到达终态时得出运行实例的最终状态
pub fn run_outcome(instances: &[TaskInstance]) -> Option<RunState> {
    if instances.is_empty() || !instances.iter().all(|ti| ti.state.is_terminal()) {
        return None;
    }
    if instances.iter().all(|ti| ti.state == TaskState::Succeeded) {
        Some(RunState::Success)
    } else {
        Some(RunState::Failed)
    }
}
