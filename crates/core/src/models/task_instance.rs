use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 运行实例中的单个任务，唯一键为 `(run_id, task_id)`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskInstance {
    pub id: i64,
    pub run_id: i64,
    pub workflow_name: String,
    pub task_id: String,
    pub state: TaskState,
    /// 已开始执行的次数
    pub attempt: u32,
    pub max_attempts: u32,
    pub worker_id: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// 最早可再次分发的时间
    pub retry_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    UpstreamFailed,
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 7] = [
        TaskState::Pending,
        TaskState::Queued,
        TaskState::Running,
        TaskState::Succeeded,
        TaskState::Failed,
        TaskState::UpstreamFailed,
        TaskState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Queued => "queued",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::UpstreamFailed => "upstream_failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded
                | TaskState::Failed
                | TaskState::UpstreamFailed
                | TaskState::Cancelled
        )
    }

    /// 计入并发上限的状态
    pub fn is_active(&self) -> bool {
        matches!(self, TaskState::Queued | TaskState::Running)
    }

    /// 下游据此判定为 upstream_failed
    pub fn blocks_downstream(&self) -> bool {
        matches!(
            self,
            TaskState::Failed | TaskState::UpstreamFailed | TaskState::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending, Queued) | (Pending, UpstreamFailed) | (Pending, Cancelled) => true,
            (Queued, Running) | (Queued, Pending) | (Queued, Cancelled) => true,
            (Running, Succeeded)
            | (Running, Failed)
            | (Running, Pending)
            | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("无效的任务状态: {s}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Retryable,
    Fatal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Retryable => "retryable",
            FailureKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retryable" => Ok(FailureKind::Retryable),
            "fatal" => Ok(FailureKind::Fatal),
            _ => Err(format!("无效的失败类型: {s}")),
        }
    }
}

/// 一次 CAS 状态写入所携带的变更
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub next: TaskState,
    pub worker_id: Option<String>,
    pub error_message: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub retry_at: Option<DateTime<Utc>>,
    pub increment_attempt: bool,
    /// 只在实例仍处于这次尝试时生效，防止过期的执行覆盖新一次尝试
    pub expected_attempt: Option<u32>,
}

impl StateTransition {
    pub fn to(next: TaskState) -> Self {
        Self {
            next,
            worker_id: None,
            error_message: None,
            failure_kind: None,
            retry_at: None,
            increment_attempt: false,
            expected_attempt: None,
        }
    }

    pub fn with_worker(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = Some(worker_id.into());
        self
    }

    pub fn with_error(mut self, kind: FailureKind, message: impl Into<String>) -> Self {
        self.failure_kind = Some(kind);
        self.error_message = Some(message.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_retry_at(mut self, retry_at: DateTime<Utc>) -> Self {
        self.retry_at = Some(retry_at);
        self
    }

    pub fn bump_attempt(mut self) -> Self {
        self.increment_attempt = true;
        self
    }

    pub fn for_attempt(mut self, attempt: u32) -> Self {
        self.expected_attempt = Some(attempt);
        self
    }

    /// 实例当前的尝试次数是否满足这次转换的要求
    pub fn matches_attempt(&self, attempt: u32) -> bool {
        self.expected_attempt.map_or(true, |expected| expected == attempt)
    }
}

impl TaskInstance {
    /// 在内存中套用一次状态转换，存储实现在 CAS 成功后落盘同样的结果
    pub fn apply_transition(&mut self, transition: &StateTransition, now: DateTime<Utc>) {
        self.state = transition.next;
        self.updated_at = now;
        if transition.increment_attempt {
            self.attempt += 1;
        }
        if let Some(worker_id) = &transition.worker_id {
            self.worker_id = Some(worker_id.clone());
        }
        match transition.next {
            TaskState::Pending => {
                self.queued_at = None;
                self.retry_at = transition.retry_at;
            }
            TaskState::Queued => {
                self.queued_at = Some(now);
                self.retry_at = None;
            }
            TaskState::Running => {
                self.started_at = Some(now);
                self.heartbeat_at = Some(now);
                self.ended_at = None;
            }
            _ => {
                self.ended_at = Some(now);
                self.retry_at = None;
            }
        }
        if transition.error_message.is_some() {
            self.error_message = transition.error_message.clone();
        }
        if transition.failure_kind.is_some() {
            self.failure_kind = transition.failure_kind;
        } else if transition.next == TaskState::Succeeded {
            self.failure_kind = None;
        }
    }

    /// retry_at 已到期（或未设置）
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.retry_at.map_or(true, |at| at <= now)
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(state: TaskState) -> TaskInstance {
        let now = Utc::now();
        TaskInstance {
            id: 1,
            run_id: 1,
            workflow_name: "wf".into(),
            task_id: "a".into(),
            state,
            attempt: 0,
            max_attempts: 3,
            worker_id: None,
            queued_at: None,
            started_at: None,
            ended_at: None,
            heartbeat_at: None,
            retry_at: None,
            error_message: None,
            failure_kind: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_allowed_transitions() {
        use TaskState::*;
        assert!(Pending.can_transition_to(Queued));
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Pending));
        assert!(Running.can_transition_to(Pending));
        assert!(Running.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Running));
        assert!(!Pending.can_transition_to(Succeeded));
        assert!(!Succeeded.can_transition_to(Pending));
        assert!(!UpstreamFailed.can_transition_to(Queued));
        assert!(!Cancelled.can_transition_to(Pending));
        for state in TaskState::ALL {
            if state.is_terminal() {
                assert!(TaskState::ALL.iter().all(|n| !state.can_transition_to(*n)));
            }
        }
    }

    #[test]
    fn test_state_string_round_trip() {
        for state in TaskState::ALL {
            assert_eq!(state.as_str().parse::<TaskState>().unwrap(), state);
        }
        assert!("done".parse::<TaskState>().is_err());
    }

    #[test]
    fn test_apply_running_then_retry() {
        let now = Utc::now();
        let mut ti = instance(TaskState::Queued);
        ti.apply_transition(
            &StateTransition::to(TaskState::Running)
                .with_worker("w1")
                .bump_attempt(),
            now,
        );
        assert_eq!(ti.attempt, 1);
        assert_eq!(ti.worker_id.as_deref(), Some("w1"));
        assert_eq!(ti.started_at, Some(now));

        let retry_at = now + chrono::Duration::seconds(30);
        ti.apply_transition(
            &StateTransition::to(TaskState::Pending)
                .with_error(FailureKind::Retryable, "exit 1")
                .with_retry_at(retry_at),
            now,
        );
        assert_eq!(ti.state, TaskState::Pending);
        assert_eq!(ti.retry_at, Some(retry_at));
        assert!(!ti.retry_due(now));
        assert!(ti.retry_due(retry_at));
        assert_eq!(ti.failure_kind, Some(FailureKind::Retryable));
    }

    #[test]
    fn test_apply_terminal_sets_ended_at() {
        let now = Utc::now();
        let mut ti = instance(TaskState::Running);
        ti.apply_transition(
            &StateTransition::to(TaskState::Failed).with_error(FailureKind::Fatal, "bad params"),
            now,
        );
        assert_eq!(ti.ended_at, Some(now));
        assert_eq!(ti.error_message.as_deref(), Some("bad params"));
    }

    #[test]
    fn test_attempt_guard() {
        let unguarded = StateTransition::to(TaskState::Succeeded);
        assert!(unguarded.matches_attempt(1));
        assert!(unguarded.matches_attempt(7));

        let guarded = StateTransition::to(TaskState::Succeeded).for_attempt(2);
        assert!(guarded.matches_attempt(2));
        assert!(!guarded.matches_attempt(1));
        assert!(!guarded.matches_attempt(3));
    }
}
