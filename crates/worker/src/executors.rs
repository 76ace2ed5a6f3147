use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use orchestrator_core::{
    models::{FailureKind, TaskExecutionContext, TaskResult},
    traits::TaskExecutor,
    SchedulerError, SchedulerResult,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{oneshot, RwLock};
use tracing::{info, warn};

/// 正在执行的任务及其取消信号
#[derive(Default)]
struct RunningTasks {
    inner: RwLock<HashMap<i64, oneshot::Sender<()>>>,
}

impl RunningTasks {
    async fn register(&self, task_instance_id: i64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.write().await.insert(task_instance_id, tx);
        rx
    }

    async fn finish(&self, task_instance_id: i64) {
        self.inner.write().await.remove(&task_instance_id);
    }

    async fn cancel(&self, task_instance_id: i64) -> bool {
        match self.inner.write().await.remove(&task_instance_id) {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    async fn contains(&self, task_instance_id: i64) -> bool {
        self.inner.read().await.contains_key(&task_instance_id)
    }
}

fn parse_params<T: for<'de> Deserialize<'de>>(
    executor: &str,
    params: &serde_json::Value,
) -> SchedulerResult<T> {
    serde_json::from_value(params.clone()).map_err(|e| {
        SchedulerError::InvalidTaskParams(format!("解析{executor}任务参数失败: {e}"))
    })
}

async fn read_lines<R: AsyncRead + Unpin>(reader: R) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        collected.push(line);
    }
    collected
}

/// Shell任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellTaskParams {
    /// 要执行的命令；未给出 `args` 时整体交给 `sh -c`
    pub command: String,
    #[serde(default)]
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env_vars: Option<HashMap<String, String>>,
    /// 视为不可重试失败的退出码
    #[serde(default)]
    pub fatal_exit_codes: Vec<i32>,
}

/// Shell任务执行器
#[derive(Default)]
pub struct ShellExecutor {
    running: RunningTasks,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    fn build_command(params: &ShellTaskParams) -> Command {
        let mut cmd = match &params.args {
            Some(args) => {
                let mut cmd = Command::new(&params.command);
                cmd.args(args);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(&params.command);
                cmd
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in params.env_vars.iter().flatten() {
            cmd.env(key, value);
        }
        cmd
    }
}

#[async_trait]
impl TaskExecutor for ShellExecutor {
    fn name(&self) -> &str {
        "shell"
    }

    async fn execute_task(&self, context: &TaskExecutionContext) -> SchedulerResult<TaskResult> {
        let start_time = Instant::now();
        let params: ShellTaskParams = parse_params("Shell", &context.params)?;

        info!(
            "执行Shell任务: task_instance_id={}, command={}, args={:?}",
            context.task_instance_id, params.command, params.args
        );

        let mut cmd = Self::build_command(&params);
        cmd.env("ORCHESTRATOR_RUN_ID", context.run_id.to_string())
            .env("ORCHESTRATOR_TASK_ID", &context.task_id)
            .env("ORCHESTRATOR_LOGICAL_DATE", context.logical_date.to_rfc3339())
            .env("ORCHESTRATOR_ATTEMPT", context.attempt.to_string());

        let mut child = cmd
            .spawn()
            .map_err(|e| SchedulerError::TaskExecution(format!("启动Shell命令失败: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SchedulerError::TaskExecution("无法获取stderr".to_string()))?;

        let cancelled = self.running.register(context.task_instance_id).await;
        let finished = async move {
            let (out, err) = tokio::join!(read_lines(stdout), read_lines(stderr));
            (out, err, child.wait().await)
        };

        // 取消时丢弃 future，kill_on_drop 负责结束子进程
        let completed = tokio::select! {
            result = finished => Some(result),
            _ = cancelled => None,
        };
        self.running.finish(context.task_instance_id).await;
        let execution_time_ms = start_time.elapsed().as_millis() as u64;

        let Some((stdout_lines, stderr_lines, status)) = completed else {
            return Ok(TaskResult::failure(
                FailureKind::Retryable,
                "任务已取消",
                None,
                execution_time_ms,
            ));
        };
        let status =
            status.map_err(|e| SchedulerError::TaskExecution(format!("等待进程结束失败: {e}")))?;

        let exit_code = status.code();
        let result = if status.success() {
            TaskResult::success(stdout_lines.join("\n"), execution_time_ms)
        } else {
            let kind = match exit_code {
                Some(code) if params.fatal_exit_codes.contains(&code) => FailureKind::Fatal,
                _ => FailureKind::Retryable,
            };
            let message = if stderr_lines.is_empty() {
                format!("命令执行失败，退出码: {exit_code:?}")
            } else {
                stderr_lines.join("\n")
            };
            let mut result = TaskResult::failure(kind, message, exit_code, execution_time_ms);
            if !stdout_lines.is_empty() {
                result.output = Some(stdout_lines.join("\n"));
            }
            result
        };

        info!(
            "Shell任务执行完成: task_instance_id={}, success={}, exit_code={:?}, duration={}ms",
            context.task_instance_id, result.success, exit_code, result.execution_time_ms
        );
        Ok(result)
    }

    async fn cancel(&self, task_instance_id: i64) -> SchedulerResult<()> {
        if self.running.cancel(task_instance_id).await {
            info!("已取消Shell任务: task_instance_id={}", task_instance_id);
        } else {
            warn!("未找到要取消的Shell任务: task_instance_id={}", task_instance_id);
        }
        Ok(())
    }

    async fn is_running(&self, task_instance_id: i64) -> SchedulerResult<bool> {
        Ok(self.running.contains(task_instance_id).await)
    }
}

/// HTTP任务参数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpTaskParams {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// 字符串原样发送，其他 JSON 值按 JSON 发送
    #[serde(default)]
    pub body: Option<serde_json::Value>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// HTTP任务执行器
///
/// 2xx 成功；4xx 为不可重试失败；5xx 与网络错误可重试。
pub struct HttpExecutor {
    client: reqwest::Client,
    running: RunningTasks,
}

impl HttpExecutor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            running: RunningTasks::default(),
        }
    }

    fn build_request(&self, params: &HttpTaskParams) -> SchedulerResult<reqwest::RequestBuilder> {
        let method = params.method.as_deref().unwrap_or("GET").to_uppercase();
        let mut request = match method.as_str() {
            "GET" => self.client.get(&params.url),
            "POST" => self.client.post(&params.url),
            "PUT" => self.client.put(&params.url),
            "DELETE" => self.client.delete(&params.url),
            "PATCH" => self.client.patch(&params.url),
            "HEAD" => self.client.head(&params.url),
            _ => {
                return Err(SchedulerError::InvalidTaskParams(format!(
                    "不支持的HTTP方法: {method}"
                )));
            }
        };
        if let Some(timeout) = params.timeout_seconds {
            request = request.timeout(Duration::from_secs(timeout));
        }
        for (key, value) in params.headers.iter().flatten() {
            request = request.header(key, value);
        }
        request = match &params.body {
            Some(serde_json::Value::String(text)) => request.body(text.clone()),
            Some(value) => request.json(value),
            None => request,
        };
        Ok(request)
    }
}

impl Default for HttpExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskExecutor for HttpExecutor {
    fn name(&self) -> &str {
        "http"
    }

    async fn execute_task(&self, context: &TaskExecutionContext) -> SchedulerResult<TaskResult> {
        let start_time = Instant::now();
        let params: HttpTaskParams = parse_params("HTTP", &context.params)?;
        let request = self.build_request(&params)?;

        info!(
            "执行HTTP任务: task_instance_id={}, method={}, url={}",
            context.task_instance_id,
            params.method.as_deref().unwrap_or("GET"),
            params.url
        );

        let cancelled = self.running.register(context.task_instance_id).await;
        let response = tokio::select! {
            response = request.send() => Some(response),
            _ = cancelled => None,
        };
        self.running.finish(context.task_instance_id).await;

        let result = match response {
            None => TaskResult::failure(
                FailureKind::Retryable,
                "任务已取消",
                None,
                start_time.elapsed().as_millis() as u64,
            ),
            Some(Ok(response)) => {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|e| format!("读取响应体失败: {e}"));
                let elapsed = start_time.elapsed().as_millis() as u64;
                let code = Some(status.as_u16() as i32);
                if status.is_success() {
                    let mut result = TaskResult::success(body, elapsed);
                    result.exit_code = code;
                    result
                } else {
                    let kind = if status.is_client_error() {
                        FailureKind::Fatal
                    } else {
                        FailureKind::Retryable
                    };
                    TaskResult::failure(
                        kind,
                        format!("HTTP请求失败，状态码: {}", status.as_u16()),
                        code,
                        elapsed,
                    )
                }
            }
            Some(Err(e)) => TaskResult::failure(
                FailureKind::Retryable,
                format!("HTTP请求失败: {e}"),
                None,
                start_time.elapsed().as_millis() as u64,
            ),
        };

        info!(
            "HTTP任务执行完成: task_instance_id={}, success={}, status={:?}, duration={}ms",
            context.task_instance_id, result.success, result.exit_code, result.execution_time_ms
        );
        Ok(result)
    }

    async fn cancel(&self, task_instance_id: i64) -> SchedulerResult<()> {
        if !self.running.cancel(task_instance_id).await {
            warn!("未找到要取消的HTTP任务: task_instance_id={}", task_instance_id);
        }
        Ok(())
    }

    async fn is_running(&self, task_instance_id: i64) -> SchedulerResult<bool> {
        Ok(self.running.contains(task_instance_id).await)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct NoopTaskParams {
    #[serde(default)]
    sleep_ms: u64,
}

/// 不做任何事的执行器，可选 `sleep_ms` 模拟耗时
#[derive(Default)]
pub struct NoopExecutor {
    running: RunningTasks,
}

impl NoopExecutor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskExecutor for NoopExecutor {
    fn name(&self) -> &str {
        "noop"
    }

    async fn execute_task(&self, context: &TaskExecutionContext) -> SchedulerResult<TaskResult> {
        let start_time = Instant::now();
        let params: NoopTaskParams = if context.params.is_null() {
            NoopTaskParams::default()
        } else {
            parse_params("Noop", &context.params)?
        };

        let cancelled = self.running.register(context.task_instance_id).await;
        let completed = tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(params.sleep_ms)) => true,
            _ = cancelled => false,
        };
        self.running.finish(context.task_instance_id).await;

        let elapsed = start_time.elapsed().as_millis() as u64;
        if completed {
            Ok(TaskResult::success("noop", elapsed))
        } else {
            Ok(TaskResult::failure(
                FailureKind::Retryable,
                "任务已取消",
                None,
                elapsed,
            ))
        }
    }

    async fn cancel(&self, task_instance_id: i64) -> SchedulerResult<()> {
        self.running.cancel(task_instance_id).await;
        Ok(())
    }

    async fn is_running(&self, task_instance_id: i64) -> SchedulerResult<bool> {
        Ok(self.running.contains(task_instance_id).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn context(id: i64, executor: &str, params: serde_json::Value) -> TaskExecutionContext {
        TaskExecutionContext {
            task_instance_id: id,
            run_id: 1,
            workflow_name: "wf".to_string(),
            task_id: "t".to_string(),
            executor: executor.to_string(),
            params,
            logical_date: Utc::now(),
            attempt: 1,
            worker_id: "w1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_shell_success_captures_stdout() {
        let executor = ShellExecutor::new();
        let result = executor
            .execute_task(&context(1, "shell", json!({"command": "echo hello"})))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output.as_deref(), Some("hello"));
        assert_eq!(result.exit_code, Some(0));
        assert!(!executor.is_running(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_shell_exit_code_classification() {
        let executor = ShellExecutor::new();
        let retryable = executor
            .execute_task(&context(1, "shell", json!({"command": "exit 3"})))
            .await
            .unwrap();
        assert!(!retryable.success);
        assert_eq!(retryable.exit_code, Some(3));
        assert_eq!(retryable.failure_kind, Some(FailureKind::Retryable));

        let fatal = executor
            .execute_task(&context(
                2,
                "shell",
                json!({"command": "exit 3", "fatal_exit_codes": [3]}),
            ))
            .await
            .unwrap();
        assert_eq!(fatal.failure_kind, Some(FailureKind::Fatal));
    }

    #[tokio::test]
    async fn test_shell_args_and_context_env() {
        let executor = ShellExecutor::new();
        let result = executor
            .execute_task(&context(
                1,
                "shell",
                json!({"command": "sh", "args": ["-c", "echo $ORCHESTRATOR_TASK_ID-$GREETING"],
                       "env_vars": {"GREETING": "hi"}}),
            ))
            .await
            .unwrap();
        assert_eq!(result.output.as_deref(), Some("t-hi"));
    }

    #[tokio::test]
    async fn test_shell_invalid_params() {
        let executor = ShellExecutor::new();
        let err = executor
            .execute_task(&context(1, "shell", json!({"args": []})))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTaskParams(_)));
        assert_eq!(err.failure_kind(), FailureKind::Fatal);
    }

    #[tokio::test]
    async fn test_shell_cancel_stops_process() {
        let executor = Arc::new(ShellExecutor::new());
        let running = executor.clone();
        let handle = tokio::spawn(async move {
            running
                .execute_task(&context(9, "shell", json!({"command": "sleep 30"})))
                .await
        });

        for _ in 0..50 {
            if executor.is_running(9).await.unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        executor.cancel(9).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("任务已取消"));
    }

    #[tokio::test]
    async fn test_http_unsupported_method() {
        let executor = HttpExecutor::new();
        let err = executor
            .execute_task(&context(
                1,
                "http",
                json!({"url": "http://127.0.0.1:1", "method": "TRACE"}),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTaskParams(_)));
    }

    #[tokio::test]
    async fn test_http_connection_error_is_retryable() {
        let executor = HttpExecutor::new();
        let result = executor
            .execute_task(&context(
                1,
                "http",
                json!({"url": "http://127.0.0.1:1/unreachable", "timeout_seconds": 2}),
            ))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.failure_kind, Some(FailureKind::Retryable));
    }

    #[tokio::test]
    async fn test_noop_executor() {
        let executor = NoopExecutor::new();
        let result = executor
            .execute_task(&context(1, "noop", serde_json::Value::Null))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(executor.name(), "noop");
        assert!(executor.supports_executor("noop"));
        assert!(!executor.supports_executor("shell"));
    }
}
