use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use orchestrator_core::{
    config::DatabaseConfig,
    models::{
        NewRun, Run, RunCreation, RunFilter, RunState, StateTransition, TaskInstance, TaskState,
        WorkflowRecord,
    },
    traits::MetadataStore,
    SchedulerError, SchedulerResult,
};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflows (
        name TEXT PRIMARY KEY,
        paused BOOLEAN NOT NULL,
        registered_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        workflow_name TEXT NOT NULL,
        logical_date TEXT NOT NULL,
        data_interval_start TEXT NOT NULL,
        data_interval_end TEXT NOT NULL,
        state TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        ended_at TEXT,
        UNIQUE (workflow_name, logical_date)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_runs_state ON runs (state)",
    r#"
    CREATE TABLE IF NOT EXISTS task_instances (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id INTEGER NOT NULL REFERENCES runs (id),
        workflow_name TEXT NOT NULL,
        task_id TEXT NOT NULL,
        state TEXT NOT NULL,
        attempt INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        worker_id TEXT,
        queued_at TEXT,
        started_at TEXT,
        ended_at TEXT,
        heartbeat_at TEXT,
        retry_at TEXT,
        error_message TEXT,
        failure_kind TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        version INTEGER NOT NULL DEFAULT 0,
        UNIQUE (run_id, task_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_task_instances_state ON task_instances (state)",
    "CREATE INDEX IF NOT EXISTS idx_task_instances_run ON task_instances (run_id)",
];

const RUN_COLUMNS: &str = "id, workflow_name, logical_date, data_interval_start, \
     data_interval_end, state, created_at, updated_at, ended_at";

const INSTANCE_COLUMNS: &str = "id, run_id, workflow_name, task_id, state, attempt, \
     max_attempts, worker_id, queued_at, started_at, ended_at, heartbeat_at, retry_at, \
     error_message, failure_kind, created_at, updated_at, version";

/// 并发写入导致版本号变化时 CAS 的重读次数
const CAS_REREAD_LIMIT: usize = 5;

/// SQLite 元数据存储
///
/// 运行实例唯一性由 `UNIQUE (workflow_name, logical_date)` 保证；
/// 任务实例 CAS 是带 `state` 和 `version` 条件的单行 UPDATE。
pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 按配置建立连接池并建表
    pub async fn connect(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(SchedulerError::Database)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        // 内存数据库每个连接各自独立，只能用单连接
        let max_connections = if config.url.contains(":memory:") {
            1
        } else {
            config.max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(config.min_connections.min(max_connections))
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .connect_with(options)
            .await
            .map_err(SchedulerError::Database)?;

        let store = Self::new(pool);
        store.migrate().await?;
        info!("SQLite元数据存储已就绪: {}", config.url);
        Ok(store)
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(SchedulerError::Database)?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }

    fn row_to_workflow(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<WorkflowRecord> {
        Ok(WorkflowRecord {
            name: row.try_get("name")?,
            paused: row.try_get("paused")?,
            registered_at: row.try_get("registered_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn row_to_run(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Run> {
        Ok(Run {
            id: row.try_get("id")?,
            workflow_name: row.try_get("workflow_name")?,
            logical_date: row.try_get("logical_date")?,
            data_interval_start: row.try_get("data_interval_start")?,
            data_interval_end: row.try_get("data_interval_end")?,
            state: row.try_get("state")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            ended_at: row.try_get("ended_at")?,
        })
    }

    fn row_to_instance(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<(TaskInstance, i64)> {
        let attempt: i64 = row.try_get("attempt")?;
        let max_attempts: i64 = row.try_get("max_attempts")?;
        let instance = TaskInstance {
            id: row.try_get("id")?,
            run_id: row.try_get("run_id")?,
            workflow_name: row.try_get("workflow_name")?,
            task_id: row.try_get("task_id")?,
            state: row.try_get("state")?,
            attempt: attempt.max(0) as u32,
            max_attempts: max_attempts.max(0) as u32,
            worker_id: row.try_get("worker_id")?,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            ended_at: row.try_get("ended_at")?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            retry_at: row.try_get("retry_at")?,
            error_message: row.try_get("error_message")?,
            failure_kind: row.try_get("failure_kind")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        };
        Ok((instance, row.try_get("version")?))
    }

    async fn fetch_instance(&self, id: i64) -> SchedulerResult<Option<(TaskInstance, i64)>> {
        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        row.as_ref().map(Self::row_to_instance).transpose()
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn register_workflow(&self, name: &str, paused: bool) -> SchedulerResult<WorkflowRecord> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO workflows (name, paused, registered_at, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(paused)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let row = sqlx::query("SELECT name, paused, registered_at, updated_at FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Self::row_to_workflow(&row)
    }

    async fn set_workflow_paused(
        &self,
        name: &str,
        paused: bool,
    ) -> SchedulerResult<WorkflowRecord> {
        let result = sqlx::query("UPDATE workflows SET paused = ?, updated_at = ? WHERE name = ?")
            .bind(paused)
            .bind(Utc::now())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        if result.rows_affected() == 0 {
            return Err(SchedulerError::WorkflowNotFound {
                name: name.to_string(),
            });
        }
        let row = sqlx::query("SELECT name, paused, registered_at, updated_at FROM workflows WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Self::row_to_workflow(&row)
    }

    async fn list_workflows(&self) -> SchedulerResult<Vec<WorkflowRecord>> {
        let rows = sqlx::query(
            "SELECT name, paused, registered_at, updated_at FROM workflows ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        rows.iter().map(Self::row_to_workflow).collect()
    }

    #[instrument(skip(self, new_run), fields(workflow = %new_run.workflow_name, logical_date = %new_run.logical_date))]
    async fn create_run(&self, new_run: &NewRun) -> SchedulerResult<RunCreation> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO runs (workflow_name, logical_date, data_interval_start, data_interval_end,
                              state, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (workflow_name, logical_date) DO NOTHING
            "#,
        )
        .bind(&new_run.workflow_name)
        .bind(new_run.logical_date)
        .bind(new_run.data_interval_start)
        .bind(new_run.data_interval_end)
        .bind(RunState::Running)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let created = result.rows_affected() == 1;
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE workflow_name = ? AND logical_date = ?"
        ))
        .bind(&new_run.workflow_name)
        .bind(new_run.logical_date)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let run = Self::row_to_run(&row)?;
        if created {
            debug!("创建运行实例成功: ID {}", run.id);
        }
        Ok(RunCreation { run, created })
    }

    async fn get_run(&self, id: i64) -> SchedulerResult<Option<Run>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn latest_run(&self, workflow_name: &str) -> SchedulerResult<Option<Run>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE workflow_name = ? \
             ORDER BY logical_date DESC LIMIT 1"
        ))
        .bind(workflow_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn previous_run(
        &self,
        workflow_name: &str,
        before: DateTime<Utc>,
    ) -> SchedulerResult<Option<Run>> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE workflow_name = ? AND logical_date < ? \
             ORDER BY logical_date DESC LIMIT 1"
        ))
        .bind(workflow_name)
        .bind(before)
        .fetch_optional(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        row.as_ref().map(Self::row_to_run).transpose()
    }

    async fn list_active_runs(&self) -> SchedulerResult<Vec<Run>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM runs WHERE state = ? ORDER BY logical_date, id"
        ))
        .bind(RunState::Running)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn list_runs(&self, filter: &RunFilter) -> SchedulerResult<Vec<Run>> {
        let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE 1 = 1");
        if filter.workflow_name.is_some() {
            sql.push_str(" AND workflow_name = ?");
        }
        if filter.state.is_some() {
            sql.push_str(" AND state = ?");
        }
        sql.push_str(" ORDER BY id DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(name) = &filter.workflow_name {
            query = query.bind(name);
        }
        if let Some(state) = filter.state {
            query = query.bind(state);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit.max(0));
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        rows.iter().map(Self::row_to_run).collect()
    }

    async fn cas_run_state(
        &self,
        id: i64,
        expected: RunState,
        next: RunState,
    ) -> SchedulerResult<bool> {
        let now = Utc::now();
        let ended_at = next.is_terminal().then_some(now);
        let result = sqlx::query(
            "UPDATE runs SET state = ?, updated_at = ?, ended_at = COALESCE(?, ended_at) \
             WHERE id = ? AND state = ?",
        )
        .bind(next)
        .bind(now)
        .bind(ended_at)
        .bind(id)
        .bind(expected)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get_run(id).await? {
            Some(_) => Ok(false),
            None => Err(SchedulerError::RunNotFound { id }),
        }
    }

    async fn create_or_get_task_instance(
        &self,
        run: &Run,
        task_id: &str,
        max_attempts: u32,
    ) -> SchedulerResult<TaskInstance> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO task_instances (run_id, workflow_name, task_id, state, attempt,
                                        max_attempts, created_at, updated_at)
            VALUES (?, ?, ?, ?, 0, ?, ?, ?)
            ON CONFLICT (run_id, task_id) DO NOTHING
            "#,
        )
        .bind(run.id)
        .bind(&run.workflow_name)
        .bind(task_id)
        .bind(TaskState::Pending)
        .bind(max_attempts as i64)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;

        let row = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE run_id = ? AND task_id = ?"
        ))
        .bind(run.id)
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        Self::row_to_instance(&row).map(|(instance, _)| instance)
    }

    async fn get_task_instance(&self, id: i64) -> SchedulerResult<Option<TaskInstance>> {
        Ok(self.fetch_instance(id).await?.map(|(instance, _)| instance))
    }

    #[instrument(skip(self, transition), fields(task_instance_id = id, expected = %expected, next = %transition.next))]
    async fn cas_task_instance_state(
        &self,
        id: i64,
        expected: TaskState,
        transition: &StateTransition,
    ) -> SchedulerResult<Option<TaskInstance>> {
        if !expected.can_transition_to(transition.next) {
            return Err(SchedulerError::InvalidTransition {
                from: expected,
                to: transition.next,
            });
        }

        for _ in 0..CAS_REREAD_LIMIT {
            let (mut instance, version) = self
                .fetch_instance(id)
                .await?
                .ok_or(SchedulerError::TaskInstanceNotFound { id })?;
            if instance.state != expected || !transition.matches_attempt(instance.attempt) {
                return Ok(None);
            }
            instance.apply_transition(transition, Utc::now());

            let result = sqlx::query(
                r#"
                UPDATE task_instances
                SET state = ?, attempt = ?, worker_id = ?, queued_at = ?, started_at = ?,
                    ended_at = ?, heartbeat_at = ?, retry_at = ?, error_message = ?,
                    failure_kind = ?, updated_at = ?, version = version + 1
                WHERE id = ? AND state = ? AND version = ?
                "#,
            )
            .bind(instance.state)
            .bind(instance.attempt as i64)
            .bind(&instance.worker_id)
            .bind(instance.queued_at)
            .bind(instance.started_at)
            .bind(instance.ended_at)
            .bind(instance.heartbeat_at)
            .bind(instance.retry_at)
            .bind(&instance.error_message)
            .bind(instance.failure_kind)
            .bind(instance.updated_at)
            .bind(id)
            .bind(expected)
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;

            if result.rows_affected() == 1 {
                return Ok(Some(instance));
            }
        }
        Ok(None)
    }

    async fn list_task_instances(&self, run_id: i64) -> SchedulerResult<Vec<TaskInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE run_id = ? ORDER BY id"
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        rows.iter()
            .map(|row| Self::row_to_instance(row).map(|(instance, _)| instance))
            .collect()
    }

    async fn list_task_instances_by_state(
        &self,
        state: TaskState,
    ) -> SchedulerResult<Vec<TaskInstance>> {
        let rows = sqlx::query(&format!(
            "SELECT {INSTANCE_COLUMNS} FROM task_instances WHERE state = ? ORDER BY id"
        ))
        .bind(state)
        .fetch_all(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        rows.iter()
            .map(|row| Self::row_to_instance(row).map(|(instance, _)| instance))
            .collect()
    }

    async fn count_active_task_instances(&self, run_id: Option<i64>) -> SchedulerResult<usize> {
        let count: i64 = match run_id {
            Some(run_id) => sqlx::query(
                "SELECT COUNT(*) AS n FROM task_instances \
                 WHERE state IN ('queued', 'running') AND run_id = ?",
            )
            .bind(run_id)
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?
            .try_get("n")?,
            None => sqlx::query(
                "SELECT COUNT(*) AS n FROM task_instances WHERE state IN ('queued', 'running')",
            )
            .fetch_one(&self.pool)
            .await
            .map_err(SchedulerError::Database)?
            .try_get("n")?,
        };
        Ok(count.max(0) as usize)
    }

    async fn heartbeat_task_instance(
        &self,
        id: i64,
        worker_id: &str,
        attempt: u32,
    ) -> SchedulerResult<bool> {
        let result = sqlx::query(
            "UPDATE task_instances SET heartbeat_at = ? \
             WHERE id = ? AND state = 'running' AND worker_id = ? AND attempt = ?",
        )
        .bind(Utc::now())
        .bind(id)
        .bind(worker_id)
        .bind(attempt as i64)
        .execute(&self.pool)
        .await
        .map_err(SchedulerError::Database)?;
        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.fetch_instance(id).await? {
            Some(_) => Ok(false),
            None => Err(SchedulerError::TaskInstanceNotFound { id }),
        }
    }
}
