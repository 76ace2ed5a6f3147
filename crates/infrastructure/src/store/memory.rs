use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use orchestrator_core::{
    models::{
        NewRun, Run, RunCreation, RunFilter, RunState, StateTransition, TaskInstance, TaskState,
        WorkflowRecord,
    },
    traits::MetadataStore,
    SchedulerError, SchedulerResult,
};

#[derive(Default)]
struct RunTable {
    next_id: i64,
    rows: BTreeMap<i64, Run>,
    keys: HashMap<(String, DateTime<Utc>), i64>,
}

#[derive(Default)]
struct InstanceTable {
    next_id: i64,
    rows: BTreeMap<i64, Arc<Mutex<TaskInstance>>>,
    keys: HashMap<(i64, String), i64>,
}

/// 内存元数据存储
///
/// 每个任务实例有独立的互斥锁，CAS 只锁定目标实例。
/// 进程退出后数据丢失，用于测试和单进程部署。
#[derive(Default)]
pub struct InMemoryMetadataStore {
    workflows: RwLock<BTreeMap<String, WorkflowRecord>>,
    runs: RwLock<RunTable>,
    instances: RwLock<InstanceTable>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn instance_handle(&self, id: i64) -> Option<Arc<Mutex<TaskInstance>>> {
        self.instances.read().await.rows.get(&id).cloned()
    }

    async fn snapshot_instances<F>(&self, mut keep: F) -> Vec<TaskInstance>
    where
        F: FnMut(&TaskInstance) -> bool,
    {
        let handles: Vec<_> = self.instances.read().await.rows.values().cloned().collect();
        let mut out = Vec::new();
        for handle in handles {
            let instance = handle.lock().await;
            if keep(&instance) {
                out.push(instance.clone());
            }
        }
        out
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn register_workflow(&self, name: &str, paused: bool) -> SchedulerResult<WorkflowRecord> {
        let mut workflows = self.workflows.write().await;
        let now = Utc::now();
        let record = workflows
            .entry(name.to_string())
            .or_insert_with(|| WorkflowRecord {
                name: name.to_string(),
                paused,
                registered_at: now,
                updated_at: now,
            });
        Ok(record.clone())
    }

    async fn set_workflow_paused(
        &self,
        name: &str,
        paused: bool,
    ) -> SchedulerResult<WorkflowRecord> {
        let mut workflows = self.workflows.write().await;
        let record = workflows
            .get_mut(name)
            .ok_or_else(|| SchedulerError::WorkflowNotFound {
                name: name.to_string(),
            })?;
        record.paused = paused;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn list_workflows(&self) -> SchedulerResult<Vec<WorkflowRecord>> {
        Ok(self.workflows.read().await.values().cloned().collect())
    }

    async fn create_run(&self, new_run: &NewRun) -> SchedulerResult<RunCreation> {
        let mut runs = self.runs.write().await;
        let key = (new_run.workflow_name.clone(), new_run.logical_date);
        if let Some(id) = runs.keys.get(&key) {
            if let Some(run) = runs.rows.get(id) {
                return Ok(RunCreation {
                    run: run.clone(),
                    created: false,
                });
            }
        }
        runs.next_id += 1;
        let id = runs.next_id;
        let now = Utc::now();
        let run = Run {
            id,
            workflow_name: new_run.workflow_name.clone(),
            logical_date: new_run.logical_date,
            data_interval_start: new_run.data_interval_start,
            data_interval_end: new_run.data_interval_end,
            state: RunState::Running,
            created_at: now,
            updated_at: now,
            ended_at: None,
        };
        runs.rows.insert(id, run.clone());
        runs.keys.insert(key, id);
        debug!("创建运行实例 {} ({} @ {})", id, run.workflow_name, run.logical_date);
        Ok(RunCreation { run, created: true })
    }

    async fn get_run(&self, id: i64) -> SchedulerResult<Option<Run>> {
        Ok(self.runs.read().await.rows.get(&id).cloned())
    }

    async fn latest_run(&self, workflow_name: &str) -> SchedulerResult<Option<Run>> {
        Ok(self
            .runs
            .read()
            .await
            .rows
            .values()
            .filter(|r| r.workflow_name == workflow_name)
            .max_by_key(|r| r.logical_date)
            .cloned())
    }

    async fn previous_run(
        &self,
        workflow_name: &str,
        before: DateTime<Utc>,
    ) -> SchedulerResult<Option<Run>> {
        Ok(self
            .runs
            .read()
            .await
            .rows
            .values()
            .filter(|r| r.workflow_name == workflow_name && r.logical_date < before)
            .max_by_key(|r| r.logical_date)
            .cloned())
    }

    async fn list_active_runs(&self) -> SchedulerResult<Vec<Run>> {
        let mut runs: Vec<Run> = self
            .runs
            .read()
            .await
            .rows
            .values()
            .filter(|r| r.state == RunState::Running)
            .cloned()
            .collect();
        runs.sort_by_key(|r| (r.logical_date, r.id));
        Ok(runs)
    }

    async fn list_runs(&self, filter: &RunFilter) -> SchedulerResult<Vec<Run>> {
        let runs = self.runs.read().await;
        let mut out: Vec<Run> = runs
            .rows
            .values()
            .rev()
            .filter(|r| {
                filter
                    .workflow_name
                    .as_ref()
                    .map_or(true, |name| &r.workflow_name == name)
                    && filter.state.map_or(true, |state| r.state == state)
            })
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit.max(0) as usize);
        }
        Ok(out)
    }

    async fn cas_run_state(
        &self,
        id: i64,
        expected: RunState,
        next: RunState,
    ) -> SchedulerResult<bool> {
        let mut runs = self.runs.write().await;
        let run = runs
            .rows
            .get_mut(&id)
            .ok_or(SchedulerError::RunNotFound { id })?;
        if run.state != expected {
            return Ok(false);
        }
        let now = Utc::now();
        run.state = next;
        run.updated_at = now;
        if next.is_terminal() {
            run.ended_at = Some(now);
        }
        Ok(true)
    }

    async fn create_or_get_task_instance(
        &self,
        run: &Run,
        task_id: &str,
        max_attempts: u32,
    ) -> SchedulerResult<TaskInstance> {
        let handle = {
            let mut instances = self.instances.write().await;
            let key = (run.id, task_id.to_string());
            let existing = instances
                .keys
                .get(&key)
                .and_then(|id| instances.rows.get(id))
                .cloned();
            match existing {
                Some(handle) => handle,
                None => {
                    instances.next_id += 1;
                    let id = instances.next_id;
                    let now = Utc::now();
                    let instance = TaskInstance {
                        id,
                        run_id: run.id,
                        workflow_name: run.workflow_name.clone(),
                        task_id: task_id.to_string(),
                        state: TaskState::Pending,
                        attempt: 0,
                        max_attempts,
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
                    };
                    let handle = Arc::new(Mutex::new(instance));
                    instances.rows.insert(id, handle.clone());
                    instances.keys.insert(key, id);
                    handle
                }
            }
        };
        let instance = handle.lock().await.clone();
        Ok(instance)
    }

    async fn get_task_instance(&self, id: i64) -> SchedulerResult<Option<TaskInstance>> {
        match self.instance_handle(id).await {
            Some(handle) => Ok(Some(handle.lock().await.clone())),
            None => Ok(None),
        }
    }

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
        let handle = self
            .instance_handle(id)
            .await
            .ok_or(SchedulerError::TaskInstanceNotFound { id })?;
        let mut instance = handle.lock().await;
        if instance.state != expected || !transition.matches_attempt(instance.attempt) {
            return Ok(None);
        }
        instance.apply_transition(transition, Utc::now());
        Ok(Some(instance.clone()))
    }

    async fn list_task_instances(&self, run_id: i64) -> SchedulerResult<Vec<TaskInstance>> {
        Ok(self.snapshot_instances(|ti| ti.run_id == run_id).await)
    }

    async fn list_task_instances_by_state(
        &self,
        state: TaskState,
    ) -> SchedulerResult<Vec<TaskInstance>> {
        Ok(self.snapshot_instances(|ti| ti.state == state).await)
    }

    async fn count_active_task_instances(&self, run_id: Option<i64>) -> SchedulerResult<usize> {
        let active = self
            .snapshot_instances(|ti| {
                ti.state.is_active() && run_id.map_or(true, |id| ti.run_id == id)
            })
            .await;
        Ok(active.len())
    }

    async fn heartbeat_task_instance(
        &self,
        id: i64,
        worker_id: &str,
        attempt: u32,
    ) -> SchedulerResult<bool> {
        let Some(handle) = self.instance_handle(id).await else {
            return Err(SchedulerError::TaskInstanceNotFound { id });
        };
        let mut instance = handle.lock().await;
        if instance.state != TaskState::Running
            || instance.worker_id.as_deref() != Some(worker_id)
            || instance.attempt != attempt
        {
            return Ok(false);
        }
        instance.heartbeat_at = Some(Utc::now());
        Ok(true)
    }
}
