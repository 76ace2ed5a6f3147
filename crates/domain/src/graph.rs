use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::warn;

use orchestrator_core::{
    models::{TaskDefinition, TaskInstance, TaskState, WorkflowDefinition},
    DefinitionError,
};

use crate::schedule::WorkflowSchedule;

/// 校验通过的工作流 DAG
#[derive(Debug, Clone)]
pub struct WorkflowGraph {
    definition: WorkflowDefinition,
    schedule: WorkflowSchedule,
    /// 拓扑序，同层按定义顺序
    order: Vec<String>,
    position: HashMap<String, usize>,
    upstream: HashMap<String, Vec<String>>,
    downstream: HashMap<String, Vec<String>>,
}

impl WorkflowGraph {
    /// 加载并校验单个工作流定义
    pub fn load(definition: WorkflowDefinition) -> Result<Self, DefinitionError> {
        let workflow = definition.name.trim().to_string();
        if workflow.is_empty() {
            return Err(DefinitionError::EmptyName);
        }
        if definition.tasks.is_empty() {
            return Err(DefinitionError::NoTasks { workflow });
        }
        if let Some(end) = definition.end_date {
            if end <= definition.start_date {
                return Err(DefinitionError::Invalid {
                    workflow,
                    message: "end_date 必须晚于 start_date".to_string(),
                });
            }
        }
        if definition.max_active_tasks == Some(0) {
            return Err(DefinitionError::Invalid {
                workflow,
                message: "max_active_tasks 必须大于0".to_string(),
            });
        }

        let mut ids = HashSet::new();
        for task in &definition.tasks {
            if task.id.trim().is_empty() {
                return Err(DefinitionError::Invalid {
                    workflow,
                    message: "任务ID不能为空".to_string(),
                });
            }
            if !ids.insert(task.id.as_str()) {
                return Err(DefinitionError::DuplicateTask {
                    workflow,
                    task: task.id.clone(),
                });
            }
            if task.retry.max_attempts == 0 {
                return Err(DefinitionError::Invalid {
                    workflow,
                    message: format!("任务 {} 的 retry.max_attempts 必须大于0", task.id),
                });
            }
        }

        let mut upstream: HashMap<String, Vec<String>> = HashMap::new();
        let mut downstream: HashMap<String, Vec<String>> = HashMap::new();
        for task in &definition.tasks {
            upstream.entry(task.id.clone()).or_default();
            downstream.entry(task.id.clone()).or_default();
        }
        for task in &definition.tasks {
            for dep in &task.depends_on {
                if dep == &task.id {
                    return Err(DefinitionError::SelfDependency {
                        workflow,
                        task: task.id.clone(),
                    });
                }
                if !ids.contains(dep.as_str()) {
                    return Err(DefinitionError::DanglingDependency {
                        workflow,
                        task: task.id.clone(),
                        missing: dep.clone(),
                    });
                }
                let preds = upstream.entry(task.id.clone()).or_default();
                if !preds.contains(dep) {
                    preds.push(dep.clone());
                    downstream
                        .entry(dep.clone())
                        .or_default()
                        .push(task.id.clone());
                }
            }
        }

        let order = topological_order(&workflow, &definition.tasks, &upstream, &downstream)?;

        let schedule = WorkflowSchedule::new(
            &definition.schedule,
            definition.start_date,
            definition.end_date,
        )
        .map_err(|message| DefinitionError::InvalidSchedule {
            workflow: workflow.clone(),
            expr: definition.schedule.clone(),
            message,
        })?;

        let position = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        Ok(Self {
            definition,
            schedule,
            order,
            position,
            upstream,
            downstream,
        })
    }

    /// 批量加载，单个定义失败不影响其他定义；重名的定义全部拒绝
    pub fn load_all(
        definitions: Vec<WorkflowDefinition>,
    ) -> (Vec<WorkflowGraph>, Vec<DefinitionError>) {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for def in &definitions {
            *counts.entry(def.name.trim().to_string()).or_insert(0) += 1;
        }

        let mut graphs = Vec::new();
        let mut errors = Vec::new();
        let mut reported = HashSet::new();
        for def in definitions {
            let name = def.name.trim().to_string();
            if counts.get(&name).copied().unwrap_or(0) > 1 {
                if reported.insert(name.clone()) {
                    warn!("工作流名称重复，全部拒绝: {}", name);
                    errors.push(DefinitionError::DuplicateWorkflow { workflow: name });
                }
                continue;
            }
            match WorkflowGraph::load(def) {
                Ok(graph) => graphs.push(graph),
                Err(e) => {
                    warn!("工作流定义被拒绝: {}", e);
                    errors.push(e);
                }
            }
        }
        (graphs, errors)
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &WorkflowDefinition {
        &self.definition
    }

    pub fn schedule(&self) -> &WorkflowSchedule {
        &self.schedule
    }

    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    /// 任务在拓扑序中的位置，用于确定分发顺序
    pub fn position(&self, task_id: &str) -> Option<usize> {
        self.position.get(task_id).copied()
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskDefinition> {
        self.definition.task(task_id)
    }

    pub fn upstream(&self, task_id: &str) -> &[String] {
        self.upstream.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn downstream(&self, task_id: &str) -> &[String] {
        self.downstream.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// 按拓扑序返回任务定义
    pub fn tasks_in_order(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.order.iter().filter_map(|id| self.definition.task(id))
    }

    /// 可分发的任务
    ///
    /// 条件：自身实例为 pending 且 retry_at 已到期；同一运行实例中所有前驱都已
    /// succeeded；若声明了 depends_on_past，上一个运行实例中的同名任务已 succeeded
    /// （没有上一个运行实例或其中没有该任务时视为满足）。
    pub fn ready_tasks<'a>(
        &'a self,
        instances: &[TaskInstance],
        previous_run: Option<&[TaskInstance]>,
        now: DateTime<Utc>,
    ) -> Vec<&'a TaskDefinition> {
        let by_task = index_by_task(instances);
        let previous = previous_run.map(index_by_task);

        self.tasks_in_order()
            .filter(|task| {
                let Some(instance) = by_task.get(task.id.as_str()) else {
                    return false;
                };
                if instance.state != TaskState::Pending || !instance.retry_due(now) {
                    return false;
                }
                let upstream_done = self.upstream(&task.id).iter().all(|dep| {
                    by_task
                        .get(dep.as_str())
                        .is_some_and(|ti| ti.state == TaskState::Succeeded)
                });
                if !upstream_done {
                    return false;
                }
                if task.depends_on_past {
                    if let Some(prev) = previous.as_ref().and_then(|p| p.get(task.id.as_str())) {
                        return prev.state == TaskState::Succeeded;
                    }
                }
                true
            })
            .collect()
    }

    /// pending 且有前驱处于 failed / upstream_failed / cancelled 的任务
    pub fn upstream_failed_tasks<'a>(&'a self, instances: &[TaskInstance]) -> Vec<&'a TaskDefinition> {
        let by_task = index_by_task(instances);
        self.tasks_in_order()
            .filter(|task| {
                by_task
                    .get(task.id.as_str())
                    .is_some_and(|ti| ti.state == TaskState::Pending)
                    && self.upstream(&task.id).iter().any(|dep| {
                        by_task
                            .get(dep.as_str())
                            .is_some_and(|ti| ti.state.blocks_downstream())
                    })
            })
            .collect()
    }
}

fn index_by_task(instances: &[TaskInstance]) -> HashMap<&str, &TaskInstance> {
    instances.iter().map(|ti| (ti.task_id.as_str(), ti)).collect()
}

/// Kahn 拓扑排序，剩余未处理的节点即构成环
fn topological_order(
    workflow: &str,
    tasks: &[TaskDefinition],
    upstream: &HashMap<String, Vec<String>>,
    downstream: &HashMap<String, Vec<String>>,
) -> Result<Vec<String>, DefinitionError> {
    let mut in_degree: HashMap<&str, usize> = tasks
        .iter()
        .map(|t| (t.id.as_str(), upstream.get(&t.id).map_or(0, Vec::len)))
        .collect();

    let mut queue: VecDeque<&str> = tasks
        .iter()
        .filter(|t| in_degree.get(t.id.as_str()) == Some(&0))
        .map(|t| t.id.as_str())
        .collect();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(id) = queue.pop_front() {
        order.push(id.to_string());
        for next in downstream.get(id).map(Vec::as_slice).unwrap_or(&[]) {
            if let Some(degree) = in_degree.get_mut(next.as_str()) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next.as_str());
                }
            }
        }
    }

    if order.len() != tasks.len() {
        let done: HashSet<&str> = order.iter().map(String::as_str).collect();
        let residual = tasks
            .iter()
            .filter(|t| !done.contains(t.id.as_str()))
            .map(|t| t.id.clone())
            .collect();
        return Err(DefinitionError::Cycle {
            workflow: workflow.to_string(),
            tasks: residual,
        });
    }
    Ok(order)
}
