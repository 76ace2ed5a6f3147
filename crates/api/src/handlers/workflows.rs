use axum::{
    extract::{Path, State},
    response::IntoResponse,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use orchestrator_core::models::WorkflowRecord;

use crate::{
    error::ApiResult,
    response::{success, success_with_message},
    routes::AppState,
};

/// 工作流概要。定义未被当前进程加载时只有存储中的字段
#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub name: String,
    pub paused: bool,
    pub registered_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schedule: Option<String>,
    pub tasks: Option<Vec<String>>,
}

impl From<WorkflowRecord> for WorkflowSummary {
    fn from(record: WorkflowRecord) -> Self {
        Self {
            name: record.name,
            paused: record.paused,
            registered_at: record.registered_at,
            updated_at: record.updated_at,
            schedule: None,
            tasks: None,
        }
    }
}

pub async fn list_workflows(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let records = state.store.list_workflows().await?;

    let mut summaries = Vec::with_capacity(records.len());
    for record in records {
        let graph = state.registry.get(&record.name).await;
        let mut summary = WorkflowSummary::from(record);
        if let Some(graph) = graph {
            summary.schedule = Some(graph.definition().schedule.clone());
            summary.tasks = Some(graph.topological_order().to_vec());
        }
        summaries.push(summary);
    }

    Ok(success(summaries))
}

pub async fn pause_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state.controller.pause_workflow(&name).await?;
    Ok(success_with_message(record, format!("工作流 {name} 已暂停")))
}

pub async fn unpause_workflow(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let record = state.controller.unpause_workflow(&name).await?;
    Ok(success_with_message(record, format!("工作流 {name} 已恢复")))
}
