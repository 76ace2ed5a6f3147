use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use orchestrator_core::{
    models::{RetryPolicy, TaskDefinition, TaskInstance, TaskState, WorkflowDefinition},
    DefinitionError,
};
use orchestrator_domain::WorkflowGraph;

fn task(id: &str, deps: &[&str]) -> TaskDefinition {
    TaskDefinition {
        id: id.to_string(),
        executor: "noop".to_string(),
        params: json!({}),
        retry: RetryPolicy::default(),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        depends_on_past: false,
        timeout_seconds: None,
    }
}

fn workflow(name: &str, tasks: Vec<TaskDefinition>) -> WorkflowDefinition {
    WorkflowDefinition {
        name: name.to_string(),
        description: None,
        schedule: "@daily".to_string(),
        start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        end_date: None,
        paused: Some(false),
        catchup: Some(false),
        max_active_tasks: None,
        tasks,
    }
}

fn instance(id: i64, task_id: &str, state: TaskState) -> TaskInstance {
    let now = Utc::now();
    TaskInstance {
        id,
        run_id: 1,
        workflow_name: "wf".to_string(),
        task_id: task_id.to_string(),
        state,
        attempt: 0,
        max_attempts: 1,
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

fn ids(tasks: Vec<&TaskDefinition>) -> Vec<&str> {
    tasks.into_iter().map(|t| t.id.as_str()).collect()
}

#[test]
fn test_load_all_rejects_cycle_and_accepts_acyclic_in_same_batch() {
    let cyclic = workflow(
        "cyclic",
        vec![task("a", &["c"]), task("b", &["a"]), task("c", &["b"]), task("d", &[])],
    );
    let acyclic = workflow("etl", vec![task("extract", &[]), task("load", &["extract"])]);

    let (graphs, errors) = WorkflowGraph::load_all(vec![cyclic, acyclic]);

    assert_eq!(graphs.len(), 1);
    assert_eq!(graphs[0].name(), "etl");
    assert_eq!(errors.len(), 1);
    match &errors[0] {
        DefinitionError::Cycle { workflow, tasks } => {
            assert_eq!(workflow, "cyclic");
            assert_eq!(tasks, &vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_load_validation_errors() {
    let err = WorkflowGraph::load(workflow("wf", vec![])).unwrap_err();
    assert!(matches!(err, DefinitionError::NoTasks { .. }));

    let err = WorkflowGraph::load(workflow("wf", vec![task("a", &[]), task("a", &[])])).unwrap_err();
    assert!(matches!(err, DefinitionError::DuplicateTask { .. }));

    let err = WorkflowGraph::load(workflow("wf", vec![task("a", &["ghost"])])).unwrap_err();
    assert!(matches!(err, DefinitionError::DanglingDependency { .. }));

    let err = WorkflowGraph::load(workflow("wf", vec![task("a", &["a"])])).unwrap_err();
    assert!(matches!(err, DefinitionError::SelfDependency { .. }));

    let mut bad_schedule = workflow("wf", vec![task("a", &[])]);
    bad_schedule.schedule = "every day".to_string();
    let err = WorkflowGraph::load(bad_schedule).unwrap_err();
    assert!(matches!(err, DefinitionError::InvalidSchedule { .. }));

    let mut bad_dates = workflow("wf", vec![task("a", &[])]);
    bad_dates.end_date = Some(bad_dates.start_date - Duration::days(1));
    let err = WorkflowGraph::load(bad_dates).unwrap_err();
    assert!(matches!(err, DefinitionError::Invalid { .. }));
}

#[test]
fn test_out_of_range_interval_rejected_alone() {
    let mut huge = workflow("huge", vec![task("a", &[])]);
    huge.schedule = "every 99999999999999d".to_string();
    let ok = workflow("ok", vec![task("b", &[])]);

    let (graphs, errors) = WorkflowGraph::load_all(vec![huge, ok]);

    assert_eq!(graphs.len(), 1);
    assert_eq!(graphs[0].name(), "ok");
    assert!(matches!(
        &errors[..],
        [DefinitionError::InvalidSchedule { workflow, .. }] if workflow == "huge"
    ));
}

#[test]
fn test_duplicate_workflow_names_are_rejected() {
    let (graphs, errors) = WorkflowGraph::load_all(vec![
        workflow("dup", vec![task("a", &[])]),
        workflow("dup", vec![task("b", &[])]),
        workflow("ok", vec![task("c", &[])]),
    ]);
    assert_eq!(graphs.len(), 1);
    assert_eq!(errors, vec![DefinitionError::DuplicateWorkflow {
        workflow: "dup".to_string()
    }]);
}

#[test]
fn test_topological_order_is_deterministic() {
    let graph = WorkflowGraph::load(workflow(
        "wf",
        vec![
            task("report", &["join"]),
            task("users", &[]),
            task("orders", &[]),
            task("join", &["users", "orders"]),
        ],
    ))
    .unwrap();
    assert_eq!(
        graph.topological_order(),
        &["users", "orders", "join", "report"]
    );
    assert_eq!(graph.position("report"), Some(3));
    assert_eq!(graph.downstream("users"), &["join".to_string()]);
}

#[test]
fn test_ready_tasks_requires_succeeded_upstream() {
    let graph =
        WorkflowGraph::load(workflow("wf", vec![task("a", &[]), task("b", &["a"])])).unwrap();
    let now = Utc::now();

    let instances = vec![
        instance(1, "a", TaskState::Pending),
        instance(2, "b", TaskState::Pending),
    ];
    assert_eq!(ids(graph.ready_tasks(&instances, None, now)), vec!["a"]);

    let instances = vec![
        instance(1, "a", TaskState::Running),
        instance(2, "b", TaskState::Pending),
    ];
    assert!(graph.ready_tasks(&instances, None, now).is_empty());

    let instances = vec![
        instance(1, "a", TaskState::Succeeded),
        instance(2, "b", TaskState::Pending),
    ];
    assert_eq!(ids(graph.ready_tasks(&instances, None, now)), vec!["b"]);
}

#[test]
fn test_ready_tasks_waits_for_retry_at() {
    let graph = WorkflowGraph::load(workflow("wf", vec![task("a", &[])])).unwrap();
    let now = Utc::now();
    let mut pending = instance(1, "a", TaskState::Pending);
    pending.retry_at = Some(now + Duration::minutes(5));
    assert!(graph.ready_tasks(&[pending.clone()], None, now).is_empty());
    assert_eq!(
        ids(graph.ready_tasks(&[pending], None, now + Duration::minutes(5))),
        vec!["a"]
    );
}

#[test]
fn test_depends_on_past() {
    let mut fetch = task("fetch", &[]);
    fetch.depends_on_past = true;
    let graph = WorkflowGraph::load(workflow("wf", vec![fetch])).unwrap();
    let now = Utc::now();
    let current = vec![instance(10, "fetch", TaskState::Pending)];

    // 没有上一个运行实例时不阻塞
    assert_eq!(ids(graph.ready_tasks(&current, None, now)), vec!["fetch"]);

    let previous_failed = vec![instance(1, "fetch", TaskState::Failed)];
    assert!(graph
        .ready_tasks(&current, Some(&previous_failed), now)
        .is_empty());

    let previous_ok = vec![instance(1, "fetch", TaskState::Succeeded)];
    assert_eq!(
        ids(graph.ready_tasks(&current, Some(&previous_ok), now)),
        vec!["fetch"]
    );
}

#[test]
fn test_upstream_failed_tasks() {
    let graph = WorkflowGraph::load(workflow(
        "wf",
        vec![task("a", &[]), task("b", &["a"]), task("c", &["b"]), task("d", &[])],
    ))
    .unwrap();

    let instances = vec![
        instance(1, "a", TaskState::Failed),
        instance(2, "b", TaskState::Pending),
        instance(3, "c", TaskState::Pending),
        instance(4, "d", TaskState::Pending),
    ];
    assert_eq!(ids(graph.upstream_failed_tasks(&instances)), vec!["b"]);
    assert!(!ids(graph.ready_tasks(&instances, None, Utc::now())).contains(&"b"));

    // b 被标记后，c 在下一轮被标记
    let instances = vec![
        instance(1, "a", TaskState::Failed),
        instance(2, "b", TaskState::UpstreamFailed),
        instance(3, "c", TaskState::Pending),
        instance(4, "d", TaskState::Succeeded),
    ];
    assert_eq!(ids(graph.upstream_failed_tasks(&instances)), vec!["c"]);
}
