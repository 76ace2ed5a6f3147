mod common;

use anyhow::Result;

use orchestrator_core::{
    config::DispatcherConfig,
    models::{RunState, TaskState},
    SchedulerError,
};
use orchestrator_dispatcher::RunController;

use common::*;

#[tokio::test]
async fn test_cancel_run_cancels_every_unfinished_instance() -> Result<()> {
    let h = harness(
        vec![workflow("etl", vec![task("a", &[]), task("b", &["a"])])],
        Mode::Submit,
        scheduler_config(),
        DispatcherConfig::default(),
    );
    h.scheduler.run_cycle(day(2)).await?;
    let run = h.store.list_active_runs().await?.remove(0);
    let queued = h.strategy.executed()[0].task_instance_id;

    let controller = RunController::new(h.store.clone(), h.strategy.clone());
    let outcome = controller.cancel_run(run.id).await?;
    assert!(!outcome.already_finished);
    assert_eq!(outcome.cancelled_instances.len(), 2);
    // 只有已交给执行策略的实例需要通知
    assert_eq!(h.strategy.cancelled(), vec![queued]);

    let run = h.store.get_run(run.id).await?.unwrap();
    assert_eq!(run.state, RunState::Cancelled);
    for ti in h.store.list_task_instances(run.id).await? {
        assert_eq!(ti.state, TaskState::Cancelled);
    }

    // 之后的周期不会再分发
    let report = h.scheduler.run_cycle(day(2)).await?;
    assert_eq!(report.candidates, 0);
    assert_eq!(h.strategy.executed().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_cancel_finished_run_is_a_no_op() -> Result<()> {
    let h = harness(
        vec![workflow("done", vec![task("a", &[])])],
        Mode::Succeed,
        scheduler_config(),
        DispatcherConfig::default(),
    );
    h.scheduler.run_cycle(day(2)).await?;
    let report = h.scheduler.run_cycle(day(2)).await?;
    let (run_id, state) = report.runs_finished[0];
    assert_eq!(state, RunState::Success);

    let controller = RunController::new(h.store.clone(), h.strategy.clone());
    let outcome = controller.cancel_run(run_id).await?;
    assert!(outcome.already_finished);
    assert!(outcome.cancelled_instances.is_empty());
    assert_eq!(
        h.store.get_run(run_id).await?.unwrap().state,
        RunState::Success
    );
    Ok(())
}

#[tokio::test]
async fn test_cancel_unknown_run() -> Result<()> {
    let h = harness(
        Vec::new(),
        Mode::Submit,
        scheduler_config(),
        DispatcherConfig::default(),
    );
    let controller = RunController::new(h.store.clone(), h.strategy.clone());
    let err = controller.cancel_run(404).await.unwrap_err();
    assert!(matches!(err, SchedulerError::RunNotFound { id: 404 }));
    Ok(())
}

#[tokio::test]
async fn test_pause_and_unpause_workflow() -> Result<()> {
    let h = harness(
        vec![workflow("toggle", vec![task("a", &[])])],
        Mode::Submit,
        scheduler_config(),
        DispatcherConfig::default(),
    );
    let controller = RunController::new(h.store.clone(), h.strategy.clone());

    // 尚未注册
    assert!(matches!(
        controller.pause_workflow("toggle").await,
        Err(SchedulerError::WorkflowNotFound { .. })
    ));

    h.scheduler.run_cycle(day(2)).await?;
    assert!(controller.pause_workflow("toggle").await?.paused);
    assert_eq!(h.scheduler.run_cycle(day(5)).await?.runs_created, 0);

    assert!(!controller.unpause_workflow("toggle").await?.paused);
    assert_eq!(h.scheduler.run_cycle(day(5)).await?.runs_created, 1);
    Ok(())
}
