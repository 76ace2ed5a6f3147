//! 工作流领域模型：调度表达式、DAG 图模型与任务实例状态机

pub mod graph;
pub mod schedule;
pub mod state_machine;

pub use graph::WorkflowGraph;
pub use schedule::{DataInterval, ScheduleExpression, WorkflowSchedule};
pub use state_machine::{failure_transition, retry_delay, run_outcome};
