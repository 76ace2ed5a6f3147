//! 调度侧组件：定义注册表、运行实例规划、调度循环、分发器、对账与控制操作

pub mod controller;
pub mod dispatcher;
pub mod reconciler;
pub mod registry;
pub mod run_planner;
pub mod scheduler;

pub use controller::{CancelOutcome, RunController};
pub use dispatcher::{DispatchCandidate, DispatchReport, TaskDispatcher};
pub use reconciler::{ReconcileReport, Reconciler};
pub use registry::{RegistryUpdate, WorkflowRegistry};
pub use run_planner::RunPlanner;
pub use scheduler::{CycleReport, SchedulerLoop};
