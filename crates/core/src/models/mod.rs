//! # 数据模型
//!
//! 编排核心的数据结构：工作流定义、运行实例（Run）、任务实例（TaskInstance）
//! 以及队列消息。
//!
//! Run 和 TaskInstance 只保存在元数据存储中，其他组件通过 `i64` ID 引用，
//! 不持有可变副本。两者都不会被删除。
//!
//! ## 任务实例状态流转
//! ```text
//! pending → queued → running → succeeded
//!    ↑         │         ├──→ failed
//!    └─────────┴─────────┘ (回滚 / 重试)
//! pending → upstream_failed
//! 任意非终态 → cancelled
//! ```

pub mod execution;
pub mod message;
pub mod run;
pub mod sqlx_impls;
pub mod task_instance;
pub mod workflow;

pub use execution::*;
pub use message::*;
pub use run::*;
pub use task_instance::*;
pub use workflow::*;
