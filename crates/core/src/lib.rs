pub mod config;
pub mod error_handling;
pub mod errors;
pub mod models;
pub mod traits;

pub use error_handling::{retry_transient, RetryConfig};
pub use errors::*;

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
