//! 配置管理
//!
//! TOML 文件 + `ORCHESTRATOR_` 前缀的环境变量覆盖，启动时加载并校验。

pub mod models;

pub use models::*;
