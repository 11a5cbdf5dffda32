//! 共享库
//!
//! 包含积分服务各组件共用的配置、重试策略和可观测性基础设施代码。

pub mod config;
pub mod observability;
pub mod retry;
