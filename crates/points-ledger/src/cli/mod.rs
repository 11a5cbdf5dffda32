//! 命令行接口
//!
//! - `commands`: clap 命令定义
//! - `runner`: 命令执行器，负责装配存储与服务

mod commands;
mod runner;

pub use commands::{Cli, Commands};
pub use runner::CommandRunner;
