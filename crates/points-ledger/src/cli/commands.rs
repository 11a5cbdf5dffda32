//! CLI 命令定义
//!
//! 每个子命令对应积分核心的一个操作，结果以 JSON 输出到 stdout，日志输出到 stderr。

use clap::{Parser, Subcommand};

/// 积分账本命令行工具
#[derive(Parser, Debug)]
#[command(name = "points-ledger")]
#[command(version, about = "成就积分与奖励兑换工具")]
#[command(propagate_version = true)]
pub struct Cli {
    /// 单次尝试的超时时间（毫秒）
    #[arg(long, default_value = "5000")]
    pub timeout_ms: u64,

    /// 瞬时错误时整体重放请求的最大次数
    #[arg(long, default_value = "3")]
    pub request_retries: u32,

    #[command(subcommand)]
    pub command: Commands,
}

/// 子命令枚举
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// 完成成就并入账积分
    Complete {
        #[arg(short, long)]
        user_id: String,

        #[arg(short, long)]
        achievement_id: String,

        /// 成就奖励的积分
        #[arg(short, long)]
        points: u64,
    },

    /// 兑换奖励
    ///
    /// 未指定 request_id 时自动生成；重放同一请求请显式传入相同的 request_id。
    Redeem {
        #[arg(short, long)]
        user_id: String,

        #[arg(short, long)]
        reward_id: String,

        #[arg(long)]
        request_id: Option<String>,
    },

    /// 查询积分余额
    Balance {
        #[arg(short, long)]
        user_id: String,
    },

    /// 查询兑换历史（最新的在前）
    History {
        #[arg(short, long)]
        user_id: String,
    },

    /// 查询积分流水
    PointsHistory {
        #[arg(short, long)]
        user_id: String,
    },

    /// 列出用户的成就记录
    Achievements {
        #[arg(short, long)]
        user_id: String,
    },

    /// 恢复用户所有 Pending 成就
    Resume {
        #[arg(short, long)]
        user_id: String,
    },

    /// 写入奖励目录条目
    SeedReward {
        #[arg(short, long)]
        reward_id: String,

        #[arg(short, long)]
        cost: u64,

        /// 库存（不传表示不限量）
        #[arg(long)]
        stock: Option<u64>,

        /// 以下线状态写入
        #[arg(long)]
        inactive: bool,
    },
}
