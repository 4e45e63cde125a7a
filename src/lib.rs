//! Bee Ledger - 工具调用的持久化执行账本
//!
//! 保证带副作用的工具调用在重试、并发竞争与进程崩溃后至多执行一次。
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与崩溃恢复后的重放判定
//! - **identity**: 原始工具名 → (命名空间, 工具名)，识别畸形名
//! - **policy**: 副作用分类与重放策略
//! - **normalize**: 参数规范化、哈希、易变字段剔除、副作用范围
//! - **ledger**: 账本本体（SQLite 存储、幂等键、状态迁移、审计）
//! - **tools**: 工具注册表与受账本保护的执行器
//! - **observability**: tracing 初始化

pub mod config;
pub mod core;
pub mod identity;
pub mod ledger;
pub mod normalize;
pub mod observability;
pub mod policy;
pub mod tools;

pub use crate::core::{LedgerError, ReplayDecision};
pub use crate::ledger::{Ledger, LedgerOptions, PrepareOutcome, PrepareRequest, ToolCallStatus};
