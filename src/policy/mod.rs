//! 副作用分类与重放策略
//!
//! - **types**: SideEffectClass / ReplayPolicy 及其持久化表示
//! - **table**: 启动时加载一次的不可变策略表（MCP 白/黑名单、关键词、显式规则）
//! - **classifier**: 纯函数分类，附带命中规则 id 供审计

pub mod classifier;
pub mod table;
pub mod types;

pub(crate) use classifier::name_tokens;
pub use classifier::Classification;
pub use table::{PolicyRule, PolicySection, PolicyTable, RuleEntry};
pub use types::{ReplayPolicy, SideEffectClass};
