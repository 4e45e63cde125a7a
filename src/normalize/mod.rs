//! 参数规范化：确定性序列化、内容哈希、易变字段剔除与副作用范围
//!
//! - **canonical**: 任意 JSON 参数 → 规范字符串 → SHA-256 摘要
//! - **volatile**: 剔除请求 id、批量执行会话 id 等不影响去重判断的字段
//! - **scope**: 按工具族（邮件发送 / 上传 / 记忆写入 / 通用）缩减为决定真实副作用的字段

pub mod canonical;
pub mod scope;
pub mod volatile;

pub use canonical::{digest, hash, normalize, normalize_serializable, unordered};
pub use scope::{SideEffectScope, ToolArgs};
pub use volatile::SanitizeConfig;
