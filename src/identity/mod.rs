//! 工具身份解析：原始工具名 → 命名空间 + 规范工具名，识别并尽力修复模型把参数拼进工具名的情况

pub mod resolver;

pub use resolver::{RecoveredArg, ResolvedTool, ResolverConfig, ToolNameResolver};
