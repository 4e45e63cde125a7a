//! 工具接口与受账本保护的执行器

pub mod executor;
pub mod registry;

pub use executor::{GuardedExecutor, GuardedOutcome, ToolInvocation};
pub use registry::{Tool, ToolOutput, ToolRegistry};
