//! 工具调用执行账本
//!
//! - **types**: 持久记录、回执、prepare 的输入输出
//! - **key**: 幂等键推导
//! - **store**: SQLite 存储，唯一约束即去重的唯一依据
//! - **audit**: 未分类工具的一次性审计出口
//! - **engine**: Ledger 本体，串起分类、规范化、去重与状态迁移

pub mod audit;
pub mod engine;
pub mod key;
pub mod store;
pub mod types;

pub use audit::{AuditEvent, AuditSink, JsonlAuditSink, MemoryAuditSink, TracingAuditSink};
pub use engine::{Ledger, LedgerOptions};
pub use key::{idempotency_key, KeyMaterial};
pub use store::LedgerStore;
pub use types::{
    PendingReceipt, PrepareOutcome, PrepareRequest, ToolCall, ToolCallStatus, ToolReceipt,
};

/// 按字符截断引用文本，超出部分以 `...` 标记
pub(crate) fn truncate_ref(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::truncate_ref;

    #[test]
    fn test_truncate_ref_counts_chars() {
        assert_eq!(truncate_ref("短文本", 10), "短文本");
        assert_eq!(truncate_ref("你好世界", 2), "你好...");
    }
}
