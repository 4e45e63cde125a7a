//! 账本错误类型
//!
//! 只有引用完整性被破坏（run / step 父记录不存在）是致命错误，调用方应终止整个 run；
//! 去重命中、竞争落败、非法状态迁移都不是错误，以 PrepareOutcome / bool / Option 返回。

use thiserror::Error;

/// 存储层插入失败的分类：唯一约束冲突可恢复（重读后决定），外键冲突致命
#[derive(Error, Debug)]
pub enum InsertError {
    #[error("unique constraint violated on {0:?}")]
    UniqueViolation(UniqueTarget),

    #[error("foreign key constraint violated")]
    ForeignKeyViolation,

    #[error("ledger connection lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Other(rusqlite::Error),
}

/// 哪个唯一约束被触发
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueTarget {
    IdempotencyKey,
    ToolCallId,
}

impl From<rusqlite::Error> for InsertError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ffi;

        if let rusqlite::Error::SqliteFailure(code, msg) = &err {
            match code.extended_code {
                ffi::SQLITE_CONSTRAINT_FOREIGNKEY => return InsertError::ForeignKeyViolation,
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => {
                    let on_key = msg
                        .as_deref()
                        .map(|m| m.contains("idempotency_key"))
                        .unwrap_or(false);
                    return InsertError::UniqueViolation(if on_key {
                        UniqueTarget::IdempotencyKey
                    } else {
                        UniqueTarget::ToolCallId
                    });
                }
                _ => {}
            }
        }
        InsertError::Other(err)
    }
}

/// 账本对外暴露的错误
#[derive(Error, Debug)]
pub enum LedgerError {
    /// run / step 父记录缺失：执行上下文已损坏，不可重试
    #[error("integrity violation for {subject}: {detail}")]
    Integrity { subject: String, detail: String },

    /// 同一个 tool_call_id 被用于另一个幂等键
    #[error("tool_call_id {0} already used for a different idempotency key")]
    ToolCallIdConflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("ledger io error: {0}")]
    Io(#[from] std::io::Error),

    /// 调用方未单独处理的约束冲突
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("ledger connection lock poisoned")]
    LockPoisoned,
}

impl From<InsertError> for LedgerError {
    fn from(err: InsertError) -> Self {
        match err {
            InsertError::Other(e) => LedgerError::Storage(e),
            InsertError::LockPoisoned => LedgerError::LockPoisoned,
            other => LedgerError::Constraint(other.to_string()),
        }
    }
}

impl LedgerError {
    /// 是否应当让整个 run 失败而不是尝试执行工具
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LedgerError::Integrity { .. } | LedgerError::ToolCallIdConflict(_)
        )
    }
}
