//! 账本记录类型

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::policy::{ReplayPolicy, SideEffectClass};

/// 工具调用状态：prepared → running → {succeeded, failed}；abandoned_on_resume 只在恢复时写入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Prepared,
    Running,
    Succeeded,
    Failed,
    AbandonedOnResume,
}

impl ToolCallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolCallStatus::Prepared => "prepared",
            ToolCallStatus::Running => "running",
            ToolCallStatus::Succeeded => "succeeded",
            ToolCallStatus::Failed => "failed",
            ToolCallStatus::AbandonedOnResume => "abandoned_on_resume",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolCallStatus::Succeeded | ToolCallStatus::Failed)
    }
}

impl FromStr for ToolCallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "prepared" => Ok(ToolCallStatus::Prepared),
            "running" => Ok(ToolCallStatus::Running),
            "succeeded" => Ok(ToolCallStatus::Succeeded),
            "failed" => Ok(ToolCallStatus::Failed),
            "abandoned_on_resume" => Ok(ToolCallStatus::AbandonedOnResume),
            other => Err(format!("unknown tool call status: {other}")),
        }
    }
}

impl fmt::Display for ToolCallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for ToolCallStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ToolCallStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// 一次执行尝试的持久记录
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub tool_call_id: String,
    pub run_id: String,
    pub step_id: String,
    pub raw_tool_name: String,
    pub tool_name: String,
    pub tool_namespace: String,
    pub side_effect_class: SideEffectClass,
    pub replay_policy: ReplayPolicy,
    pub policy_matched: bool,
    pub policy_rule_id: String,
    pub normalized_args_hash: String,
    pub side_effect_scope: String,
    pub idempotency_key: String,
    pub status: ToolCallStatus,
    pub attempt: u32,
    pub request_ref: Option<String>,
    pub response_ref: Option<String>,
    pub external_correlation_id: Option<String>,
    pub error_detail: Option<String>,
    pub replay_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ToolCall {
    /// 仅 succeeded 的记录才能当作已完成的凭据
    pub fn receipt(&self) -> Option<ToolReceipt> {
        (self.status == ToolCallStatus::Succeeded).then(|| ToolReceipt {
            tool_call_id: self.tool_call_id.clone(),
            idempotency_key: self.idempotency_key.clone(),
            response_ref: self.response_ref.clone(),
            external_correlation_id: self.external_correlation_id.clone(),
            completed_at: self.updated_at,
        })
    }
}

/// 某个幂等键已经成功执行过的凭据
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolReceipt {
    pub tool_call_id: String,
    pub idempotency_key: String,
    pub response_ref: Option<String>,
    pub external_correlation_id: Option<String>,
    pub completed_at: DateTime<Utc>,
}

/// 带外确认的暂存回执
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingReceipt {
    pub tool_call_id: String,
    pub response_ref: Option<String>,
    pub external_correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// prepare_tool_call 的输入
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub tool_call_id: String,
    pub run_id: String,
    pub step_id: String,
    /// 模型给出的原始工具名（审计用）；为空时使用 tool_name
    pub raw_tool_name: Option<String>,
    pub tool_name: String,
    pub tool_namespace: String,
    pub raw_args: Value,
    pub allow_duplicate: bool,
    pub nonce: Option<String>,
}

impl PrepareRequest {
    pub fn new(
        tool_call_id: impl Into<String>,
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        tool_name: impl Into<String>,
        tool_namespace: impl Into<String>,
        raw_args: Value,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            run_id: run_id.into(),
            step_id: step_id.into(),
            raw_tool_name: None,
            tool_name: tool_name.into(),
            tool_namespace: tool_namespace.into(),
            raw_args,
            allow_duplicate: false,
            nonce: None,
        }
    }

    pub fn with_raw_tool_name(mut self, raw: impl Into<String>) -> Self {
        self.raw_tool_name = Some(raw.into());
        self
    }

    pub fn allow_duplicate(mut self, allow: bool) -> Self {
        self.allow_duplicate = allow;
        self
    }

    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
}

/// prepare_tool_call 的结果
#[derive(Debug, Clone)]
pub enum PrepareOutcome {
    /// 新插入一行，状态 prepared，可以交给执行器
    Prepared { record: ToolCall },
    /// 同一幂等键已成功：不再执行，直接使用凭据
    AlreadySucceeded {
        receipt: ToolReceipt,
        idempotency_key: String,
    },
    /// 另一次尝试正持有该幂等键（或未成功结束）：稍后重试，不阻塞等待
    InFlight {
        idempotency_key: String,
        existing_status: Option<ToolCallStatus>,
    },
}

impl PrepareOutcome {
    pub fn idempotency_key(&self) -> &str {
        match self {
            PrepareOutcome::Prepared { record } => &record.idempotency_key,
            PrepareOutcome::AlreadySucceeded {
                idempotency_key, ..
            } => idempotency_key,
            PrepareOutcome::InFlight {
                idempotency_key, ..
            } => idempotency_key,
        }
    }

    pub fn receipt(&self) -> Option<&ToolReceipt> {
        match self {
            PrepareOutcome::AlreadySucceeded { receipt, .. } => Some(receipt),
            _ => None,
        }
    }

    pub fn is_prepared(&self) -> bool {
        matches!(self, PrepareOutcome::Prepared { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_strings() {
        for status in [
            ToolCallStatus::Prepared,
            ToolCallStatus::Running,
            ToolCallStatus::Succeeded,
            ToolCallStatus::Failed,
            ToolCallStatus::AbandonedOnResume,
        ] {
            assert_eq!(status.as_str().parse::<ToolCallStatus>(), Ok(status));
        }
        assert!(ToolCallStatus::Failed.is_terminal());
        assert!(!ToolCallStatus::AbandonedOnResume.is_terminal());
    }
}
