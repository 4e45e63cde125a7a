//! 恢复判定
//!
//! 进程重启后，根据记录的状态与重放策略判断"重做是否安全"。账本只给出判定，是否真的重做由上层决定；
//! 上层执行完判定后用 [`ReplayDecision::replay_status`] 的值调用 `mark_replay_status` 留痕。

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::ledger::{PrepareRequest, ToolCall, ToolCallStatus};
use crate::policy::ReplayPolicy;

/// 对一条历史记录的重放判定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayDecision {
    /// 已成功：直接复用凭据
    SkipAlreadySucceeded,
    /// 重做无外部后果，或副作用从未开始
    SafeToRedo,
    /// 子任务：以新 nonce 重新派生，而不是重复旧调用
    Relaunch,
    /// 结果未知且需要幂等保护：交给人工
    NeedsHuman,
}

impl ReplayDecision {
    pub fn replay_status(&self) -> &'static str {
        match self {
            ReplayDecision::SkipAlreadySucceeded => "skipped-already-succeeded",
            ReplayDecision::SafeToRedo => "redone",
            ReplayDecision::Relaunch => "relaunched",
            ReplayDecision::NeedsHuman => "needs-human",
        }
    }
}

pub fn plan_replay(call: &ToolCall) -> ReplayDecision {
    match call.status {
        ToolCallStatus::Succeeded => ReplayDecision::SkipAlreadySucceeded,
        // 执行器从未接手，外部世界没有变化
        ToolCallStatus::Prepared => ReplayDecision::SafeToRedo,
        ToolCallStatus::Running | ToolCallStatus::AbandonedOnResume | ToolCallStatus::Failed => {
            match call.replay_policy {
                ReplayPolicy::ReplayIdempotent => ReplayDecision::SafeToRedo,
                ReplayPolicy::Relaunch => ReplayDecision::Relaunch,
                ReplayPolicy::ReplayExact => ReplayDecision::NeedsHuman,
            }
        }
    }
}

/// Relaunch 判定的后续：新 tool_call_id 兼作 nonce，得到与旧记录不冲突的幂等键。
/// 账本只保存截断后的请求引用，原始参数由调用方提供。
pub fn relaunch_request(call: &ToolCall, raw_args: Value) -> PrepareRequest {
    let tool_call_id = Uuid::new_v4().to_string();
    PrepareRequest::new(
        tool_call_id.clone(),
        call.run_id.clone(),
        call.step_id.clone(),
        call.tool_name.clone(),
        call.tool_namespace.clone(),
        raw_args,
    )
    .with_raw_tool_name(call.raw_tool_name.clone())
    .with_nonce(tool_call_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResumeItem {
    pub tool_call_id: String,
    pub tool_name: String,
    pub idempotency_key: String,
    pub decision: ReplayDecision,
}

/// 一次恢复扫描的结果：被标记为 abandoned_on_resume 的记录及其判定
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResumeReport {
    pub abandoned: Vec<ResumeItem>,
}

impl ResumeReport {
    pub fn needs_human(&self) -> impl Iterator<Item = &ResumeItem> {
        self.abandoned
            .iter()
            .filter(|item| item.decision == ReplayDecision::NeedsHuman)
    }
}
