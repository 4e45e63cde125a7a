//! 带账本保护的工具执行器
//!
//! 调用顺序：解析工具名 → 畸形名拒绝 → prepare → 命中凭据则直接返回 → mark_running →
//! 超时内执行 → mark_succeeded / mark_failed。每次真正执行都输出一行 JSON 审计日志。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

use crate::core::LedgerError;
use crate::identity::{ResolvedTool, ToolNameResolver};
use crate::ledger::{Ledger, PrepareOutcome, PrepareRequest, ToolCallStatus, ToolReceipt};
use crate::tools::ToolRegistry;

/// 一次来自模型的工具调用
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub tool_call_id: String,
    pub run_id: String,
    pub step_id: String,
    pub raw_tool_name: String,
    pub args: Value,
    pub allow_duplicate: bool,
    pub nonce: Option<String>,
}

impl ToolInvocation {
    pub fn new(
        tool_call_id: impl Into<String>,
        run_id: impl Into<String>,
        step_id: impl Into<String>,
        raw_tool_name: impl Into<String>,
        args: Value,
    ) -> Self {
        Self {
            tool_call_id: tool_call_id.into(),
            run_id: run_id.into(),
            step_id: step_id.into(),
            raw_tool_name: raw_tool_name.into(),
            args,
            allow_duplicate: false,
            nonce: None,
        }
    }

    /// 显式重试已失败的同一调用时使用
    pub fn with_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.nonce = Some(nonce.into());
        self
    }
}

#[derive(Debug, Clone)]
pub enum GuardedOutcome {
    /// 本次真正执行并成功
    Executed {
        tool_call_id: String,
        idempotency_key: String,
        content: String,
    },
    /// 同一幂等键已成功过，未再执行
    Replayed { receipt: ToolReceipt },
    /// 另一次尝试持有该键（prepared / running），稍后重试
    InFlight {
        idempotency_key: String,
        existing_status: Option<ToolCallStatus>,
    },
    /// 该键上的上一次尝试已失败或在恢复时被放弃，不会自动重做。
    /// 确认要再次执行时带上 nonce 重新提交（见 `core::recovery::relaunch_request`）
    NeedsNonce {
        idempotency_key: String,
        existing_status: ToolCallStatus,
    },
    /// 工具名畸形，应让模型重新组织调用
    Reformulate { resolved: ResolvedTool },
    /// 解析出的工具没有注册，未写账本
    UnknownTool {
        tool_namespace: String,
        tool_name: String,
    },
    /// 执行失败或超时，已 mark_failed
    Failed { tool_call_id: String, error: String },
}

pub struct GuardedExecutor {
    ledger: Arc<Ledger>,
    registry: ToolRegistry,
    resolver: ToolNameResolver,
    timeout: Duration,
}

impl GuardedExecutor {
    pub fn new(
        ledger: Arc<Ledger>,
        registry: ToolRegistry,
        resolver: ToolNameResolver,
        timeout_secs: u64,
    ) -> Self {
        Self {
            ledger,
            registry,
            resolver,
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// 只有账本本身出错（完整性破坏、存储故障）才返回 Err
    pub async fn execute(&self, inv: ToolInvocation) -> Result<GuardedOutcome, LedgerError> {
        let resolved = self.resolver.resolve(&inv.raw_tool_name);
        if resolved.needs_reformulation() {
            tracing::warn!(
                tool_call_id = %inv.tool_call_id,
                raw_tool_name = %inv.raw_tool_name,
                "rejecting call for reformulation"
            );
            return Ok(GuardedOutcome::Reformulate { resolved });
        }

        let Some(tool) = self
            .registry
            .get(&resolved.tool_namespace, &resolved.tool_name)
        else {
            return Ok(GuardedOutcome::UnknownTool {
                tool_namespace: resolved.tool_namespace,
                tool_name: resolved.tool_name,
            });
        };

        let mut request = PrepareRequest::new(
            inv.tool_call_id.clone(),
            inv.run_id,
            inv.step_id,
            resolved.tool_name.clone(),
            resolved.tool_namespace.clone(),
            inv.args.clone(),
        )
        .with_raw_tool_name(inv.raw_tool_name)
        .allow_duplicate(inv.allow_duplicate);
        if let Some(nonce) = inv.nonce {
            request = request.with_nonce(nonce);
        }

        let record = match self.ledger.prepare_tool_call(request)? {
            PrepareOutcome::Prepared { record } => record,
            PrepareOutcome::AlreadySucceeded { receipt, .. } => {
                return Ok(GuardedOutcome::Replayed { receipt })
            }
            PrepareOutcome::InFlight {
                idempotency_key,
                existing_status,
            } => {
                return Ok(match existing_status {
                    Some(
                        status @ (ToolCallStatus::Failed | ToolCallStatus::AbandonedOnResume),
                    ) => GuardedOutcome::NeedsNonce {
                        idempotency_key,
                        existing_status: status,
                    },
                    existing_status => GuardedOutcome::InFlight {
                        idempotency_key,
                        existing_status,
                    },
                })
            }
        };

        self.ledger.mark_running(&record.tool_call_id)?;
        let start = Instant::now();
        let result = timeout(self.timeout, tool.execute(inv.args.clone())).await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": resolved.tool_name,
            "namespace": resolved.tool_namespace,
            "tool_call_id": record.tool_call_id,
            "idempotency_key": record.idempotency_key,
            "attempt": record.attempt,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview(&inv.args),
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(output)) => {
                self.ledger.mark_succeeded(
                    &record.tool_call_id,
                    Some(&output.content),
                    output.correlation_id.as_deref(),
                )?;
                Ok(GuardedOutcome::Executed {
                    tool_call_id: record.tool_call_id,
                    idempotency_key: record.idempotency_key,
                    content: output.content,
                })
            }
            Ok(Err(e)) => {
                self.ledger.mark_failed(&record.tool_call_id, &e)?;
                Ok(GuardedOutcome::Failed {
                    tool_call_id: record.tool_call_id,
                    error: e,
                })
            }
            Err(_) => {
                let error = format!("timed out after {}ms", self.timeout.as_millis());
                self.ledger.mark_failed(&record.tool_call_id, &error)?;
                Ok(GuardedOutcome::Failed {
                    tool_call_id: record.tool_call_id,
                    error,
                })
            }
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerOptions;
    use crate::tools::{Tool, ToolOutput};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SendEmail {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Tool for SendEmail {
        fn name(&self) -> &str {
            "GMAIL_SEND_EMAIL"
        }

        fn namespace(&self) -> &str {
            "mcp"
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolOutput::text("sent").with_correlation_id(format!("msg-{n}")))
        }
    }

    struct Slow;

    #[async_trait]
    impl Tool for Slow {
        fn name(&self) -> &str {
            "CREATE_REPORT"
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(ToolOutput::text("late"))
        }
    }

    struct Broken;

    #[async_trait]
    impl Tool for Broken {
        fn name(&self) -> &str {
            "DELETE_ROW"
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            Err("permission denied".to_string())
        }
    }

    fn executor(calls: Arc<AtomicUsize>) -> GuardedExecutor {
        let ledger = Ledger::open_in_memory(LedgerOptions::default()).unwrap();
        ledger.register_run("run-1").unwrap();
        ledger.register_step("run-1", "step-1").unwrap();
        let mut registry = ToolRegistry::new();
        registry.register(SendEmail { calls });
        registry.register(Slow);
        registry.register(Broken);
        GuardedExecutor::new(
            Arc::new(ledger),
            registry,
            ToolNameResolver::default(),
            30,
        )
    }

    fn email(id: &str, body: &str) -> ToolInvocation {
        ToolInvocation::new(
            id,
            "run-1",
            "step-1",
            "mcp__gmail__GMAIL_SEND_EMAIL",
            json!({"to": "bob@example.com", "subject": "Hi", "body": body}),
        )
    }

    #[tokio::test]
    async fn test_second_send_is_replayed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor(calls.clone());

        let first = exec.execute(email("tc-1", "hello")).await.unwrap();
        assert!(matches!(first, GuardedOutcome::Executed { .. }));

        let second = exec.execute(email("tc-2", "hello again")).await.unwrap();
        match second {
            GuardedOutcome::Replayed { receipt } => {
                assert_eq!(receipt.tool_call_id, "tc-1");
                assert_eq!(receipt.external_correlation_id.as_deref(), Some("msg-0"));
            }
            other => panic!("expected Replayed, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_malformed_name_is_not_prepared() {
        let exec = executor(Arc::new(AtomicUsize::new(0)));
        let inv = ToolInvocation::new(
            "tc-1",
            "run-1",
            "step-1",
            "DELETE_ROW<arg_key>id</arg_key><arg_value>3</arg_value>",
            json!({}),
        );
        let outcome = exec.execute(inv).await.unwrap();
        assert!(matches!(outcome, GuardedOutcome::Reformulate { .. }));
        assert!(exec.ledger().get_tool_call("tc-1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let exec = executor(Arc::new(AtomicUsize::new(0)));
        let inv = ToolInvocation::new("tc-1", "run-1", "step-1", "NOPE", json!({}));
        let outcome = exec.execute(inv).await.unwrap();
        assert!(matches!(outcome, GuardedOutcome::UnknownTool { .. }));
    }

    #[tokio::test]
    async fn test_tool_error_marks_failed() {
        let exec = executor(Arc::new(AtomicUsize::new(0)));
        let inv = ToolInvocation::new("tc-1", "run-1", "step-1", "DELETE_ROW", json!({"id": 3}));
        let outcome = exec.execute(inv).await.unwrap();
        assert!(matches!(outcome, GuardedOutcome::Failed { .. }));
        let row = exec.ledger().get_tool_call("tc-1").unwrap().unwrap();
        assert_eq!(row.status, ToolCallStatus::Failed);
        assert_eq!(row.error_detail.as_deref(), Some("permission denied"));
    }

    #[tokio::test]
    async fn test_timeout_marks_failed() {
        let exec = executor(Arc::new(AtomicUsize::new(0))).with_timeout(Duration::from_millis(20));
        let inv = ToolInvocation::new("tc-1", "run-1", "step-1", "CREATE_REPORT", json!({}));
        match exec.execute(inv).await.unwrap() {
            GuardedOutcome::Failed { error, .. } => assert!(error.contains("timed out")),
            other => panic!("expected Failed, got {other:?}"),
        }
        let row = exec.ledger().get_tool_call("tc-1").unwrap().unwrap();
        assert_eq!(row.status, ToolCallStatus::Failed);
    }

    #[tokio::test]
    async fn test_failed_call_needs_nonce_to_retry() {
        let exec = executor(Arc::new(AtomicUsize::new(0)));
        let first = ToolInvocation::new("tc-1", "run-1", "step-1", "DELETE_ROW", json!({"id": 3}));
        assert!(matches!(
            exec.execute(first).await.unwrap(),
            GuardedOutcome::Failed { .. }
        ));

        let again = ToolInvocation::new("tc-2", "run-1", "step-1", "DELETE_ROW", json!({"id": 3}));
        match exec.execute(again).await.unwrap() {
            GuardedOutcome::NeedsNonce {
                existing_status, ..
            } => assert_eq!(existing_status, ToolCallStatus::Failed),
            other => panic!("expected NeedsNonce, got {other:?}"),
        }
        assert!(exec.ledger().get_tool_call("tc-2").unwrap().is_none());

        // 带 nonce 的显式重试会真正执行
        let retry = ToolInvocation::new("tc-3", "run-1", "step-1", "DELETE_ROW", json!({"id": 3}))
            .with_nonce("retry-1");
        assert!(matches!(
            exec.execute(retry).await.unwrap(),
            GuardedOutcome::Failed { .. }
        ));
        let row = exec.ledger().get_tool_call("tc-3").unwrap().unwrap();
        assert_eq!(row.status, ToolCallStatus::Failed);
    }
}
