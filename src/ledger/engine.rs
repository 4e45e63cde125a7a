//! Ledger：prepare → running → succeeded / failed
//!
//! 并发去重只靠 `idempotency_key` 唯一约束：竞争者各自插入，输的一方重读后要么复用成功凭据，
//! 要么得到 InFlight（稍后重试），从不阻塞等待赢家完成。
//! 除 prepare 外的操作都是按 tool_call_id 的单行更新，由持有该调用的执行上下文发起。

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::core::error::{InsertError, LedgerError, UniqueTarget};
use crate::core::recovery::{plan_replay, ResumeItem, ResumeReport};
use crate::ledger::audit::{AuditEvent, AuditSink, JsonlAuditSink, TracingAuditSink};
use crate::ledger::key::{idempotency_key, KeyMaterial};
use crate::ledger::store::LedgerStore;
use crate::ledger::truncate_ref;
use crate::ledger::types::{
    PendingReceipt, PrepareOutcome, PrepareRequest, ToolCall, ToolCallStatus, ToolReceipt,
};
use crate::normalize::{hash, normalize, SanitizeConfig, ToolArgs};
use crate::policy::{Classification, PolicyTable, ReplayPolicy};

/// 构造 Ledger 时注入的不可变依赖
pub struct LedgerOptions {
    pub policy: PolicyTable,
    pub sanitize: SanitizeConfig,
    /// request_ref / response_ref / error_detail 的最大字符数
    pub max_ref_chars: usize,
    pub busy_timeout: Duration,
    pub audit: Arc<dyn AuditSink>,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            policy: PolicyTable::default(),
            sanitize: SanitizeConfig::default(),
            max_ref_chars: 4000,
            busy_timeout: Duration::from_millis(5000),
            audit: Arc::new(TracingAuditSink),
        }
    }
}

impl LedgerOptions {
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_policy(mut self, policy: PolicyTable) -> Self {
        self.policy = policy;
        self
    }
}

pub struct Ledger {
    store: LedgerStore,
    policy: RwLock<Arc<PolicyTable>>,
    sanitize: SanitizeConfig,
    max_ref_chars: usize,
    audit: Arc<dyn AuditSink>,
    /// 已写过审计记录的 (namespace, tool)，打开时从库里恢复
    audited: Mutex<HashSet<(String, String)>>,
}

impl Ledger {
    pub fn open(path: impl AsRef<Path>, options: LedgerOptions) -> Result<Self, LedgerError> {
        let store = LedgerStore::open(path.as_ref(), options.busy_timeout)?;
        info!(path = %path.as_ref().display(), "ledger opened");
        Self::with_store(store, options)
    }

    pub fn open_in_memory(options: LedgerOptions) -> Result<Self, LedgerError> {
        Self::with_store(LedgerStore::open_in_memory()?, options)
    }

    /// 按 [ledger] / [identity] / [policy] / [normalize] 段构造，审计写入 JSONL 文件
    pub fn from_config(cfg: &AppConfig) -> Result<Self, LedgerError> {
        let policy = PolicyTable::new(
            &cfg.policy,
            &cfg.identity.mcp_namespace,
            &cfg.identity.native_namespace,
            &cfg.identity.spawn_alias,
        );
        let options = LedgerOptions {
            policy,
            sanitize: cfg.normalize.clone(),
            max_ref_chars: cfg.ledger.max_ref_chars,
            busy_timeout: Duration::from_millis(cfg.ledger.busy_timeout_ms),
            audit: Arc::new(JsonlAuditSink::new(&cfg.ledger.audit_log_path)),
        };
        Self::open(&cfg.ledger.db_path, options)
    }

    fn with_store(store: LedgerStore, options: LedgerOptions) -> Result<Self, LedgerError> {
        let audited: HashSet<(String, String)> = store.unmatched_pairs()?.into_iter().collect();
        Ok(Self {
            store,
            policy: RwLock::new(Arc::new(options.policy)),
            sanitize: options.sanitize,
            max_ref_chars: options.max_ref_chars,
            audit: options.audit,
            audited: Mutex::new(audited),
        })
    }

    /// 当前策略表快照；每次 prepare 都重新取，替换后立即生效
    pub fn policy(&self) -> Result<Arc<PolicyTable>, LedgerError> {
        self.policy
            .read()
            .map(|p| Arc::clone(&p))
            .map_err(|_| LedgerError::LockPoisoned)
    }

    pub fn replace_policy(&self, policy: PolicyTable) -> Result<(), LedgerError> {
        let mut guard = self.policy.write().map_err(|_| LedgerError::LockPoisoned)?;
        *guard = Arc::new(policy);
        info!("ledger policy table replaced");
        Ok(())
    }

    pub fn register_run(&self, run_id: &str) -> Result<(), LedgerError> {
        self.store.insert_run(run_id, Utc::now())
    }

    /// run 不存在时返回致命的 Integrity 错误
    pub fn register_step(&self, run_id: &str, step_id: &str) -> Result<(), LedgerError> {
        match self.store.insert_step(run_id, step_id, Utc::now()) {
            Ok(()) => Ok(()),
            Err(InsertError::ForeignKeyViolation) => Err(LedgerError::Integrity {
                subject: format!("step {step_id}"),
                detail: format!("run {run_id} is not registered"),
            }),
            Err(e) => Err(e.into()),
        }
    }

    pub fn prepare_tool_call(&self, req: PrepareRequest) -> Result<PrepareOutcome, LedgerError> {
        let policy = self.policy()?;
        let class = policy.classify(&req.tool_name, &req.tool_namespace);

        let sanitized = self.sanitize.sanitize(&req.tool_name, &req.raw_args);
        let args_hash = hash(&sanitized);
        let scope =
            ToolArgs::from_call(&req.tool_name, class.side_effect, &sanitized).scope(&args_hash);

        let nonce = match req.nonce.as_deref() {
            Some(nonce) => Some(nonce),
            None if req.allow_duplicate || class.replay_policy == ReplayPolicy::Relaunch => {
                Some(req.tool_call_id.as_str())
            }
            None => None,
        };
        let key = idempotency_key(&KeyMaterial {
            run_id: &req.run_id,
            namespace: &req.tool_namespace,
            tool_name: &req.tool_name,
            args_hash: &scope.relevant_hash,
            scope: &scope.scope,
            nonce,
        });

        if !req.allow_duplicate {
            if let Some(receipt) = self.store.find_by_key(&key)?.and_then(|c| c.receipt()) {
                info!(
                    tool_call_id = %req.tool_call_id,
                    idempotency_key = %key,
                    prior_tool_call_id = %receipt.tool_call_id,
                    "dedup hit, returning prior receipt"
                );
                return Ok(PrepareOutcome::AlreadySucceeded {
                    receipt,
                    idempotency_key: key,
                });
            }
        }

        if !class.policy_matched {
            self.audit_unclassified(&req, &class);
        }

        let attempt = self.store.count_attempts(
            &req.run_id,
            &req.step_id,
            &req.tool_namespace,
            &req.tool_name,
            &args_hash,
        )? + 1;
        let now = Utc::now();
        let record = ToolCall {
            tool_call_id: req.tool_call_id.clone(),
            run_id: req.run_id.clone(),
            step_id: req.step_id.clone(),
            raw_tool_name: req
                .raw_tool_name
                .clone()
                .unwrap_or_else(|| req.tool_name.clone()),
            tool_name: req.tool_name.clone(),
            tool_namespace: req.tool_namespace.clone(),
            side_effect_class: class.side_effect,
            replay_policy: class.replay_policy,
            policy_matched: class.policy_matched,
            policy_rule_id: class.policy_rule_id,
            normalized_args_hash: args_hash,
            side_effect_scope: scope.scope,
            idempotency_key: key.clone(),
            status: ToolCallStatus::Prepared,
            attempt,
            request_ref: Some(truncate_ref(&normalize(&sanitized), self.max_ref_chars)),
            response_ref: None,
            external_correlation_id: None,
            error_detail: None,
            replay_status: None,
            created_at: now,
            updated_at: now,
        };

        match self.store.insert_tool_call(&record) {
            Ok(()) => {
                info!(
                    tool_call_id = %record.tool_call_id,
                    idempotency_key = %key,
                    tool_name = %record.tool_name,
                    side_effect_class = %record.side_effect_class,
                    replay_policy = %record.replay_policy,
                    attempt,
                    "tool call prepared"
                );
                Ok(PrepareOutcome::Prepared { record })
            }
            Err(InsertError::UniqueViolation(UniqueTarget::IdempotencyKey)) => {
                self.resolve_race(&req.tool_call_id, key)
            }
            Err(InsertError::UniqueViolation(UniqueTarget::ToolCallId)) => {
                match self.store.get(&req.tool_call_id)? {
                    Some(existing) if existing.idempotency_key == key => {
                        self.resolve_race(&req.tool_call_id, key)
                    }
                    _ => {
                        warn!(tool_call_id = %req.tool_call_id, "tool_call_id reused for another key");
                        Err(LedgerError::ToolCallIdConflict(req.tool_call_id))
                    }
                }
            }
            Err(InsertError::ForeignKeyViolation) => {
                warn!(
                    tool_call_id = %req.tool_call_id,
                    run_id = %req.run_id,
                    step_id = %req.step_id,
                    "tool call references missing run/step"
                );
                Err(LedgerError::Integrity {
                    subject: format!("tool_call {}", req.tool_call_id),
                    detail: format!(
                        "run {} / step {} is not registered",
                        req.run_id, req.step_id
                    ),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// 插入因唯一约束失败：重读赢家那一行
    fn resolve_race(&self, tool_call_id: &str, key: String) -> Result<PrepareOutcome, LedgerError> {
        let existing = self.store.find_by_key(&key)?;
        if let Some(receipt) = existing.as_ref().and_then(ToolCall::receipt) {
            info!(tool_call_id, idempotency_key = %key, "lost insert race to a succeeded call");
            return Ok(PrepareOutcome::AlreadySucceeded {
                receipt,
                idempotency_key: key,
            });
        }
        let existing_status = existing.map(|c| c.status);
        debug!(
            tool_call_id,
            idempotency_key = %key,
            existing_status = ?existing_status,
            "idempotency key in flight"
        );
        Ok(PrepareOutcome::InFlight {
            idempotency_key: key,
            existing_status,
        })
    }

    fn audit_unclassified(&self, req: &PrepareRequest, class: &Classification) {
        let pair = (req.tool_namespace.clone(), req.tool_name.clone());
        let first_seen = match self.audited.lock() {
            Ok(mut seen) => seen.insert(pair),
            Err(_) => {
                warn!("audit set lock poisoned, skipping unclassified tool record");
                return;
            }
        };
        if !first_seen {
            return;
        }
        let event = AuditEvent {
            event: "unclassified_tool",
            tool_namespace: req.tool_namespace.clone(),
            tool_name: req.tool_name.clone(),
            raw_tool_name: req
                .raw_tool_name
                .clone()
                .unwrap_or_else(|| req.tool_name.clone()),
            policy_rule_id: class.policy_rule_id.clone(),
            side_effect_class: class.side_effect,
            replay_policy: class.replay_policy,
            tool_call_id: req.tool_call_id.clone(),
            run_id: req.run_id.clone(),
            observed_at: Utc::now(),
        };
        if let Err(e) = self.audit.record(&event) {
            warn!(
                tool_namespace = %event.tool_namespace,
                tool_name = %event.tool_name,
                error = %e,
                "failed to write unclassified tool audit record"
            );
        }
    }

    pub fn mark_running(&self, tool_call_id: &str) -> Result<bool, LedgerError> {
        let ok = self.store.set_running(tool_call_id, Utc::now())?;
        log_transition(tool_call_id, ToolCallStatus::Running, ok);
        Ok(ok)
    }

    pub fn mark_succeeded(
        &self,
        tool_call_id: &str,
        response_ref: Option<&str>,
        external_correlation_id: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let response_ref = response_ref.map(|r| truncate_ref(r, self.max_ref_chars));
        let ok = self.store.set_succeeded(
            tool_call_id,
            response_ref.as_deref(),
            external_correlation_id,
            Utc::now(),
        )?;
        log_transition(tool_call_id, ToolCallStatus::Succeeded, ok);
        Ok(ok)
    }

    pub fn mark_failed(&self, tool_call_id: &str, error_detail: &str) -> Result<bool, LedgerError> {
        let detail = truncate_ref(error_detail, self.max_ref_chars);
        let ok = self.store.set_failed(tool_call_id, &detail, Utc::now())?;
        log_transition(tool_call_id, ToolCallStatus::Failed, ok);
        Ok(ok)
    }

    /// 只能从 prepared / running 进入；不推断成功或失败
    pub fn mark_abandoned_on_resume(
        &self,
        tool_call_id: &str,
        detail: &str,
    ) -> Result<bool, LedgerError> {
        let detail = truncate_ref(detail, self.max_ref_chars);
        let ok = self.store.set_abandoned(tool_call_id, &detail, Utc::now())?;
        log_transition(tool_call_id, ToolCallStatus::AbandonedOnResume, ok);
        Ok(ok)
    }

    /// 任何状态都可标注，status 本身不变
    pub fn mark_replay_status(
        &self,
        tool_call_id: &str,
        replay_status: &str,
    ) -> Result<bool, LedgerError> {
        let ok = self
            .store
            .set_replay_status(tool_call_id, replay_status, Utc::now())?;
        debug!(tool_call_id, replay_status, updated = ok, "replay status recorded");
        Ok(ok)
    }

    pub fn record_receipt_pending(
        &self,
        tool_call_id: &str,
        response_ref: Option<&str>,
        external_correlation_id: Option<&str>,
    ) -> Result<(), LedgerError> {
        self.store.put_pending_receipt(&PendingReceipt {
            tool_call_id: tool_call_id.to_string(),
            response_ref: response_ref.map(|r| truncate_ref(r, self.max_ref_chars)),
            external_correlation_id: external_correlation_id.map(str::to_string),
            created_at: Utc::now(),
        })?;
        debug!(tool_call_id, "pending receipt staged");
        Ok(())
    }

    pub fn get_pending_receipt(
        &self,
        tool_call_id: &str,
    ) -> Result<Option<PendingReceipt>, LedgerError> {
        self.store.get_pending_receipt(tool_call_id)
    }

    /// 暂存回执写入主记录并删除暂存行；第二次调用返回 false
    pub fn promote_pending_receipt(&self, tool_call_id: &str) -> Result<bool, LedgerError> {
        let ok = self
            .store
            .promote_pending_receipt(tool_call_id, self.max_ref_chars, Utc::now())?;
        if ok {
            info!(tool_call_id, status = %ToolCallStatus::Succeeded, "pending receipt promoted");
        } else {
            debug!(tool_call_id, "no promotable pending receipt");
        }
        Ok(ok)
    }

    pub fn clear_pending_receipt(&self, tool_call_id: &str) -> Result<bool, LedgerError> {
        self.store.delete_pending_receipt(tool_call_id)
    }

    /// 只有 succeeded 的行才算凭据
    pub fn get_receipt_by_idempotency_key(
        &self,
        idempotency_key: &str,
    ) -> Result<Option<ToolReceipt>, LedgerError> {
        Ok(self
            .store
            .find_by_key(idempotency_key)?
            .and_then(|c| c.receipt()))
    }

    pub fn get_tool_call(&self, tool_call_id: &str) -> Result<Option<ToolCall>, LedgerError> {
        self.store.get(tool_call_id)
    }

    pub fn list_by_status(&self, status: ToolCallStatus) -> Result<Vec<ToolCall>, LedgerError> {
        self.store.list_by_status(status)
    }

    pub fn list_for_run(&self, run_id: &str) -> Result<Vec<ToolCall>, LedgerError> {
        self.store.list_for_run(run_id)
    }

    /// 进程恢复时调用一次：上一生命周期遗留的 running 行全部标为 abandoned_on_resume，
    /// 并给出每行的重放判定。账本自身不执行任何重做。
    pub fn resume_pass(&self, detail: &str) -> Result<ResumeReport, LedgerError> {
        let mut report = ResumeReport::default();
        for mut call in self.store.list_by_status(ToolCallStatus::Running)? {
            if !self.mark_abandoned_on_resume(&call.tool_call_id, detail)? {
                continue;
            }
            call.status = ToolCallStatus::AbandonedOnResume;
            let decision = plan_replay(&call);
            report.abandoned.push(ResumeItem {
                tool_call_id: call.tool_call_id,
                tool_name: call.tool_name,
                idempotency_key: call.idempotency_key,
                decision,
            });
        }
        info!(
            abandoned = report.abandoned.len(),
            needs_human = report.needs_human().count(),
            "resume pass finished"
        );
        Ok(report)
    }

    /// 删除 cutoff 之前结束的 succeeded / failed 记录
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, LedgerError> {
        let deleted = self.store.prune_before(cutoff)?;
        info!(deleted, cutoff = %cutoff, "pruned terminal tool calls");
        Ok(deleted)
    }
}

fn log_transition(tool_call_id: &str, status: ToolCallStatus, ok: bool) {
    if ok {
        info!(tool_call_id, status = %status, "tool call transition");
    } else {
        warn!(tool_call_id, status = %status, "transition rejected: missing row or illegal source state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::audit::MemoryAuditSink;
    use crate::policy::SideEffectClass;
    use serde_json::json;

    fn ledger_with_audit() -> (Ledger, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let ledger =
            Ledger::open_in_memory(LedgerOptions::default().with_audit(audit.clone())).unwrap();
        ledger.register_run("run-1").unwrap();
        ledger.register_step("run-1", "step-1").unwrap();
        (ledger, audit)
    }

    fn request(id: &str, tool: &str, args: serde_json::Value) -> PrepareRequest {
        PrepareRequest::new(id, "run-1", "step-1", tool, "generic", args)
    }

    fn prepared(outcome: PrepareOutcome) -> ToolCall {
        match outcome {
            PrepareOutcome::Prepared { record } => record,
            other => panic!("expected Prepared, got {other:?}"),
        }
    }

    #[test]
    fn test_prepare_inserts_prepared_row() {
        let (ledger, _) = ledger_with_audit();
        let record = prepared(
            ledger
                .prepare_tool_call(request("tc-1", "GMAIL_SEND_EMAIL", json!({"to": "a@x.com"})))
                .unwrap(),
        );
        assert_eq!(record.status, ToolCallStatus::Prepared);
        assert_eq!(record.attempt, 1);
        assert_eq!(record.side_effect_class, SideEffectClass::External);
        assert_eq!(record.replay_policy, ReplayPolicy::ReplayExact);
        assert!(record.side_effect_scope.starts_with("email:"));

        let stored = ledger.get_tool_call("tc-1").unwrap().unwrap();
        assert_eq!(stored, record);
    }

    #[test]
    fn test_dedup_returns_receipt_without_new_row() {
        let (ledger, _) = ledger_with_audit();
        let args = json!({"query": "x", "request_id": "r-1"});
        let first = ledger
            .prepare_tool_call(request("tc-1", "CREATE_ISSUE", args))
            .unwrap();
        ledger.mark_running("tc-1").unwrap();
        ledger.mark_succeeded("tc-1", Some("issue #7"), Some("ext-7")).unwrap();

        let second = ledger
            .prepare_tool_call(request(
                "tc-2",
                "CREATE_ISSUE",
                json!({"request_id": "r-2", "query": "x"}),
            ))
            .unwrap();
        assert_eq!(first.idempotency_key(), second.idempotency_key());
        let receipt = second.receipt().unwrap();
        assert_eq!(receipt.tool_call_id, "tc-1");
        assert_eq!(receipt.response_ref.as_deref(), Some("issue #7"));
        assert!(ledger.get_tool_call("tc-2").unwrap().is_none());
    }

    #[test]
    fn test_in_flight_when_key_not_succeeded() {
        let (ledger, _) = ledger_with_audit();
        ledger
            .prepare_tool_call(request("tc-1", "CREATE_ISSUE", json!({"a": 1})))
            .unwrap();
        let outcome = ledger
            .prepare_tool_call(request("tc-2", "CREATE_ISSUE", json!({"a": 1})))
            .unwrap();
        match outcome {
            PrepareOutcome::InFlight {
                existing_status, ..
            } => assert_eq!(existing_status, Some(ToolCallStatus::Prepared)),
            other => panic!("expected InFlight, got {other:?}"),
        }
    }

    #[test]
    fn test_reused_tool_call_id_conflicts() {
        let (ledger, _) = ledger_with_audit();
        ledger
            .prepare_tool_call(request("tc-1", "CREATE_ISSUE", json!({"a": 1})))
            .unwrap();
        let err = ledger
            .prepare_tool_call(request("tc-1", "CREATE_ISSUE", json!({"a": 2})))
            .unwrap_err();
        assert!(matches!(err, LedgerError::ToolCallIdConflict(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_repeated_tool_call_id_with_same_args() {
        let (ledger, _) = ledger_with_audit();
        let first = prepared(
            ledger
                .prepare_tool_call(request("tc-1", "CREATE_ISSUE", json!({"a": 1})))
                .unwrap(),
        );
        match ledger
            .prepare_tool_call(request("tc-1", "CREATE_ISSUE", json!({"a": 1})))
            .unwrap()
        {
            PrepareOutcome::InFlight {
                idempotency_key,
                existing_status,
            } => {
                assert_eq!(idempotency_key, first.idempotency_key);
                assert_eq!(existing_status, Some(ToolCallStatus::Prepared));
            }
            other => panic!("expected InFlight, got {other:?}"),
        }

        ledger.mark_running("tc-1").unwrap();
        ledger.mark_succeeded("tc-1", Some("issue #1"), None).unwrap();
        let again = ledger
            .prepare_tool_call(request("tc-1", "CREATE_ISSUE", json!({"a": 1})))
            .unwrap();
        assert_eq!(again.receipt().unwrap().tool_call_id, "tc-1");
        assert_eq!(ledger.list_for_run("run-1").unwrap().len(), 1);
    }

    #[test]
    fn test_forwarding_another_message_is_not_deduplicated() {
        let (ledger, _) = ledger_with_audit();
        ledger
            .prepare_tool_call(request(
                "tc-1",
                "GMAIL_FORWARD_MESSAGE",
                json!({"message_id": "m1", "recipient_email": "bob@x.com"}),
            ))
            .unwrap();
        ledger.mark_running("tc-1").unwrap();
        ledger.mark_succeeded("tc-1", Some("fwd"), None).unwrap();

        let second = ledger
            .prepare_tool_call(request(
                "tc-2",
                "GMAIL_FORWARD_MESSAGE",
                json!({"message_id": "m2", "recipient_email": "bob@x.com"}),
            ))
            .unwrap();
        assert!(second.is_prepared());
    }

    #[test]
    fn test_upload_status_queries_are_distinct() {
        let (ledger, _) = ledger_with_audit();
        ledger
            .prepare_tool_call(request("tc-1", "GET_UPLOAD_STATUS", json!({"upload_id": "u1"})))
            .unwrap();
        ledger.mark_running("tc-1").unwrap();
        ledger.mark_succeeded("tc-1", Some("done"), None).unwrap();

        let second = ledger
            .prepare_tool_call(request("tc-2", "GET_UPLOAD_STATUS", json!({"upload_id": "u2"})))
            .unwrap();
        assert!(second.is_prepared());
    }

    #[test]
    fn test_missing_step_is_integrity_error() {
        let (ledger, _) = ledger_with_audit();
        let err = ledger
            .prepare_tool_call(PrepareRequest::new(
                "tc-1",
                "run-1",
                "no-such-step",
                "CREATE_ISSUE",
                "generic",
                json!({}),
            ))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Integrity { .. }));

        let err = ledger.register_step("no-such-run", "s").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_attempt_counts_nonce_retries() {
        let (ledger, _) = ledger_with_audit();
        let args = json!({"path": "/tmp/a"});
        ledger
            .prepare_tool_call(request("tc-1", "DELETE_FILE", args.clone()))
            .unwrap();
        ledger.mark_failed("tc-1", "boom").unwrap();
        let retry = prepared(
            ledger
                .prepare_tool_call(request("tc-2", "DELETE_FILE", args).with_nonce("retry-1"))
                .unwrap(),
        );
        assert_eq!(retry.attempt, 2);
    }

    #[test]
    fn test_transitions_reject_illegal_sources() {
        let (ledger, _) = ledger_with_audit();
        ledger
            .prepare_tool_call(request("tc-1", "CREATE_ISSUE", json!({})))
            .unwrap();
        assert!(ledger.mark_running("tc-1").unwrap());
        assert!(!ledger.mark_running("tc-1").unwrap());
        assert!(ledger.mark_failed("tc-1", "upstream 500").unwrap());
        assert!(!ledger.mark_succeeded("tc-1", None, None).unwrap());
        assert!(!ledger.mark_abandoned_on_resume("tc-1", "resume").unwrap());
        assert!(ledger.mark_replay_status("tc-1", "needs-human").unwrap());

        let row = ledger.get_tool_call("tc-1").unwrap().unwrap();
        assert_eq!(row.status, ToolCallStatus::Failed);
        assert_eq!(row.error_detail.as_deref(), Some("upstream 500"));
        assert_eq!(row.replay_status.as_deref(), Some("needs-human"));
        assert!(!ledger.mark_running("missing").unwrap());
    }

    #[test]
    fn test_receipt_lookup_requires_success() {
        let (ledger, _) = ledger_with_audit();
        let outcome = ledger
            .prepare_tool_call(request("tc-1", "CREATE_ISSUE", json!({})))
            .unwrap();
        let key = outcome.idempotency_key().to_string();
        assert!(ledger.get_receipt_by_idempotency_key(&key).unwrap().is_none());
        ledger.mark_succeeded("tc-1", Some("ok"), None).unwrap();
        assert!(ledger.get_receipt_by_idempotency_key(&key).unwrap().is_some());
    }

    #[test]
    fn test_response_ref_truncated() {
        let audit = Arc::new(MemoryAuditSink::new());
        let options = LedgerOptions {
            max_ref_chars: 5,
            ..LedgerOptions::default().with_audit(audit)
        };
        let ledger = Ledger::open_in_memory(options).unwrap();
        ledger.register_run("run-1").unwrap();
        ledger.register_step("run-1", "step-1").unwrap();
        ledger
            .prepare_tool_call(request("tc-1", "CREATE_ISSUE", json!({})))
            .unwrap();
        ledger
            .mark_succeeded("tc-1", Some("0123456789"), None)
            .unwrap();
        let row = ledger.get_tool_call("tc-1").unwrap().unwrap();
        assert_eq!(row.response_ref.as_deref(), Some("01234..."));

        // 暂存回执同样截断
        ledger
            .prepare_tool_call(request("tc-2", "CREATE_ISSUE", json!({"b": 1})))
            .unwrap();
        ledger.mark_running("tc-2").unwrap();
        ledger
            .record_receipt_pending("tc-2", Some("abcdefghij"), Some("ext-2"))
            .unwrap();
        let pending = ledger.get_pending_receipt("tc-2").unwrap().unwrap();
        assert_eq!(pending.response_ref.as_deref(), Some("abcde..."));
        assert!(ledger.promote_pending_receipt("tc-2").unwrap());
        let row = ledger.get_tool_call("tc-2").unwrap().unwrap();
        assert_eq!(row.response_ref.as_deref(), Some("abcde..."));
    }

    #[test]
    fn test_unclassified_tool_audited_once() {
        let (ledger, audit) = ledger_with_audit();
        ledger
            .prepare_tool_call(request("tc-1", "FROBNICATE", json!({"n": 1})))
            .unwrap();
        ledger
            .prepare_tool_call(request("tc-2", "FROBNICATE", json!({"n": 2})))
            .unwrap();
        ledger
            .prepare_tool_call(request("tc-3", "LIST_ITEMS", json!({})))
            .unwrap();
        let events = audit.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].tool_name, "FROBNICATE");
        assert_eq!(events[0].policy_rule_id, "default.external");
    }

    #[test]
    fn test_replaced_policy_applies_to_next_prepare() {
        let (ledger, _) = ledger_with_audit();
        let before = prepared(
            ledger
                .prepare_tool_call(request("tc-1", "FROBNICATE", json!({"n": 1})))
                .unwrap(),
        );
        assert_eq!(before.side_effect_class, SideEffectClass::External);

        let mut section = crate::policy::PolicySection::default();
        section.rules.push(crate::policy::RuleEntry {
            namespace: "generic".into(),
            tool: "FROBNICATE".into(),
            side_effect: SideEffectClass::ReadOnly,
            replay_policy: None,
        });
        ledger
            .replace_policy(PolicyTable::new(&section, "mcp", "native", "spawn_subtask"))
            .unwrap();
        let after = prepared(
            ledger
                .prepare_tool_call(request("tc-2", "FROBNICATE", json!({"n": 2})))
                .unwrap(),
        );
        assert_eq!(after.side_effect_class, SideEffectClass::ReadOnly);
        assert_eq!(after.replay_policy, ReplayPolicy::ReplayIdempotent);
        assert!(after.policy_matched);
    }

    #[test]
    fn test_resume_pass_marks_running_rows() {
        let (ledger, _) = ledger_with_audit();
        ledger
            .prepare_tool_call(request("tc-1", "CREATE_ISSUE", json!({})))
            .unwrap();
        ledger
            .prepare_tool_call(request("tc-2", "LIST_ISSUES", json!({})))
            .unwrap();
        ledger
            .prepare_tool_call(request("tc-3", "CREATE_LABEL", json!({})))
            .unwrap();
        ledger.mark_running("tc-1").unwrap();
        ledger.mark_running("tc-2").unwrap();

        let report = ledger.resume_pass("process restarted").unwrap();
        assert_eq!(report.abandoned.len(), 2);
        assert_eq!(report.needs_human().count(), 1);
        assert_eq!(
            ledger.get_tool_call("tc-1").unwrap().unwrap().status,
            ToolCallStatus::AbandonedOnResume
        );
        assert_eq!(
            ledger.get_tool_call("tc-3").unwrap().unwrap().status,
            ToolCallStatus::Prepared
        );
    }
}
