//! SQLite 存储
//!
//! 每个 Ledger 实例持有一条连接，Mutex 只用于保护连接句柄本身；
//! 并发正确性完全依赖 `tool_calls.idempotency_key` 的唯一约束，多个进程 / 连接可共用同一个库文件。

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::core::error::{InsertError, LedgerError};
use crate::ledger::types::{PendingReceipt, ToolCall, ToolCallStatus};

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS steps (
        step_id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS tool_calls (
        tool_call_id TEXT PRIMARY KEY,
        run_id TEXT NOT NULL REFERENCES runs(run_id),
        step_id TEXT NOT NULL REFERENCES steps(step_id),
        raw_tool_name TEXT NOT NULL,
        tool_name TEXT NOT NULL,
        tool_namespace TEXT NOT NULL,
        side_effect_class TEXT NOT NULL,
        replay_policy TEXT NOT NULL,
        policy_matched INTEGER NOT NULL,
        policy_rule_id TEXT NOT NULL,
        normalized_args_hash TEXT NOT NULL,
        side_effect_scope TEXT NOT NULL,
        idempotency_key TEXT NOT NULL UNIQUE,
        status TEXT NOT NULL,
        attempt INTEGER NOT NULL DEFAULT 1,
        request_ref TEXT,
        response_ref TEXT,
        external_correlation_id TEXT,
        error_detail TEXT,
        replay_status TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_tool_calls_status ON tool_calls(status);
    CREATE INDEX IF NOT EXISTS idx_tool_calls_run_step ON tool_calls(run_id, step_id);

    CREATE TABLE IF NOT EXISTS tool_receipts (
        tool_call_id TEXT PRIMARY KEY,
        response_ref TEXT,
        external_correlation_id TEXT,
        created_at TEXT NOT NULL
    );
";

const TOOL_CALL_COLUMNS: &str = "tool_call_id, run_id, step_id, raw_tool_name, tool_name, \
    tool_namespace, side_effect_class, replay_policy, policy_matched, policy_rule_id, \
    normalized_args_hash, side_effect_scope, idempotency_key, status, attempt, request_ref, \
    response_ref, external_correlation_id, error_detail, replay_status, created_at, updated_at";

/// succeeded 可以从 prepared / running / abandoned_on_resume 进入（后者表示恢复后才拿到确认）
const SET_SUCCEEDED_SQL: &str = "UPDATE tool_calls
     SET status = 'succeeded', response_ref = ?2, external_correlation_id = ?3, updated_at = ?4
     WHERE tool_call_id = ?1 AND status IN ('prepared', 'running', 'abandoned_on_resume')";

pub struct LedgerStore {
    conn: Mutex<Connection>,
}

impl LedgerStore {
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::LockPoisoned)
    }

    pub fn insert_run(&self, run_id: &str, now: DateTime<Utc>) -> Result<(), LedgerError> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO runs (run_id, created_at) VALUES (?1, ?2)",
            params![run_id, now],
        )?;
        Ok(())
    }

    pub fn insert_step(
        &self,
        run_id: &str,
        step_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), InsertError> {
        let conn = self.conn.lock().map_err(|_| InsertError::LockPoisoned)?;
        conn.execute(
            "INSERT OR IGNORE INTO steps (step_id, run_id, created_at) VALUES (?1, ?2, ?3)",
            params![step_id, run_id, now],
        )?;
        Ok(())
    }

    pub fn insert_tool_call(&self, call: &ToolCall) -> Result<(), InsertError> {
        let conn = self.conn.lock().map_err(|_| InsertError::LockPoisoned)?;
        conn.execute(
            &format!(
                "INSERT INTO tool_calls ({TOOL_CALL_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20, ?21, ?22)"
            ),
            params![
                call.tool_call_id,
                call.run_id,
                call.step_id,
                call.raw_tool_name,
                call.tool_name,
                call.tool_namespace,
                call.side_effect_class,
                call.replay_policy,
                call.policy_matched,
                call.policy_rule_id,
                call.normalized_args_hash,
                call.side_effect_scope,
                call.idempotency_key,
                call.status,
                call.attempt,
                call.request_ref,
                call.response_ref,
                call.external_correlation_id,
                call.error_detail,
                call.replay_status,
                call.created_at,
                call.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, tool_call_id: &str) -> Result<Option<ToolCall>, LedgerError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                &format!("SELECT {TOOL_CALL_COLUMNS} FROM tool_calls WHERE tool_call_id = ?1"),
                params![tool_call_id],
                row_to_tool_call,
            )
            .optional()?;
        Ok(found)
    }

    pub fn find_by_key(&self, idempotency_key: &str) -> Result<Option<ToolCall>, LedgerError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                &format!("SELECT {TOOL_CALL_COLUMNS} FROM tool_calls WHERE idempotency_key = ?1"),
                params![idempotency_key],
                row_to_tool_call,
            )
            .optional()?;
        Ok(found)
    }

    /// 同一 (run, step, 命名空间, 工具, 参数哈希) 已有的尝试次数
    pub fn count_attempts(
        &self,
        run_id: &str,
        step_id: &str,
        namespace: &str,
        tool_name: &str,
        args_hash: &str,
    ) -> Result<u32, LedgerError> {
        let conn = self.conn()?;
        let count: u32 = conn.query_row(
            "SELECT COUNT(*) FROM tool_calls
             WHERE run_id = ?1 AND step_id = ?2 AND tool_namespace = ?3
               AND tool_name = ?4 AND normalized_args_hash = ?5",
            params![run_id, step_id, namespace, tool_name, args_hash],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn list_by_status(&self, status: ToolCallStatus) -> Result<Vec<ToolCall>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOOL_CALL_COLUMNS} FROM tool_calls WHERE status = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![status], row_to_tool_call)?;
        let calls = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(calls)
    }

    pub fn list_for_run(&self, run_id: &str) -> Result<Vec<ToolCall>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOOL_CALL_COLUMNS} FROM tool_calls WHERE run_id = ?1 ORDER BY created_at ASC"
        ))?;
        let rows = stmt.query_map(params![run_id], row_to_tool_call)?;
        let calls = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(calls)
    }

    /// 分类未命中规则、已经写过审计记录的 (namespace, tool) 组合
    pub fn unmatched_pairs(&self) -> Result<Vec<(String, String)>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT tool_namespace, tool_name FROM tool_calls WHERE policy_matched = 0",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let pairs = rows.collect::<Result<Vec<_>, _>>()?;
        Ok(pairs)
    }

    pub fn set_running(&self, tool_call_id: &str, now: DateTime<Utc>) -> Result<bool, LedgerError> {
        let updated = self.conn()?.execute(
            "UPDATE tool_calls SET status = 'running', updated_at = ?2
             WHERE tool_call_id = ?1 AND status = 'prepared'",
            params![tool_call_id, now],
        )?;
        Ok(updated == 1)
    }

    pub fn set_succeeded(
        &self,
        tool_call_id: &str,
        response_ref: Option<&str>,
        correlation_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let updated = self.conn()?.execute(
            SET_SUCCEEDED_SQL,
            params![tool_call_id, response_ref, correlation_id, now],
        )?;
        Ok(updated == 1)
    }

    pub fn set_failed(
        &self,
        tool_call_id: &str,
        error_detail: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let updated = self.conn()?.execute(
            "UPDATE tool_calls SET status = 'failed', error_detail = ?2, updated_at = ?3
             WHERE tool_call_id = ?1 AND status IN ('prepared', 'running', 'abandoned_on_resume')",
            params![tool_call_id, error_detail, now],
        )?;
        Ok(updated == 1)
    }

    pub fn set_abandoned(
        &self,
        tool_call_id: &str,
        detail: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let updated = self.conn()?.execute(
            "UPDATE tool_calls SET status = 'abandoned_on_resume', error_detail = ?2, updated_at = ?3
             WHERE tool_call_id = ?1 AND status IN ('prepared', 'running')",
            params![tool_call_id, detail, now],
        )?;
        Ok(updated == 1)
    }

    pub fn set_replay_status(
        &self,
        tool_call_id: &str,
        replay_status: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let updated = self.conn()?.execute(
            "UPDATE tool_calls SET replay_status = ?2, updated_at = ?3 WHERE tool_call_id = ?1",
            params![tool_call_id, replay_status, now],
        )?;
        Ok(updated == 1)
    }

    /// 同一 tool_call_id 重复暂存时以最后一次观察为准
    pub fn put_pending_receipt(&self, receipt: &PendingReceipt) -> Result<(), LedgerError> {
        self.conn()?.execute(
            "INSERT OR REPLACE INTO tool_receipts
             (tool_call_id, response_ref, external_correlation_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                receipt.tool_call_id,
                receipt.response_ref,
                receipt.external_correlation_id,
                receipt.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_pending_receipt(
        &self,
        tool_call_id: &str,
    ) -> Result<Option<PendingReceipt>, LedgerError> {
        let conn = self.conn()?;
        let found = conn
            .query_row(
                "SELECT tool_call_id, response_ref, external_correlation_id, created_at
                 FROM tool_receipts WHERE tool_call_id = ?1",
                params![tool_call_id],
                row_to_pending_receipt,
            )
            .optional()?;
        Ok(found)
    }

    pub fn delete_pending_receipt(&self, tool_call_id: &str) -> Result<bool, LedgerError> {
        let deleted = self.conn()?.execute(
            "DELETE FROM tool_receipts WHERE tool_call_id = ?1",
            params![tool_call_id],
        )?;
        Ok(deleted == 1)
    }

    /// 在一个写事务里：读暂存回执 → 标记 succeeded → 删除暂存行。
    /// 没有暂存回执或主记录无法进入 succeeded 时返回 false，且不做任何修改。
    pub fn promote_pending_receipt(
        &self,
        tool_call_id: &str,
        max_ref_chars: usize,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let pending = tx
            .query_row(
                "SELECT tool_call_id, response_ref, external_correlation_id, created_at
                 FROM tool_receipts WHERE tool_call_id = ?1",
                params![tool_call_id],
                row_to_pending_receipt,
            )
            .optional()?;
        let Some(pending) = pending else {
            return Ok(false);
        };

        let response_ref = pending
            .response_ref
            .as_deref()
            .map(|r| super::truncate_ref(r, max_ref_chars));
        let updated = tx.execute(
            SET_SUCCEEDED_SQL,
            params![
                tool_call_id,
                response_ref,
                pending.external_correlation_id,
                now
            ],
        )?;
        if updated != 1 {
            // tx 在 drop 时回滚
            return Ok(false);
        }
        tx.execute(
            "DELETE FROM tool_receipts WHERE tool_call_id = ?1",
            params![tool_call_id],
        )?;
        tx.commit()?;
        Ok(true)
    }

    /// 删除早于 cutoff 的终态记录及其暂存回执，返回删除的 tool_calls 行数
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "DELETE FROM tool_receipts WHERE tool_call_id IN (
                 SELECT tool_call_id FROM tool_calls
                 WHERE status IN ('succeeded', 'failed') AND updated_at < ?1)",
            params![cutoff],
        )?;
        let deleted = tx.execute(
            "DELETE FROM tool_calls WHERE status IN ('succeeded', 'failed') AND updated_at < ?1",
            params![cutoff],
        )?;
        tx.commit()?;
        Ok(deleted)
    }
}

fn row_to_tool_call(row: &Row<'_>) -> rusqlite::Result<ToolCall> {
    Ok(ToolCall {
        tool_call_id: row.get(0)?,
        run_id: row.get(1)?,
        step_id: row.get(2)?,
        raw_tool_name: row.get(3)?,
        tool_name: row.get(4)?,
        tool_namespace: row.get(5)?,
        side_effect_class: row.get(6)?,
        replay_policy: row.get(7)?,
        policy_matched: row.get(8)?,
        policy_rule_id: row.get(9)?,
        normalized_args_hash: row.get(10)?,
        side_effect_scope: row.get(11)?,
        idempotency_key: row.get(12)?,
        status: row.get(13)?,
        attempt: row.get(14)?,
        request_ref: row.get(15)?,
        response_ref: row.get(16)?,
        external_correlation_id: row.get(17)?,
        error_detail: row.get(18)?,
        replay_status: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

fn row_to_pending_receipt(row: &Row<'_>) -> rusqlite::Result<PendingReceipt> {
    Ok(PendingReceipt {
        tool_call_id: row.get(0)?,
        response_ref: row.get(1)?,
        external_correlation_id: row.get(2)?,
        created_at: row.get(3)?,
    })
}
