//! 未分类工具审计
//!
//! 某个 (namespace, tool) 第一次落到保守默认分类时写一条记录，供人工补充策略表。
//! 写入失败只记日志，不影响 prepare。

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::policy::{ReplayPolicy, SideEffectClass};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEvent {
    pub event: &'static str,
    pub tool_namespace: String,
    pub tool_name: String,
    pub raw_tool_name: String,
    pub policy_rule_id: String,
    pub side_effect_class: SideEffectClass,
    pub replay_policy: ReplayPolicy,
    pub tool_call_id: String,
    pub run_id: String,
    pub observed_at: DateTime<Utc>,
}

/// 只追加的审计出口
pub trait AuditSink: Send + Sync {
    fn record(&self, event: &AuditEvent) -> std::io::Result<()>;
}

/// JSONL 文件：每个未见过的组合一行，父目录首次写入时创建
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditSink for JsonlAuditSink {
    fn record(&self, event: &AuditEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        line.push('\n');
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(line.as_bytes()))
    }
}

/// 内存实现，测试用
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) -> std::io::Result<()> {
        self.events
            .lock()
            .map_err(|_| std::io::Error::other("audit sink lock poisoned"))?
            .push(event.clone());
        Ok(())
    }
}

/// 只写日志流
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: &AuditEvent) -> std::io::Result<()> {
        tracing::warn!(
            tool_namespace = %event.tool_namespace,
            tool_name = %event.tool_name,
            policy_rule_id = %event.policy_rule_id,
            side_effect_class = %event.side_effect_class,
            "tool has no matching classification rule"
        );
        Ok(())
    }
}
