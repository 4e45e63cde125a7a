use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// 重复执行一次工具调用有多"危险"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectClass {
    External,
    Memory,
    Local,
    ReadOnly,
}

impl SideEffectClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideEffectClass::External => "external",
            SideEffectClass::Memory => "memory",
            SideEffectClass::Local => "local",
            SideEffectClass::ReadOnly => "read_only",
        }
    }
}

impl FromStr for SideEffectClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "external" => Ok(SideEffectClass::External),
            "memory" => Ok(SideEffectClass::Memory),
            "local" => Ok(SideEffectClass::Local),
            "read_only" => Ok(SideEffectClass::ReadOnly),
            other => Err(format!("unknown side effect class: {other}")),
        }
    }
}

impl fmt::Display for SideEffectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 崩溃后一次已准备的调用可以如何重做
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReplayPolicy {
    /// 必须依赖幂等键保护，不能直接重做
    ReplayExact,
    /// 无外部后果，重做无害
    ReplayIdempotent,
    /// 每次都是新的、不可重复的委派（子任务）
    Relaunch,
}

impl ReplayPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplayPolicy::ReplayExact => "REPLAY_EXACT",
            ReplayPolicy::ReplayIdempotent => "REPLAY_IDEMPOTENT",
            ReplayPolicy::Relaunch => "RELAUNCH",
        }
    }
}

impl FromStr for ReplayPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REPLAY_EXACT" => Ok(ReplayPolicy::ReplayExact),
            "REPLAY_IDEMPOTENT" => Ok(ReplayPolicy::ReplayIdempotent),
            "RELAUNCH" => Ok(ReplayPolicy::Relaunch),
            other => Err(format!("unknown replay policy: {other}")),
        }
    }
}

impl fmt::Display for ReplayPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ToSql for SideEffectClass {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SideEffectClass {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for ReplayPolicy {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for ReplayPolicy {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}
