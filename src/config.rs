//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE_LEDGER__*` 覆盖（双下划线表示嵌套，如 `BEE_LEDGER__LEDGER__MAX_REF_CHARS=2000`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::identity::ResolverConfig;
use crate::normalize::SanitizeConfig;
use crate::policy::PolicySection;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub identity: ResolverConfig,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub normalize: SanitizeConfig,
}

/// [ledger] 段：库文件、审计文件、引用截断与锁等待
#[derive(Debug, Clone, Deserialize)]
pub struct LedgerSection {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// 未分类工具的 JSONL 审计文件
    #[serde(default = "default_audit_log_path")]
    pub audit_log_path: PathBuf,
    #[serde(default = "default_max_ref_chars")]
    pub max_ref_chars: usize,
    /// 其它连接持有写锁时的等待上限（毫秒）
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            audit_log_path: default_audit_log_path(),
            max_ref_chars: default_max_ref_chars(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("workspace/.ledger/tool_calls.db")
}

fn default_audit_log_path() -> PathBuf {
    PathBuf::from("workspace/.ledger/unclassified_tools.jsonl")
}

fn default_max_ref_chars() -> usize {
    4000
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// 从 config 目录加载配置，环境变量 BEE_LEDGER__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE_LEDGER__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE_LEDGER")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置；新策略表需由调用方通过 `Ledger::replace_policy` 换入
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.ledger.max_ref_chars, 4000);
        assert_eq!(cfg.identity.spawn_alias, "spawn_subtask");
        assert!(cfg.normalize.volatile_fields.contains(&"request_id".to_string()));
    }

    #[test]
    fn test_explicit_file_overrides() {
        let mut file = Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[ledger]
max_ref_chars = 128

[[policy.rules]]
namespace = "generic"
tool = "ARCHIVE_THREAD"
side_effect = "external"
replay_policy = "REPLAY_IDEMPOTENT"
"#
        )
        .unwrap();

        let cfg = load_config(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(cfg.ledger.max_ref_chars, 128);
        assert_eq!(cfg.ledger.busy_timeout_ms, 5000);
        assert!(cfg.policy.rules.iter().any(|r| r.tool == "ARCHIVE_THREAD"));
    }
}
