//! 工具名解析器
//!
//! 识别的形态：
//! - `mcp__<server>__<tool>`：命名空间 `mcp`，工具名取最后一段
//! - 固定的 Shell 执行别名、固定的子任务派生别名：命名空间 `native`
//! - 其它：扁平工具名，命名空间 `generic`
//!
//! 模型偶尔把 JSON 参数以标签形式拼进工具名（如 `FOO<arg_key>x</arg_key><arg_value>1</arg_value>`），
//! 这类名字标记为 malformed：截掉第一个标签片段之后的内容得到基础工具名，
//! 若键、值标签都在且值可解析为 JSON，再恢复出一对参数。恢复结果只用于让调用方发起更正后的调用，
//! 不能直接执行。

use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

static TAG_FRAGMENT_RE: OnceLock<Regex> = OnceLock::new();
static ARG_KEY_RE: OnceLock<Regex> = OnceLock::new();
static ARG_VALUE_RE: OnceLock<Regex> = OnceLock::new();

fn tag_fragment_re() -> &'static Regex {
    TAG_FRAGMENT_RE.get_or_init(|| {
        Regex::new(r"</?[A-Za-z_][A-Za-z0-9_\-]*\s*/?>").expect("tag fragment regex")
    })
}

fn arg_key_re() -> &'static Regex {
    ARG_KEY_RE.get_or_init(|| Regex::new(r"(?s)<arg_key>(.*?)</arg_key>").expect("arg_key regex"))
}

fn arg_value_re() -> &'static Regex {
    ARG_VALUE_RE
        .get_or_init(|| Regex::new(r"(?s)<arg_value>(.*?)</arg_value>").expect("arg_value regex"))
}

/// [identity] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// 多段名前缀（`mcp__server__tool` 中的 `mcp`）
    pub mcp_prefix: String,
    pub segment_separator: String,
    pub mcp_namespace: String,
    pub native_namespace: String,
    pub default_namespace: String,
    /// 固定的 Shell 执行别名
    pub shell_alias: String,
    /// 固定的子任务派生别名
    pub spawn_alias: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            mcp_prefix: "mcp".to_string(),
            segment_separator: "__".to_string(),
            mcp_namespace: "mcp".to_string(),
            native_namespace: "native".to_string(),
            default_namespace: "generic".to_string(),
            shell_alias: "run_shell_command".to_string(),
            spawn_alias: "spawn_subtask".to_string(),
        }
    }
}

/// 从畸形工具名里恢复出的一对参数（不可信）
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveredArg {
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedTool {
    pub raw_tool_name: String,
    pub tool_name: String,
    pub tool_namespace: String,
    /// 仅 MCP 形态有值
    pub server: Option<String>,
    /// 原始名含标签片段
    pub malformed: bool,
    /// 除剥掉命名空间前缀外，原始名还被改写过（如首尾空白）
    pub name_rewritten: bool,
    pub recovered_arg: Option<RecoveredArg>,
}

impl ResolvedTool {
    /// 解析结果与原始名的差异超出了"剥掉命名空间前缀"：应拒绝并要求模型重新组织调用，不能交给账本
    pub fn needs_reformulation(&self) -> bool {
        self.malformed || self.name_rewritten || self.tool_name.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ToolNameResolver {
    config: ResolverConfig,
}

impl ToolNameResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn resolve(&self, raw: &str) -> ResolvedTool {
        let Some(tag) = tag_fragment_re().find(raw) else {
            return self.parse_clean(raw);
        };

        let base = raw[..tag.start()]
            .trim()
            .trim_end_matches(['"', '\'', ':', '{', '('])
            .trim();
        let mut resolved = self.parse_clean(base);
        resolved.raw_tool_name = raw.to_string();
        resolved.malformed = true;
        resolved.name_rewritten = true;
        resolved.recovered_arg = recover_arg(raw);
        tracing::warn!(
            raw_tool_name = %raw,
            base_tool_name = %resolved.tool_name,
            recovered = resolved.recovered_arg.is_some(),
            "malformed tool name"
        );
        resolved
    }

    fn parse_clean(&self, raw: &str) -> ResolvedTool {
        let name = raw.trim();
        let cfg = &self.config;
        let prefix = format!("{}{}", cfg.mcp_prefix, cfg.segment_separator);

        if name.starts_with(&prefix) {
            let segments: Vec<&str> = name.split(cfg.segment_separator.as_str()).collect();
            if segments.len() >= 3 && segments.iter().all(|s| !s.is_empty()) {
                let tool = segments[segments.len() - 1];
                let server = segments[1..segments.len() - 1].join(&cfg.segment_separator);
                return ResolvedTool {
                    raw_tool_name: raw.to_string(),
                    tool_name: tool.to_string(),
                    tool_namespace: cfg.mcp_namespace.clone(),
                    server: Some(server),
                    malformed: false,
                    name_rewritten: name != raw,
                    recovered_arg: None,
                };
            }
        }

        let namespace = if name == cfg.shell_alias || name == cfg.spawn_alias {
            cfg.native_namespace.clone()
        } else {
            cfg.default_namespace.clone()
        };
        ResolvedTool {
            raw_tool_name: raw.to_string(),
            tool_name: name.to_string(),
            tool_namespace: namespace,
            server: None,
            malformed: false,
            name_rewritten: name != raw,
            recovered_arg: None,
        }
    }
}

fn recover_arg(raw: &str) -> Option<RecoveredArg> {
    let key = arg_key_re().captures(raw)?.get(1)?.as_str().trim();
    let value = arg_value_re().captures(raw)?.get(1)?.as_str().trim();
    if key.is_empty() {
        return None;
    }
    let value: Value = serde_json::from_str(value).ok()?;
    Some(RecoveredArg {
        key: key.to_string(),
        value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resolver() -> ToolNameResolver {
        ToolNameResolver::default()
    }

    #[test]
    fn test_clean_name_passes_through() {
        let r = resolver().resolve("GMAIL_SEND_EMAIL");
        assert_eq!(r.tool_name, "GMAIL_SEND_EMAIL");
        assert_eq!(r.tool_namespace, "generic");
        assert!(!r.malformed);
        assert!(!r.needs_reformulation());
        assert!(r.recovered_arg.is_none());
    }

    #[test]
    fn test_mcp_multi_part_name() {
        let r = resolver().resolve("mcp__github__create_issue");
        assert_eq!(r.tool_namespace, "mcp");
        assert_eq!(r.tool_name, "create_issue");
        assert_eq!(r.server.as_deref(), Some("github"));
        assert!(!r.needs_reformulation());
    }

    #[test]
    fn test_mcp_prefix_with_missing_segments_is_flat() {
        let r = resolver().resolve("mcp__create_issue");
        assert_eq!(r.tool_namespace, "generic");
        assert_eq!(r.tool_name, "mcp__create_issue");
    }

    #[test]
    fn test_fixed_aliases_are_native() {
        let r = resolver().resolve("spawn_subtask");
        assert_eq!(r.tool_namespace, "native");
        let r = resolver().resolve("run_shell_command");
        assert_eq!(r.tool_namespace, "native");
        assert_eq!(r.tool_name, "run_shell_command");
    }

    #[test]
    fn test_malformed_name_recovery() {
        let r = resolver().resolve("FOO<arg_key>x</arg_key><arg_value>1</arg_value>");
        assert!(r.malformed);
        assert!(r.needs_reformulation());
        assert_eq!(r.tool_name, "FOO");
        assert_eq!(r.tool_namespace, "generic");
        assert_eq!(
            r.recovered_arg,
            Some(RecoveredArg {
                key: "x".to_string(),
                value: json!(1)
            })
        );
    }

    #[test]
    fn test_malformed_value_not_json_is_not_recovered() {
        let r = resolver().resolve("FOO<arg_key>x</arg_key><arg_value>not json</arg_value>");
        assert!(r.malformed);
        assert_eq!(r.tool_name, "FOO");
        assert!(r.recovered_arg.is_none());
    }

    #[test]
    fn test_malformed_without_value_tag() {
        let r = resolver().resolve("send_email<tool_call>{\"to\": \"a\"}");
        assert!(r.malformed);
        assert_eq!(r.tool_name, "send_email");
        assert!(r.recovered_arg.is_none());
    }

    #[test]
    fn test_malformed_mcp_name_keeps_namespace() {
        let r = resolver()
            .resolve("mcp__github__create_issue<arg_key>title</arg_key><arg_value>\"bug\"</arg_value>");
        assert!(r.malformed);
        assert_eq!(r.tool_namespace, "mcp");
        assert_eq!(r.tool_name, "create_issue");
        assert_eq!(r.recovered_arg.unwrap().value, json!("bug"));
    }

    #[test]
    fn test_surrounding_whitespace_needs_reformulation() {
        let r = resolver().resolve(" GMAIL_SEND_EMAIL ");
        assert_eq!(r.tool_name, "GMAIL_SEND_EMAIL");
        assert!(!r.malformed);
        assert!(r.needs_reformulation());
    }
}
