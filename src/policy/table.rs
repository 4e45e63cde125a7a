//! 策略表：启动时从配置构建一次，之后只读
//!
//! 进程生命周期内可以用新配置重建一张表替换旧表（Arc 交换），分类函数本身不缓存任何结果。

use std::collections::{HashMap, HashSet};

use serde::Deserialize;

use crate::policy::{ReplayPolicy, SideEffectClass};

/// 显式规则：(namespace, tool) → 副作用类别，可选覆盖重放策略
#[derive(Debug, Clone, Deserialize)]
pub struct RuleEntry {
    pub namespace: String,
    pub tool: String,
    pub side_effect: SideEffectClass,
    #[serde(default)]
    pub replay_policy: Option<ReplayPolicy>,
}

/// [policy] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicySection {
    /// MCP 命名空间下已知有副作用的工具名
    pub mcp_side_effecting: Vec<String>,
    /// MCP 命名空间下已知只读的工具名
    pub mcp_read_only: Vec<String>,
    /// 非 MCP 工具名中出现即视为 external 的动词
    pub mutating_keywords: Vec<String>,
    /// 非 MCP 工具名中出现即视为 read_only 的动词（优先级低于 mutating）
    pub read_keywords: Vec<String>,
    pub rules: Vec<RuleEntry>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            mcp_side_effecting: words(&[
                "create_issue",
                "update_issue",
                "add_issue_comment",
                "create_pull_request",
                "merge_pull_request",
                "create_or_update_file",
                "push_files",
                "create_branch",
                "write_file",
                "edit_file",
                "move_file",
                "create_directory",
                "delete_file",
                "send_message",
                "post_message",
                "browser_click",
                "browser_type",
                "browser_navigate",
            ]),
            mcp_read_only: words(&[
                "read_file",
                "read_multiple_files",
                "list_directory",
                "directory_tree",
                "search_files",
                "get_file_info",
                "list_allowed_directories",
                "get_file_contents",
                "get_issue",
                "list_issues",
                "search_code",
                "search_issues",
                "search_repositories",
                "browser_snapshot",
            ]),
            mutating_keywords: words(&[
                "SEND", "CREATE", "UPDATE", "DELETE", "REMOVE", "INSERT", "UPSERT", "POST",
                "PUT", "PATCH", "UPLOAD", "WRITE", "MODIFY", "ADD", "SET", "REPLY", "FORWARD",
                "MOVE", "ARCHIVE", "INVITE", "SHARE", "PUBLISH", "EXECUTE", "RUN", "TRIGGER",
                "CANCEL", "MERGE", "PUSH", "COMMIT", "TRANSFER", "PAY", "BOOK", "SCHEDULE",
            ]),
            read_keywords: words(&[
                "GET", "LIST", "SEARCH", "FETCH", "READ", "FIND", "QUERY", "DESCRIBE", "VIEW",
                "LOOKUP", "RETRIEVE", "COUNT", "CHECK", "PREVIEW", "DOWNLOAD",
            ]),
            rules: vec![
                rule("generic", "remember", SideEffectClass::Memory),
                rule("generic", "memory_write", SideEffectClass::Memory),
                rule("generic", "write_memory", SideEffectClass::Memory),
                rule("generic", "save_memory", SideEffectClass::Memory),
                rule("generic", "update_memory", SideEffectClass::Memory),
                rule("generic", "memory_search", SideEffectClass::ReadOnly),
                rule("generic", "recall", SideEffectClass::ReadOnly),
                rule("native", "run_shell_command", SideEffectClass::Local),
            ],
        }
    }
}

fn rule(namespace: &str, tool: &str, side_effect: SideEffectClass) -> RuleEntry {
    RuleEntry {
        namespace: namespace.to_string(),
        tool: tool.to_string(),
        side_effect,
        replay_policy: None,
    }
}

/// 规则命中后的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyRule {
    pub side_effect: SideEffectClass,
    pub replay_policy: Option<ReplayPolicy>,
}

/// 不可变策略表；工具名与关键词均按大写比较，命名空间按小写比较
#[derive(Debug, Clone)]
pub struct PolicyTable {
    pub(crate) mcp_namespace: String,
    pub(crate) spawn_namespace: String,
    pub(crate) spawn_tool: String,
    pub(crate) mcp_side_effecting: HashSet<String>,
    pub(crate) mcp_read_only: HashSet<String>,
    pub(crate) mutating_keywords: Vec<String>,
    pub(crate) read_keywords: Vec<String>,
    pub(crate) rules: HashMap<(String, String), PolicyRule>,
}

impl PolicyTable {
    pub fn new(
        section: &PolicySection,
        mcp_namespace: &str,
        spawn_namespace: &str,
        spawn_tool: &str,
    ) -> Self {
        let upper = |list: &[String]| -> HashSet<String> {
            list.iter().map(|s| s.trim().to_uppercase()).collect()
        };
        let ordered = |list: &[String]| -> Vec<String> {
            list.iter().map(|s| s.trim().to_uppercase()).collect()
        };
        let rules = section
            .rules
            .iter()
            .map(|r| {
                (
                    (r.namespace.to_lowercase(), r.tool.to_uppercase()),
                    PolicyRule {
                        side_effect: r.side_effect,
                        replay_policy: r.replay_policy,
                    },
                )
            })
            .collect();
        Self {
            mcp_namespace: mcp_namespace.to_lowercase(),
            spawn_namespace: spawn_namespace.to_lowercase(),
            spawn_tool: spawn_tool.to_uppercase(),
            mcp_side_effecting: upper(&section.mcp_side_effecting),
            mcp_read_only: upper(&section.mcp_read_only),
            mutating_keywords: ordered(&section.mutating_keywords),
            read_keywords: ordered(&section.read_keywords),
            rules,
        }
    }

    pub(crate) fn rule_for(&self, tool_name: &str, namespace: &str) -> Option<PolicyRule> {
        self.rules
            .get(&(namespace.to_lowercase(), tool_name.to_uppercase()))
            .copied()
    }

    pub(crate) fn is_spawn(&self, tool_name: &str, namespace: &str) -> bool {
        namespace.eq_ignore_ascii_case(&self.spawn_namespace)
            && tool_name.eq_ignore_ascii_case(&self.spawn_tool)
    }
}

impl Default for PolicyTable {
    fn default() -> Self {
        let identity = crate::identity::ResolverConfig::default();
        PolicyTable::new(
            &PolicySection::default(),
            &identity.mcp_namespace,
            &identity.native_namespace,
            &identity.spawn_alias,
        )
    }
}
