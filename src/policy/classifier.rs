//! 分类器：对 (tool_name, namespace) 的全函数
//!
//! 每次 prepare 都重新查询，不按 tool_call_id 缓存。查不到时给出保守默认值：
//! MCP 工具默认 local，其它工具默认 external；这两种默认都记 `policy_matched = false`。

use crate::policy::{PolicyTable, ReplayPolicy, SideEffectClass};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub side_effect: SideEffectClass,
    pub replay_policy: ReplayPolicy,
    pub policy_matched: bool,
    pub policy_rule_id: String,
}

impl PolicyTable {
    pub fn classify(&self, tool_name: &str, namespace: &str) -> Classification {
        let (side_effect, policy_matched, policy_rule_id, rule_replay) =
            self.side_effect_decision(tool_name, namespace);
        let replay_policy = if self.is_spawn(tool_name, namespace) {
            ReplayPolicy::Relaunch
        } else if let Some(policy) = rule_replay {
            policy
        } else {
            derive_replay_policy(side_effect)
        };
        Classification {
            side_effect,
            replay_policy,
            policy_matched,
            policy_rule_id,
        }
    }

    pub fn classify_side_effect(&self, tool_name: &str, namespace: &str) -> SideEffectClass {
        self.side_effect_decision(tool_name, namespace).0
    }

    pub fn classify_replay_policy(&self, tool_name: &str, namespace: &str) -> ReplayPolicy {
        self.classify(tool_name, namespace).replay_policy
    }

    fn side_effect_decision(
        &self,
        tool_name: &str,
        namespace: &str,
    ) -> (SideEffectClass, bool, String, Option<ReplayPolicy>) {
        if let Some(rule) = self.rule_for(tool_name, namespace) {
            let id = format!("rule:{}/{}", namespace.to_lowercase(), tool_name.to_lowercase());
            return (rule.side_effect, true, id, rule.replay_policy);
        }
        if self.is_spawn(tool_name, namespace) {
            return (SideEffectClass::External, true, "native.spawn".into(), None);
        }

        if namespace.eq_ignore_ascii_case(&self.mcp_namespace) {
            let upper = tool_name.trim().to_uppercase();
            if self.mcp_side_effecting.contains(&upper) {
                return (SideEffectClass::External, true, "mcp.side_effecting".into(), None);
            }
            if self.mcp_read_only.contains(&upper) {
                return (SideEffectClass::ReadOnly, true, "mcp.read_only".into(), None);
            }
            return (SideEffectClass::Local, false, "mcp.default_local".into(), None);
        }

        let tokens = name_tokens(tool_name);
        if let Some(kw) = first_keyword(&tokens, &self.mutating_keywords) {
            return (SideEffectClass::External, true, format!("keyword.mutating:{kw}"), None);
        }
        if let Some(kw) = first_keyword(&tokens, &self.read_keywords) {
            return (SideEffectClass::ReadOnly, true, format!("keyword.read:{kw}"), None);
        }
        (SideEffectClass::External, false, "default.external".into(), None)
    }
}

/// 工具名切词：按非字母数字字符与驼峰边界切分，统一大写。
/// `getUserThenSendEmail` → GET USER THEN SEND EMAIL；`SENDGRID` 这类连写大写词不拆。
pub(crate) fn name_tokens(tool_name: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in tool_name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let chars: Vec<char> = word.chars().collect();
        let mut start = 0;
        for i in 1..chars.len() {
            let (prev, cur) = (chars[i - 1], chars[i]);
            let next_lower = chars.get(i + 1).is_some_and(|c| c.is_ascii_lowercase());
            // fooBar、s3Upload 与 HTTPRequest 中的 R
            let boundary = cur.is_ascii_uppercase()
                && (prev.is_ascii_lowercase()
                    || prev.is_ascii_digit()
                    || (prev.is_ascii_uppercase() && next_lower));
            if boundary {
                tokens.push(chars[start..i].iter().collect::<String>().to_ascii_uppercase());
                start = i;
            }
        }
        tokens.push(chars[start..].iter().collect::<String>().to_ascii_uppercase());
    }
    tokens
}

fn first_keyword<'k>(tokens: &[String], keywords: &'k [String]) -> Option<&'k str> {
    keywords
        .iter()
        .find(|kw| tokens.iter().any(|t| t == *kw))
        .map(String::as_str)
}

/// read_only → REPLAY_IDEMPOTENT，其余 → REPLAY_EXACT（子任务另行处理）
pub fn derive_replay_policy(side_effect: SideEffectClass) -> ReplayPolicy {
    match side_effect {
        SideEffectClass::ReadOnly => ReplayPolicy::ReplayIdempotent,
        _ => ReplayPolicy::ReplayExact,
    }
}
