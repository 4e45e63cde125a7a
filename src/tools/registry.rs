//! 工具注册表
//!
//! 工具按 (命名空间, 工具名) 注册；名字与 ToolNameResolver 的解析结果一致，
//! 即 MCP 工具注册为 ("mcp", "GMAIL_SEND_EMAIL") 而不是带前缀的原始名。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

/// 一次成功执行的产出
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub content: String,
    /// 外部系统返回的关联 id（消息 id、工单号等），写入回执
    pub correlation_id: Option<String>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            correlation_id: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// 工具 trait：名称、命名空间、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 解析后的工具名
    fn name(&self) -> &str;

    fn namespace(&self) -> &str {
        "generic"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, String>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<(String, String), Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let key = (tool.namespace().to_lowercase(), tool.name().to_string());
        self.tools.insert(key, Arc::new(tool));
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .get(&(namespace.to_lowercase(), name.to_string()))
            .cloned()
    }

    /// (namespace, name) 列表，按字典序
    pub fn tool_names(&self) -> Vec<(String, String)> {
        let mut names: Vec<_> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str, &'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.1
        }

        fn namespace(&self) -> &str {
            self.0
        }

        async fn execute(&self, _args: Value) -> Result<ToolOutput, String> {
            Ok(ToolOutput::text(self.1))
        }
    }

    #[test]
    fn test_lookup_by_namespace() {
        let mut registry = ToolRegistry::new();
        registry.register(Named("mcp", "GMAIL_SEND_EMAIL"));
        registry.register(Named("native", "spawn_subtask"));

        assert!(registry.get("MCP", "GMAIL_SEND_EMAIL").is_some());
        assert!(registry.get("generic", "GMAIL_SEND_EMAIL").is_none());
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.tool_names()[0],
            ("mcp".to_string(), "GMAIL_SEND_EMAIL".to_string())
        );
    }
}
