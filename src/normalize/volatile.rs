//! 易变字段剔除
//!
//! 幂等键本身、客户端请求 id、批量执行的会话 id / 步骤计数等字段每次重试都可能变化，
//! 计算哈希前必须去掉，否则同一意图会被当成两次不同的调用。

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

/// 对应配置 [normalize] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SanitizeConfig {
    /// 所有工具都剔除的顶层字段
    pub volatile_fields: Vec<String>,
    /// 按工具名（小写）额外剔除的顶层字段
    pub tool_volatile_fields: HashMap<String, Vec<String>>,
}

impl Default for SanitizeConfig {
    fn default() -> Self {
        let mut tool_volatile_fields = HashMap::new();
        tool_volatile_fields.insert(
            "multi_execute_tool".to_string(),
            vec![
                "session_id".into(),
                "current_step".into(),
                "current_step_metric".into(),
                "step_index".into(),
                "total_steps".into(),
                "sync_response_to_workbench".into(),
            ],
        );
        tool_volatile_fields.insert(
            "remote_workbench".to_string(),
            vec!["session_id".into(), "current_step".into()],
        );
        Self {
            volatile_fields: vec![
                "idempotency_key".into(),
                "request_id".into(),
                "client_request_id".into(),
                "x_request_id".into(),
            ],
            tool_volatile_fields,
        }
    }
}

impl SanitizeConfig {
    /// 返回剔除易变字段后的参数副本；非对象参数原样返回
    pub fn sanitize(&self, tool_name: &str, args: &Value) -> Value {
        let Value::Object(map) = args else {
            return args.clone();
        };
        let tool_fields = self
            .tool_volatile_fields
            .get(&tool_name.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let mut cleaned = map.clone();
        for field in self.volatile_fields.iter().chain(tool_fields) {
            cleaned.remove(field);
        }
        Value::Object(cleaned)
    }
}
