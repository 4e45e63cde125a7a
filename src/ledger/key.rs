//! 幂等键
//!
//! 键只由调用方可控的内容决定：run、命名空间、工具名、参与去重的参数摘要、副作用范围、可选 nonce。
//! 不含时间戳，也不含 tool_call_id（除非它被当作 nonce）。

use serde_json::{json, Value};

use crate::normalize::hash;

const KEY_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy)]
pub struct KeyMaterial<'a> {
    pub run_id: &'a str,
    pub namespace: &'a str,
    pub tool_name: &'a str,
    pub args_hash: &'a str,
    pub scope: &'a str,
    pub nonce: Option<&'a str>,
}

pub fn idempotency_key(material: &KeyMaterial<'_>) -> String {
    let nonce = material.nonce.map(Value::from).unwrap_or(Value::Null);
    hash(&json!([
        KEY_VERSION,
        material.run_id,
        material.namespace,
        material.tool_name,
        material.args_hash,
        material.scope,
        nonce,
    ]))
}
