//! 副作用范围（scope）
//!
//! 把剔除易变字段后的参数缩减到决定"是不是同一次真实副作用"的字段：
//! 邮件只看收件人 + 主题 + 附件身份 + 回复/转发的目标消息（正文措辞不同仍算同一封），
//! 上传只看目标路径 + 文件身份，记忆写入只看内容哈希，其余工具使用完整规范参数哈希。
//! 只读工具不做族缩减；族字段一个都找不到时退回完整参数哈希。

use serde_json::{json, Map, Value};

use crate::normalize::canonical::{digest, hash, normalize, unordered};
use crate::policy::{name_tokens, SideEffectClass};

const TO_KEYS: &[&str] = &[
    "to",
    "recipient",
    "recipients",
    "recipient_email",
    "to_email",
    "extra_recipients",
];
const CC_KEYS: &[&str] = &["cc"];
const BCC_KEYS: &[&str] = &["bcc"];
const ATTACHMENT_KEYS: &[&str] = &["attachment", "attachments", "attachment_ids", "file_ids"];
const ATTACHMENT_IDENTITY_KEYS: &[&str] = &["s3key", "file_id", "id", "path", "name"];
/// 回复/转发所针对的消息或会话；转发不同消息即不同副作用
const MESSAGE_TARGET_KEYS: &[&str] = &[
    "thread_id",
    "threadId",
    "message_id",
    "messageId",
    "reply_to_message_id",
    "in_reply_to",
    "original_message_id",
    "conversation_id",
];

const DESTINATION_KEYS: &[&str] = &[
    "destination",
    "destination_path",
    "dest",
    "remote_path",
    "target_path",
    "path",
    "folder",
    "folder_id",
    "parent_id",
];
const FILE_NAME_KEYS: &[&str] = &["name", "file_name", "filename"];
const FILE_IDENTITY_KEYS: &[&str] = &[
    "file_id",
    "content_hash",
    "sha256",
    "local_path",
    "file_path",
    "source_path",
    "source",
    "url",
];
const FILE_CONTENT_KEYS: &[&str] = &["content", "data", "bytes"];

const MEMORY_CONTENT_KEYS: &[&str] = &["content", "text", "memory", "value", "fact"];

/// 按工具族区分的参数视图
#[derive(Debug, Clone, Copy)]
pub enum ToolArgs<'a> {
    EmailSend(&'a Map<String, Value>),
    FileUpload(&'a Map<String, Value>),
    MemoryWrite(&'a Map<String, Value>),
    Generic(&'a Value),
}

/// scope 结果：`scope` 为带族前缀的可读串，`relevant_hash` 为参与幂等键的参数摘要
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SideEffectScope {
    pub scope: String,
    pub relevant_hash: String,
}

impl<'a> ToolArgs<'a> {
    /// 根据工具名与副作用类别判定工具族；参数不是对象或工具只读时一律按通用处理
    pub fn from_call(tool_name: &str, side_effect: SideEffectClass, args: &'a Value) -> Self {
        let Value::Object(map) = args else {
            return ToolArgs::Generic(args);
        };
        if side_effect == SideEffectClass::ReadOnly {
            return ToolArgs::Generic(args);
        }
        let tokens = name_tokens(tool_name);
        let has = |t: &str| tokens.iter().any(|x| x == t);
        let is_mail = has("EMAIL") || has("MAIL") || has("GMAIL") || has("OUTLOOK");
        let is_send = has("SEND") || has("REPLY") || has("FORWARD");
        if is_mail && is_send {
            ToolArgs::EmailSend(map)
        } else if has("UPLOAD") {
            ToolArgs::FileUpload(map)
        } else if side_effect == SideEffectClass::Memory {
            ToolArgs::MemoryWrite(map)
        } else {
            ToolArgs::Generic(args)
        }
    }

    pub fn family(&self) -> &'static str {
        match self {
            ToolArgs::EmailSend(_) => "email",
            ToolArgs::FileUpload(_) => "upload",
            ToolArgs::MemoryWrite(_) => "memory",
            ToolArgs::Generic(_) => "args",
        }
    }

    /// 计算 scope；`args_hash` 为完整规范参数哈希，通用族及识别不出族字段时直接复用
    pub fn scope(&self, args_hash: &str) -> SideEffectScope {
        let relevant_hash = match self {
            ToolArgs::EmailSend(map) => email_identity(map).map(|v| hash(&v)),
            ToolArgs::FileUpload(map) => upload_identity(map).map(|v| hash(&v)),
            ToolArgs::MemoryWrite(map) => Some(memory_content_hash(map)),
            ToolArgs::Generic(_) => None,
        }
        .unwrap_or_else(|| args_hash.to_string());
        SideEffectScope {
            scope: format!("{}:{}", self.family(), relevant_hash),
            relevant_hash,
        }
    }
}

/// 既没有收件人也没有目标消息时返回 None
fn email_identity(map: &Map<String, Value>) -> Option<Value> {
    let to = addresses(map, TO_KEYS);
    let cc = addresses(map, CC_KEYS);
    let bcc = addresses(map, BCC_KEYS);
    let target: Vec<Value> = MESSAGE_TARGET_KEYS
        .iter()
        .filter_map(|k| map.get(*k).filter(|v| !v.is_null()).map(|v| json!([k, v])))
        .collect();
    if is_empty_set(&to) && is_empty_set(&cc) && is_empty_set(&bcc) && target.is_empty() {
        return None;
    }
    Some(json!({
        "to": to,
        "cc": cc,
        "bcc": bcc,
        "subject": map.get("subject").and_then(Value::as_str).map(collapse_whitespace),
        "attachments": attachments(map),
        "target": target,
    }))
}

fn is_empty_set(v: &Value) -> bool {
    v.as_array().is_some_and(Vec::is_empty)
}

/// 收件人：逗号分隔字符串、字符串数组或 {"email": ...} 对象数组，统一为小写去重排序集合
fn addresses(map: &Map<String, Value>, keys: &[&str]) -> Value {
    let mut found = Vec::new();
    for key in keys {
        if let Some(v) = map.get(*key) {
            collect_addresses(v, &mut found);
        }
    }
    found.sort();
    found.dedup();
    unordered(found.into_iter().map(Value::String))
}

fn collect_addresses(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) => out.extend(
            s.split([',', ';'])
                .map(|a| a.trim().to_lowercase())
                .filter(|a| !a.is_empty()),
        ),
        Value::Array(items) => items.iter().for_each(|i| collect_addresses(i, out)),
        Value::Object(obj) => {
            if let Some(email) = obj.get("email").or_else(|| obj.get("address")) {
                collect_addresses(email, out);
            }
        }
        _ => {}
    }
}

fn attachments(map: &Map<String, Value>) -> Value {
    let mut ids = Vec::new();
    for key in ATTACHMENT_KEYS {
        match map.get(*key) {
            Some(Value::Array(items)) => ids.extend(items.iter().map(attachment_identity)),
            Some(Value::Null) | None => {}
            Some(single) => ids.push(attachment_identity(single)),
        }
    }
    unordered(ids)
}

fn attachment_identity(item: &Value) -> Value {
    match item {
        Value::Object(obj) => first_present(obj, ATTACHMENT_IDENTITY_KEYS)
            .cloned()
            .unwrap_or_else(|| Value::String(hash(item))),
        other => other.clone(),
    }
}

/// 目标路径与文件身份都缺失时返回 None
fn upload_identity(map: &Map<String, Value>) -> Option<Value> {
    let destination: Vec<Value> = DESTINATION_KEYS
        .iter()
        .filter_map(|k| map.get(*k).filter(|v| !v.is_null()).map(|v| json!([k, v])))
        .collect();
    let file = first_present(map, FILE_IDENTITY_KEYS)
        .cloned()
        .or_else(|| first_present(map, FILE_CONTENT_KEYS).map(|c| Value::String(hash(c))));
    if destination.is_empty() && file.is_none() {
        return None;
    }
    Some(json!({
        "destination": destination,
        "name": first_present(map, FILE_NAME_KEYS),
        "file": file,
    }))
}

fn memory_content_hash(map: &Map<String, Value>) -> String {
    match first_present(map, MEMORY_CONTENT_KEYS) {
        Some(Value::String(s)) => digest(&collapse_whitespace(s)),
        Some(other) => hash(other),
        None => digest(&normalize(&Value::Object(map.clone()))),
    }
}

fn first_present<'m>(map: &'m Map<String, Value>, keys: &[&str]) -> Option<&'m Value> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find(|v| !v.is_null())
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
