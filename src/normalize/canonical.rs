//! 规范序列化与哈希
//!
//! 对象键按字节序排序，数组逐元素规范化，整数值的浮点数按整数输出；
//! 无序集合请先经 [`unordered`] 排序后再放入参数。元组在 serde 中序列化为数组，
//! 因此 tuple / Vec / 排序后的 set 只要元素相同即得到同一规范串。

use serde::Serialize;
use serde_json::{Number, Value};
use sha2::{Digest, Sha256};

/// 规范字符串：与输入的键顺序无关
pub fn normalize(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// 先经 serde 转成 JSON 再规范化（HashSet 等请改用 BTreeSet 或 [`unordered`]）
pub fn normalize_serializable<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(normalize(&serde_json::to_value(value)?))
}

/// 规范串的 SHA-256（十六进制小写）
pub fn hash(value: &Value) -> String {
    digest(&normalize(value))
}

pub fn digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// 将无序集合转为按规范串排序的数组
pub fn unordered<I>(items: I) -> Value
where
    I: IntoIterator<Item = Value>,
{
    let mut keyed: Vec<(String, Value)> = items
        .into_iter()
        .map(|item| (normalize(&item), item))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Value::Array(keyed.into_iter().map(|(_, item)| item).collect())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        Value::Number(n) => write_number(n, out),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

fn write_string(s: &str, out: &mut String) {
    // Value 的 Display 负责 JSON 转义
    out.push_str(&Value::String(s.to_owned()).to_string());
}

fn write_number(n: &Number, out: &mut String) {
    if n.is_f64() {
        if let Some(f) = n.as_f64() {
            if f.fract() == 0.0 && f.abs() < 9.007_199_254_740_992e15 {
                out.push_str(&(f as i64).to_string());
                return;
            }
        }
    }
    out.push_str(&n.to_string());
}
