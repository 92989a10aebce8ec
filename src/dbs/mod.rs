//! 数据库协议前端：PostgreSQL、MySQL 与 Redis (RESP)
//!
//! 三个前端共用同一套三态语义：已配置的键回放配置的结果，
//! pending 的键回以协议上最中性的"空结果"，首次出现的键注册后
//! 同样回空结果，从不向客户端报错。

pub mod mysql;
pub mod postgres;
pub mod redis;

use serde_json::Value;

/// SQL 结果集按文本列回放；None 表示 NULL 列
pub(crate) fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
