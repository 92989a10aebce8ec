//! 数据模型 - 捕获记录、测试用例与表结构提示
//!
//! 所有协议前端共享同一套捕获模型：一次请求对应一个 `Interaction`，
//! 由 `(protocol, key)` 唯一标识。路由键的构造规则在本模块集中定义，
//! 捕获与配置双方必须使用完全相同的字节形式。

use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// 支持的协议
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    #[serde(rename = "HTTP")]
    Http,
    #[serde(rename = "POSTGRES")]
    Postgres,
    #[serde(rename = "MYSQL")]
    Mysql,
    #[serde(rename = "REDIS")]
    Redis,
    #[serde(rename = "DYNAMODB")]
    Dynamodb,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Http => "HTTP",
            Protocol::Postgres => "POSTGRES",
            Protocol::Mysql => "MYSQL",
            Protocol::Redis => "REDIS",
            Protocol::Dynamodb => "DYNAMODB",
        };
        f.write_str(s)
    }
}

/// 捕获记录的状态
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InteractionState {
    // 已捕获，等待配置响应
    Pending,
    // 已配置响应，可回放
    Configured,
}

/// 请求快照，按协议打标签
///
/// `protocol` 字段驱动序列化与回放编码，变体错配（例如 HTTP 记录上出现
/// SQL 行）属于编程错误，回放端按空结果降级处理。
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RequestSnapshot {
    #[serde(rename_all = "camelCase")]
    Http {
        method: String,
        host: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: String,
        #[serde(default)]
        body_hash: String,
    },
    #[serde(rename_all = "camelCase")]
    Dynamodb {
        method: String,
        host: String,
        path: String,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: String,
        #[serde(default)]
        body_hash: String,
        // 从 X-Amz-Target 请求头解析，缺失时为空
        #[serde(default)]
        operation: String,
        // 从请求体的 TableName 字段解析，缺失时为空
        #[serde(default)]
        table: String,
        #[serde(default)]
        key_json: String,
    },
    #[serde(rename_all = "camelCase")]
    Sql { query: String },
    #[serde(rename_all = "camelCase")]
    Redis {
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

/// 配置的响应，按协议打标签
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ResponseSpec {
    #[serde(rename_all = "camelCase")]
    Http {
        status_code: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: String,
        #[serde(default)]
        latency_ms: u64,
    },
    #[serde(rename_all = "camelCase")]
    Sql {
        // SELECT 结果集，字段顺序以首行插入顺序为准
        #[serde(default)]
        rows: Vec<serde_json::Map<String, Value>>,
        // INSERT/UPDATE/DELETE 影响行数
        #[serde(default)]
        affected_rows: u64,
    },
    #[serde(rename_all = "camelCase")]
    Dynamodb {
        #[serde(default)]
        item_json: String,
    },
    #[serde(rename_all = "camelCase")]
    Redis {
        #[serde(default)]
        value: String,
    },
}

/// 一次捕获的请求/响应对，存储的原子单位
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Interaction {
    pub id: String,
    pub protocol: Protocol,
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub request: RequestSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSpec>,
    pub state: InteractionState,
    #[serde(default)]
    pub test_case_id: String,
    pub captured_at: SystemTime,
}

impl Interaction {
    /// 以 pending 状态新建一条捕获记录，分配 id 与时间戳
    pub fn pending(protocol: Protocol, key: String, request: RequestSnapshot) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            protocol,
            key,
            name: String::new(),
            request,
            response: None,
            state: InteractionState::Pending,
            test_case_id: String::new(),
            captured_at: SystemTime::now(),
        }
    }
}

/// 测试用例 - 一组捕获记录的命名分组，仅供管理接口使用
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub interaction_ids: Vec<String>,
    pub created_at: SystemTime,
}

/// 表结构提示 - 按 (protocol, tableName) 存储的建表语句，仅供 UI 参考
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub table_name: String,
    pub protocol: Protocol,
    pub create_statement: String,
}

/// 计算请求体哈希：SHA-256 前 8 字节的十六进制，空请求体返回空字符串
pub fn body_hash(body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    let digest = Sha256::digest(body);
    hex::encode(&digest[..8])
}

/// HTTP / DynamoDB 路由键："{METHOD} {host} {path} {bodyHash}"
pub fn http_key(method: &str, host: &str, path: &str, body_hash: &str) -> String {
    format!("{} {} {} {}", method, host, path, body_hash)
}

/// SQL 路由键："POSTGRES {sql}" / "MYSQL {sql}"，SQL 文本不做任何归一化
pub fn db_key(protocol: Protocol, query: &str) -> String {
    format!("{} {}", protocol, query)
}

/// Redis 路由键：大写命令后接空格分隔的原始参数
pub fn redis_key(command: &str, args: &[String]) -> String {
    let mut key = command.to_string();
    for arg in args {
        key.push(' ');
        key.push_str(arg);
    }
    key
}
