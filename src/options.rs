use serde::{Deserialize, Serialize};
use std::fs;

use crate::errors::Error;

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Options {
    // HTTP 正向代理前端
    pub proxy: ListenerOptions,
    // PostgreSQL 前端
    pub postgres: ListenerOptions,
    // MySQL 前端
    pub mysql: ListenerOptions,
    // Redis (RESP) 前端
    pub redis: ListenerOptions,
    // 管理接口
    pub api: ListenerOptions,
    // 状态文件路径
    pub state_file: String,
    // 日志
    pub logging: LoggingOptions,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ListenerOptions {
    pub host: String,
    pub port: u16,
}

impl ListenerOptions {
    fn new(host: &str, port: u16) -> Self {
        Self {
            host: host.to_string(),
            port,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingOptions {
    pub level: String,
    pub directory: String,
    pub file_name_prefix: String,
    pub rotation: LogRotationOptions,
    pub format: LogFormatOptions,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogRotationOptions {
    pub max_files: u32,
    pub compress: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogFormatOptions {
    pub timestamp: bool,
    pub level: bool,
    pub target: bool,
    pub thread_id: bool,
    pub file: bool,
    pub line_number: bool,
}

impl Options {
    /// 加载配置文件；文件不存在时回退到默认端口
    pub fn load(path: &str) -> Result<Self, Error> {
        let config_str = match fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&config_str).map_err(|e| Error::Config(e.to_string()))
    }
}

impl Default for Options {
    fn default() -> Self {
        Self {
            proxy: ListenerOptions::new("0.0.0.0", 9999),
            postgres: ListenerOptions::new("0.0.0.0", 54320),
            mysql: ListenerOptions::new("0.0.0.0", 33060),
            redis: ListenerOptions::new("0.0.0.0", 6380),
            api: ListenerOptions::new("0.0.0.0", 8080),
            state_file: "veritaserum.json".to_string(),
            logging: LoggingOptions::default(),
        }
    }
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: "logs".to_string(),
            file_name_prefix: "veritaserum".to_string(),
            rotation: LogRotationOptions::default(),
            format: LogFormatOptions::default(),
        }
    }
}

impl Default for LogRotationOptions {
    fn default() -> Self {
        Self {
            max_files: 10,
            compress: false,
        }
    }
}

impl Default for LogFormatOptions {
    fn default() -> Self {
        Self {
            timestamp: true,
            level: true,
            target: true,
            thread_id: false,
            file: false,
            line_number: false,
        }
    }
}
