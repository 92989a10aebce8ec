//! Veritaserum - 服务虚拟化边车
//!
//! 被测服务的全部外呼依赖（HTTP、MySQL、PostgreSQL、Redis、DynamoDB）
//! 都可以指向本进程：已配置的请求回放配置好的响应，首次出现的请求
//! 捕获为 pending，等待通过管理接口配置。
//!
//! 主要模块说明：
//! - store: 全部前端共享的捕获存储
//! - proxy: HTTP 正向代理前端（含 DynamoDB 识别）
//! - dbs: PostgreSQL / MySQL / Redis 线协议前端
//! - api: 管理 REST 接口

pub mod api;
pub mod dbs;
pub mod errors;
pub mod logger;
pub mod model;
pub mod options;
pub mod proxy;
pub mod store;

use std::sync::Arc;

use once_cell::sync::Lazy;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::error;

use crate::{errors::Error, options::Options, store::Store};

static SHUTDOWN: Lazy<broadcast::Sender<()>> = Lazy::new(|| broadcast::channel(8).0);

/// 订阅关闭信号，各前端的接受循环在信号到达后退出
pub fn shutdown_receiver() -> broadcast::Receiver<()> {
    SHUTDOWN.subscribe()
}

/// 广播关闭信号
pub async fn send_shutdown_signal() {
    let _ = SHUTDOWN.send(());
}

/// 启动全部协议前端
///
/// `headless` 为 true 时（回放模式）不启动管理接口。
/// 每个前端跑在独立任务上，返回带名字的任务句柄，供优雅关闭时
/// 按前端逐个回收并记录。
pub async fn start_veritaserum(
    options: &Options,
    store: Arc<Store>,
    headless: bool,
) -> Result<Vec<(&'static str, JoinHandle<()>)>, Error> {
    let options = Arc::new(options.clone());
    let mut handles = Vec::new();

    {
        let options = options.clone();
        let store = store.clone();
        handles.push((
            "http-proxy",
            tokio::spawn(async move {
                if let Err(e) = proxy::http::start_server(options, store).await {
                    error!("HTTP proxy front-end exited: {}", e);
                }
            }),
        ));
    }
    {
        let options = options.clone();
        let store = store.clone();
        handles.push((
            "postgres",
            tokio::spawn(async move {
                if let Err(e) = dbs::postgres::start_server(options, store).await {
                    error!("PostgreSQL front-end exited: {}", e);
                }
            }),
        ));
    }
    {
        let options = options.clone();
        let store = store.clone();
        handles.push((
            "mysql",
            tokio::spawn(async move {
                if let Err(e) = dbs::mysql::start_server(options, store).await {
                    error!("MySQL front-end exited: {}", e);
                }
            }),
        ));
    }
    {
        let options = options.clone();
        let store = store.clone();
        handles.push((
            "redis",
            tokio::spawn(async move {
                if let Err(e) = dbs::redis::start_server(options, store).await {
                    error!("Redis front-end exited: {}", e);
                }
            }),
        ));
    }
    if !headless {
        let options = options.clone();
        let store = store.clone();
        handles.push((
            "management-api",
            tokio::spawn(async move {
                if let Err(e) = api::start_server(options, store).await {
                    error!("management API exited: {}", e);
                }
            }),
        ));
    }

    Ok(handles)
}
