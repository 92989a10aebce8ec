//! Veritaserum - 服务虚拟化边车
//!
//! 本地或 CI 中运行的单进程：吸收被测服务的全部外呼依赖调用，
//! 已录制的请求回放配置的响应，新请求捕获为 pending 供管理接口配置。

use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tokio::time::timeout;
use veritaserum::{
    errors::Error, logger, options::Options, send_shutdown_signal, start_veritaserum,
    store::Store,
};
use tracing::{error, info, warn};

/// Veritaserum - 服务虚拟化边车
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// 配置文件路径
    #[arg(short, long, default_value = "config.json")]
    config: String,

    /// 日志级别
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// 无界面回放模式：从套件文件装载已配置的捕获记录
    #[arg(long)]
    replay: bool,

    /// 回放套件文件路径，回放模式下必填
    #[arg(long, required_if_eq("replay", "true"))]
    suite: Option<String>,

    /// 运行指定秒数后自动退出
    #[arg(long)]
    exit_after: Option<u64>,
}

/// 程序入口函数
///
/// # 错误处理
///
/// 返回 `Result<(), Error>` 表示可能的错误：
/// - 配置加载失败
/// - 回放套件缺失或不可读
/// - 服务器启动失败
#[tokio::main]
async fn main() -> Result<(), Error> {
    // 解析命令行参数
    let args = Args::parse();

    // 加载配置，CLI 的日志级别覆盖配置文件
    let mut options = Options::load(&args.config)?;
    options.logging.level = args.log_level.clone();

    // 初始化日志
    logger::init_logger(&options.logging)?;
    info!("Starting Veritaserum with config: {}", args.config);

    let store = Store::new(&options.state_file);

    if args.replay {
        let Some(suite) = args.suite.as_deref() else {
            return Err(Error::Config("--suite is required with --replay".to_string()));
        };
        let loaded = match store.load_suite(suite).await {
            Ok(loaded) => loaded,
            Err(e) => {
                error!("Failed to load suite {}: {}", suite, e);
                return Err(e);
            }
        };
        info!("replay mode: {} configured interactions loaded from {}", loaded, suite);
    } else {
        // 状态文件存在时恢复上次会话
        store.load_state().await;
    }

    // 启动全部前端
    let handles = start_veritaserum(&options, store, args.replay).await?;

    // 等待关闭信号或运行期限
    shutdown_signal(args.exit_after).await;

    // 优雅关闭服务
    graceful_shutdown(handles).await;

    Ok(())
}

/// 等待关闭信号；设置了运行期限时到期自动触发关闭
async fn shutdown_signal(exit_after: Option<u64>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let deadline = async {
        match exit_after {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("ctrl+c signal received, starting graceful shutdown");
        },
        _ = terminate => {
            info!("terminate signal received, starting graceful shutdown");
        },
        _ = deadline => {
            info!("run deadline reached, starting graceful shutdown");
        },
    }
    send_shutdown_signal().await;
}

/// 回收前端任务，关闭信号已在 `shutdown_signal` 里广播
///
/// 全部前端共享一个宽限期，而不是每个任务单独计时：关闭信号是
/// 广播的，各接受循环并行退出，先回收的任务不应延长后面的预算。
/// 宽限期内没退出的任务直接中止。
async fn graceful_shutdown(handles: Vec<(&'static str, tokio::task::JoinHandle<()>)>) {
    const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);
    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;

    for (name, handle) in handles {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let abort_handle = handle.abort_handle();
        match timeout(remaining, handle).await {
            Ok(Ok(())) => info!("{} stopped", name),
            Ok(Err(e)) => warn!("{} stopped with error: {}", name, e),
            Err(_) => {
                warn!("{} did not stop within the grace period, aborting", name);
                abort_handle.abort();
            }
        }
    }

    info!("shutdown complete");
}
