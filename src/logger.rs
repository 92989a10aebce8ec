use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    fmt::{self, time::SystemTime},
    prelude::*,
    EnvFilter,
};

use crate::{errors::Error, options::LoggingOptions};

/// 初始化日志系统
///
/// 控制台输出 + 按天轮转的日志文件；启用压缩时由后台线程定期
/// 把轮转出去的旧日志压成 gzip。
pub fn init_logger(opts: &LoggingOptions) -> Result<(), Error> {
    // 创建日志目录
    let log_dir = opts.directory.clone();
    std::fs::create_dir_all(&log_dir)?;

    // 配置日志级别
    let level = match opts.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // 配置日志轮转
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(opts.rotation.max_files as usize)
        .filename_prefix(&opts.file_name_prefix)
        .build(&log_dir)
        .map_err(|e| Error::Logger(e.to_string()))?;

    let format_opts = opts.format.clone();

    let file_layer = fmt::layer()
        .with_file(format_opts.file)
        .with_line_number(format_opts.line_number)
        .with_thread_ids(format_opts.thread_id)
        .with_target(format_opts.target)
        .with_level(format_opts.level)
        .with_timer(SystemTime::default())
        .with_ansi(false)
        .with_writer(file_appender);

    let stdout_layer = fmt::layer()
        .with_target(format_opts.target)
        .with_level(format_opts.level)
        .with_timer(SystemTime::default());

    // 创建环境过滤器
    let env_filter = EnvFilter::from_default_env().add_directive(level.into());

    // 设置全局默认订阅者
    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| Error::Logger(e.to_string()))?;

    // 如果启用了压缩，启动后台压缩任务
    if opts.rotation.compress {
        spawn_log_compression(opts);
    }

    Ok(())
}

/// 周期扫描日志目录，压缩已经轮转出去的旧日志
///
/// 按天轮转的文件名形如 "<prefix>.2026-08-02"，没有固定扩展名，
/// 所以按配置的文件名前缀匹配。
fn spawn_log_compression(opts: &LoggingOptions) {
    let dir = PathBuf::from(&opts.directory);
    let prefix = opts.file_name_prefix.clone();
    std::thread::spawn(move || loop {
        std::thread::sleep(Duration::from_secs(3600)); // 每小时检查一次
        if let Err(e) = gzip_rotated_logs(&dir, &prefix, Duration::from_secs(24 * 3600)) {
            eprintln!("log compression failed in {}: {}", dir.display(), e);
        }
    });
}

/// 压缩目录里带指定前缀、且超过 min_age 未再写入的日志文件
///
/// 最近写过的文件视为追加器仍在使用，跳过；已经压缩过的也跳过。
/// 压缩成功后删除原文件。
fn gzip_rotated_logs(dir: &Path, prefix: &str, min_age: Duration) -> io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.starts_with(prefix) || name.ends_with(".gz") {
            continue;
        }
        let age = entry
            .metadata()?
            .modified()?
            .elapsed()
            .unwrap_or(Duration::ZERO);
        if age < min_age {
            continue;
        }
        let target = path.with_file_name(format!("{}.gz", name));
        if target.exists() {
            continue;
        }
        gzip_file(&path, &target)?;
        std::fs::remove_file(&path)?;
    }
    Ok(())
}

fn gzip_file(source: &Path, target: &Path) -> io::Result<()> {
    use flate2::write::GzEncoder;
    use flate2::Compression;

    let mut input = std::fs::File::open(source)?;
    let mut encoder = GzEncoder::new(std::fs::File::create(target)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}
