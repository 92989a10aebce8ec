//! Redis (RESP) 前端
//!
//! 支持数组形式（`*N` + 批量字符串）与行内命令两种输入，两者解析为
//! 相同的 `(command, args)` 即路由到同一个键。
//!
//! 应答只有三种：PING 固定回 `+PONG`，已配置的键回批量字符串
//! （空值回空批量 `$-1`），其余一律回空批量。协议错误应答从不发出，
//! 以免打断正在等待配置的客户端。

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::{
    errors::Error,
    model::{redis_key, Protocol, RequestSnapshot, ResponseSpec},
    options::Options,
    store::Store,
};

const NULL_BULK: &[u8] = b"$-1\r\n";

pub async fn start_server(options: Arc<Options>, store: Arc<Store>) -> Result<(), Error> {
    let addr =
        SocketAddr::from_str(&options.redis.addr()).map_err(|e| Error::Config(e.to_string()))?;
    let listener = TcpListener::bind(addr).await?;
    info!("Redis front-end listening on {}", addr);
    serve(listener, store).await
}

/// 在已绑定的监听器上运行接受循环，直到收到关闭信号
pub async fn serve(listener: TcpListener, store: Arc<Store>) -> Result<(), Error> {
    let mut shutdown = crate::shutdown_receiver();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => {
                info!("Redis front-end shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                let store = store.clone();
                tokio::task::spawn(async move {
                    if let Err(e) = handle_conn(stream, store).await {
                        debug!("redis connection closed: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("redis accept error: {}", e);
                continue;
            }
        }
    }
}

async fn handle_conn(stream: TcpStream, store: Arc<Store>) -> Result<(), Error> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let Some(args) = read_command(&mut reader).await? else {
            return Ok(());
        };
        if args.is_empty() {
            return Ok(());
        }
        let command = args[0].to_uppercase();
        let args = &args[1..];

        // PING 不进存储
        if command == "PING" {
            write_half.write_all(b"+PONG\r\n").await?;
            continue;
        }

        let key = redis_key(&command, args);

        if let Some(interaction) = store.lookup_configured(Protocol::Redis, &key).await {
            info!("REDIS PLAYBACK: {}", key);
            let value = match interaction.response {
                Some(ResponseSpec::Redis { value }) => value,
                other => {
                    warn!("mismatched response variant on redis playback: {:?}", other);
                    String::new()
                }
            };
            write_half.write_all(&bulk_string(&value)).await?;
            continue;
        }

        if !store.is_pending(Protocol::Redis, &key).await {
            store
                .register(
                    Protocol::Redis,
                    key.clone(),
                    RequestSnapshot::Redis {
                        command: command.clone(),
                        args: args.to_vec(),
                    },
                )
                .await;
            info!("REDIS INTERCEPT: {} registered as pending", key);
        }

        // 空批量不会让客户端崩溃
        write_half.write_all(NULL_BULK).await?;
    }
}

/// 读取一条命令；对端关闭时返回 None，空行视为关闭信号交由上层处理
async fn read_command<R>(reader: &mut R) -> Result<Option<Vec<String>>, Error>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    let line = line.trim_end_matches(|c| c == '\r' || c == '\n');
    if line.is_empty() {
        return Ok(Some(Vec::new()));
    }

    if let Some(count) = line.strip_prefix('*') {
        // 数组形式：*<n>\r\n 后接 n 个批量字符串
        let count: i64 = count
            .parse()
            .map_err(|_| Error::Wire(format!("invalid array count: {}", line)))?;
        if count <= 0 {
            return Err(Error::Wire(format!("invalid array count: {}", line)));
        }
        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let mut len_line = String::new();
            if reader.read_line(&mut len_line).await? == 0 {
                return Ok(None);
            }
            let len_line = len_line.trim_end_matches(|c| c == '\r' || c == '\n');
            let Some(len) = len_line.strip_prefix('$') else {
                return Err(Error::Wire(format!(
                    "expected bulk string, got: {}",
                    len_line
                )));
            };
            let len: usize = len
                .parse()
                .map_err(|_| Error::Wire(format!("invalid bulk length: {}", len_line)))?;
            let mut buf = vec![0u8; len + 2]; // 含结尾 \r\n
            reader.read_exact(&mut buf).await?;
            args.push(String::from_utf8_lossy(&buf[..len]).to_string());
        }
        return Ok(Some(args));
    }

    // 行内命令，按空白切分
    Ok(Some(line.split_whitespace().map(str::to_string).collect()))
}

/// 批量字符串应答；空值序列化为空批量 `$-1\r\n`
fn bulk_string(value: &str) -> Vec<u8> {
    if value.is_empty() {
        return NULL_BULK.to_vec();
    }
    format!("${}\r\n{}\r\n", value.len(), value).into_bytes()
}
