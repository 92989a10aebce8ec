//! PostgreSQL v3 线协议前端
//!
//! 实现常用客户端驱动所需的最小子集：
//! StartupMessage -> AuthenticationOk -> ReadyForQuery，
//! 之后循环处理简单查询 (`Q`) 与 Terminate (`X`)。
//! 扩展查询、COPY、SSL 协商与错误报文均不实现。
//!
//! 后端报文统一为 1 字节类型 + 大端 int32 长度（含自身）+ 内容。

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::{
    errors::Error,
    model::{db_key, Protocol, RequestSnapshot, ResponseSpec},
    options::Options,
    store::Store,
};

pub async fn start_server(options: Arc<Options>, store: Arc<Store>) -> Result<(), Error> {
    let addr =
        SocketAddr::from_str(&options.postgres.addr()).map_err(|e| Error::Config(e.to_string()))?;
    let listener = TcpListener::bind(addr).await?;
    info!("PostgreSQL front-end listening on {}", addr);
    serve(listener, store).await
}

/// 在已绑定的监听器上运行接受循环，直到收到关闭信号
pub async fn serve(listener: TcpListener, store: Arc<Store>) -> Result<(), Error> {
    let mut shutdown = crate::shutdown_receiver();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => {
                info!("PostgreSQL front-end shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                let store = store.clone();
                tokio::task::spawn(async move {
                    if let Err(e) = handle_conn(stream, store).await {
                        debug!("postgres connection closed: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("postgres accept error: {}", e);
                continue;
            }
        }
    }
}

/// 单连接状态机：Opening -> AwaitingQuery -> Idle 循环
async fn handle_conn(mut stream: TcpStream, store: Arc<Store>) -> Result<(), Error> {
    // --- StartupMessage：大端 int32 总长度 + 参数区，内容不解析 ---
    let mut len_buf = [0u8; 4];
    if stream.read_exact(&mut len_buf).await.is_err() {
        return Ok(());
    }
    let len = i32::from_be_bytes(len_buf);
    if len < 4 {
        return Err(Error::Wire(format!("startup message length {} out of range", len)));
    }
    let mut startup = vec![0u8; (len - 4) as usize];
    stream.read_exact(&mut startup).await?;

    stream.write_all(&authentication_ok()).await?;
    stream.write_all(&ready_for_query()).await?;

    loop {
        let mut tag = [0u8; 1];
        if stream.read_exact(&mut tag).await.is_err() {
            // 对端关闭
            return Ok(());
        }
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await?;
        let len = i32::from_be_bytes(len_buf);
        if len < 4 {
            return Err(Error::Wire(format!("message length {} out of range", len)));
        }
        let mut body = vec![0u8; (len - 4) as usize];
        stream.read_exact(&mut body).await?;

        match tag[0] {
            b'Q' => {
                // 查询体为以 NUL 结尾的 SQL 文本
                let sql = String::from_utf8_lossy(&body)
                    .trim_end_matches('\0')
                    .to_string();
                info!("POSTGRES QUERY: {}", sql);
                handle_query(&mut stream, &store, sql).await?;
            }
            b'X' => return Ok(()),
            other => {
                debug!("ignoring postgres message type {:?}", other as char);
            }
        }
    }
}

async fn handle_query(stream: &mut TcpStream, store: &Store, sql: String) -> Result<(), Error> {
    let key = db_key(Protocol::Postgres, &sql);

    if let Some(interaction) = store.lookup_configured(Protocol::Postgres, &key).await {
        info!("POSTGRES PLAYBACK: {}", sql);
        let reply = match interaction.response {
            Some(ResponseSpec::Sql { rows, .. }) => encode_result(&rows),
            other => {
                warn!("mismatched response variant on postgres playback: {:?}", other);
                encode_result(&[])
            }
        };
        stream.write_all(&reply).await?;
        return Ok(());
    }

    if !store.is_pending(Protocol::Postgres, &key).await {
        store
            .register(
                Protocol::Postgres,
                key,
                RequestSnapshot::Sql { query: sql.clone() },
            )
            .await;
        info!("POSTGRES INTERCEPT: {} registered as pending", sql);
    }

    let mut reply = BytesMut::new();
    reply.extend_from_slice(&command_complete("SELECT 0"));
    reply.extend_from_slice(&ready_for_query());
    stream.write_all(&reply).await?;
    Ok(())
}

/// 把配置的结果集编码为 RowDescription + DataRow* + CommandComplete + ReadyForQuery
///
/// 字段名取首行键的插入顺序，全部声明为 text (OID 25)；
/// 空结果集退化为 CommandComplete("SELECT 0")。
fn encode_result(rows: &[serde_json::Map<String, Value>]) -> Bytes {
    let mut out = BytesMut::new();
    if rows.is_empty() {
        out.extend_from_slice(&command_complete("SELECT 0"));
        out.extend_from_slice(&ready_for_query());
        return out.freeze();
    }

    let columns: Vec<&String> = rows[0].keys().collect();

    // RowDescription ('T')
    let mut body = BytesMut::new();
    body.put_i16(columns.len() as i16);
    for column in &columns {
        body.put_slice(column.as_bytes());
        body.put_u8(0);
        body.put_i32(0); // table OID
        body.put_i16(0); // column attribute number
        body.put_i32(25); // type OID: text
        body.put_i16(-1); // type size: variable
        body.put_i32(-1); // type modifier
        body.put_i16(0); // format: text
    }
    out.extend_from_slice(&message(b'T', &body));

    // DataRow ('D')，NULL 列长度为 -1
    for row in rows {
        let mut body = BytesMut::new();
        body.put_i16(columns.len() as i16);
        for column in &columns {
            match row.get(*column).and_then(super::text_value) {
                Some(value) => {
                    body.put_i32(value.len() as i32);
                    body.put_slice(value.as_bytes());
                }
                None => body.put_i32(-1),
            }
        }
        out.extend_from_slice(&message(b'D', &body));
    }

    out.extend_from_slice(&command_complete(&format!("SELECT {}", rows.len())));
    out.extend_from_slice(&ready_for_query());
    out.freeze()
}

fn message(tag: u8, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + body.len());
    buf.put_u8(tag);
    buf.put_i32(4 + body.len() as i32);
    buf.put_slice(body);
    buf.freeze()
}

fn authentication_ok() -> Bytes {
    message(b'R', &0i32.to_be_bytes())
}

fn ready_for_query() -> Bytes {
    // 事务状态恒为空闲 ('I')
    message(b'Z', b"I")
}

fn command_complete(tag: &str) -> Bytes {
    let mut body = BytesMut::with_capacity(tag.len() + 1);
    body.put_slice(tag.as_bytes());
    body.put_u8(0);
    message(b'C', &body)
}
