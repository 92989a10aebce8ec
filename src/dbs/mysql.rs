//! MySQL 线协议前端
//!
//! 握手 + 命令阶段，支持 COM_QUERY、COM_STMT_PREPARE / EXECUTE / CLOSE、
//! COM_PING 与 COM_QUIT。不做 TLS、不做压缩、不校验认证挑战：客户端的
//! HandshakeResponse 读完即弃，一律回 OK。
//!
//! 预处理语句只记录 SQL 文本，EXECUTE 忽略绑定参数，按原始文本路由。
//!
//! 报文帧：3 字节小端长度 + 1 字节序号 + 内容。每轮客户端请求把序号
//! 重置为 0，服务端每写一包序号加一。

use std::{collections::HashMap, net::SocketAddr, str::FromStr, sync::Arc};

use bytes::{BufMut, BytesMut};
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

const COM_QUIT: u8 = 0x01;
const COM_QUERY: u8 = 0x03;
const COM_PING: u8 = 0x0e;
const COM_STMT_PREPARE: u8 = 0x16;
const COM_STMT_EXECUTE: u8 = 0x17;
const COM_STMT_CLOSE: u8 = 0x19;

pub async fn start_server(options: Arc<Options>, store: Arc<Store>) -> Result<(), Error> {
    let addr =
        SocketAddr::from_str(&options.mysql.addr()).map_err(|e| Error::Config(e.to_string()))?;
    let listener = TcpListener::bind(addr).await?;
    info!("MySQL front-end listening on {}", addr);
    serve(listener, store).await
}

/// 在已绑定的监听器上运行接受循环，直到收到关闭信号
pub async fn serve(listener: TcpListener, store: Arc<Store>) -> Result<(), Error> {
    let mut shutdown = crate::shutdown_receiver();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => {
                info!("MySQL front-end shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, _)) => {
                let store = store.clone();
                tokio::task::spawn(async move {
                    if let Err(e) = handle_conn(stream, store).await {
                        debug!("mysql connection closed: {}", e);
                    }
                });
            }
            Err(e) => {
                error!("mysql accept error: {}", e);
                continue;
            }
        }
    }
}

/// 单连接状态：序号计数器与预处理语句表，均为连接私有
struct Connection {
    stream: TcpStream,
    seq: u8,
    stmts: HashMap<u32, String>,
    next_stmt_id: u32,
}

impl Connection {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            seq: 0,
            stmts: HashMap::new(),
            next_stmt_id: 1,
        }
    }

    /// 读一个报文；对端关闭时返回 None。序号跟随客户端报文推进。
    async fn read_packet(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut header = [0u8; 4];
        if self.stream.read_exact(&mut header).await.is_err() {
            return Ok(None);
        }
        let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
        self.seq = header[3].wrapping_add(1);
        if len == 0 {
            return Ok(Some(Vec::new()));
        }
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(|e| Error::Wire(format!("truncated mysql packet: {}", e)))?;
        Ok(Some(payload))
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<(), Error> {
        let len = payload.len();
        let header = [len as u8, (len >> 8) as u8, (len >> 16) as u8, self.seq];
        self.seq = self.seq.wrapping_add(1);
        self.stream.write_all(&header).await?;
        self.stream.write_all(payload).await?;
        Ok(())
    }
}

async fn handle_conn(stream: TcpStream, store: Arc<Store>) -> Result<(), Error> {
    let mut conn = Connection::new(stream);

    conn.write_packet(&handshake_packet()).await?;

    // 客户端 HandshakeResponse 读完即弃，不校验
    if conn.read_packet().await?.is_none() {
        return Ok(());
    }
    conn.write_packet(&ok_packet(0)).await?;

    loop {
        let Some(payload) = conn.read_packet().await? else {
            return Ok(());
        };
        if payload.is_empty() {
            return Ok(());
        }
        let cmd = payload[0];
        let data = &payload[1..];

        match cmd {
            COM_QUERY => {
                let sql = String::from_utf8_lossy(data).to_string();
                info!("MYSQL QUERY: {}", sql);
                handle_query(&mut conn, &store, sql).await?;
            }
            COM_STMT_PREPARE => {
                let sql = String::from_utf8_lossy(data).to_string();
                info!("MYSQL STMT_PREPARE: {}", sql);
                handle_stmt_prepare(&mut conn, sql).await?;
            }
            COM_STMT_EXECUTE => {
                handle_stmt_execute(&mut conn, &store, data.to_vec()).await?;
            }
            COM_STMT_CLOSE => {
                // 无应答
                if data.len() >= 4 {
                    let stmt_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
                    conn.stmts.remove(&stmt_id);
                }
            }
            COM_PING => {
                conn.write_packet(&ok_packet(0)).await?;
            }
            COM_QUIT => return Ok(()),
            other => {
                debug!("ignoring mysql command 0x{:02x}", other);
            }
        }
    }
}

async fn handle_query(conn: &mut Connection, store: &Store, sql: String) -> Result<(), Error> {
    let key = db_key(Protocol::Mysql, &sql);

    if let Some(interaction) = store.lookup_configured(Protocol::Mysql, &key).await {
        info!("MYSQL PLAYBACK: {}", sql);
        match interaction.response {
            Some(ResponseSpec::Sql {
                rows,
                affected_rows,
            }) => {
                if rows.is_empty() {
                    conn.write_packet(&ok_packet(affected_rows)).await?;
                } else {
                    send_result_set(conn, &rows).await?;
                }
            }
            other => {
                warn!("mismatched response variant on mysql playback: {:?}", other);
                conn.write_packet(&ok_packet(0)).await?;
            }
        }
        return Ok(());
    }

    if !store.is_pending(Protocol::Mysql, &key).await {
        store
            .register(
                Protocol::Mysql,
                key,
                RequestSnapshot::Sql { query: sql.clone() },
            )
            .await;
        info!("MYSQL INTERCEPT: {} registered as pending", sql);
    }

    conn.write_packet(&ok_packet(0)).await
}

async fn handle_stmt_prepare(conn: &mut Connection, sql: String) -> Result<(), Error> {
    let stmt_id = conn.next_stmt_id;
    conn.next_stmt_id += 1;
    let num_params = sql.matches('?').count() as u16;
    conn.stmts.insert(stmt_id, sql);

    // COM_STMT_PREPARE_OK
    let mut p = BytesMut::new();
    p.put_u8(0x00); // OK
    p.put_u32_le(stmt_id);
    p.put_u16_le(0); // num_columns
    p.put_u16_le(num_params);
    p.put_u8(0); // reserved
    p.put_u16_le(0); // warning_count
    conn.write_packet(&p).await?;

    // 有参数时补发占位参数定义 + EOF
    if num_params > 0 {
        for _ in 0..num_params {
            let def = column_def("?");
            conn.write_packet(&def).await?;
        }
        conn.write_packet(&eof_packet()).await?;
    }
    Ok(())
}

async fn handle_stmt_execute(
    conn: &mut Connection,
    store: &Store,
    data: Vec<u8>,
) -> Result<(), Error> {
    // 截断的报文按坏帧处理：直接断开，不回 ERR，也不尝试重新同步
    if data.len() < 4 {
        return Err(Error::Wire("truncated COM_STMT_EXECUTE".to_string()));
    }
    let stmt_id = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let Some(sql) = conn.stmts.get(&stmt_id).cloned() else {
        let err = err_packet(&format!("unknown stmt_id {}", stmt_id));
        return conn.write_packet(&err).await;
    };
    info!("MYSQL STMT_EXECUTE stmt_id={} sql={}", stmt_id, sql);
    // 绑定参数忽略，按预处理时的 SQL 文本路由
    handle_query(conn, store, sql).await
}

/// 结果集：长度编码的列数、列定义、EOF、文本行、EOF
async fn send_result_set(
    conn: &mut Connection,
    rows: &[serde_json::Map<String, Value>],
) -> Result<(), Error> {
    let columns: Vec<String> = rows[0].keys().cloned().collect();

    let mut count = BytesMut::new();
    put_lenenc_int(&mut count, columns.len() as u64);
    conn.write_packet(&count).await?;

    for column in &columns {
        let def = column_def(column);
        conn.write_packet(&def).await?;
    }
    conn.write_packet(&eof_packet()).await?;

    for row in rows {
        let mut p = BytesMut::new();
        for column in &columns {
            match row.get(column).and_then(super::text_value) {
                Some(value) => put_lenenc_str(&mut p, &value),
                None => p.put_u8(0xfb), // NULL
            }
        }
        conn.write_packet(&p).await?;
    }
    conn.write_packet(&eof_packet()).await
}

/// v10 初始握手报文，服务端先行
fn handshake_packet() -> Vec<u8> {
    let mut p = BytesMut::new();
    p.put_u8(0x0a); // protocol version
    p.put_slice(b"8.0.0-veritaserum\0");
    p.put_u32_le(1); // connection id
    p.put_slice(&[0u8; 8]); // auth-plugin-data part 1
    p.put_u8(0); // filler
    // CLIENT_LONG_PASSWORD | CLIENT_PROTOCOL_41 | CLIENT_SECURE_CONNECTION
    p.put_u16_le(0x8201);
    p.put_u8(0x21); // charset: utf8
    p.put_u16_le(0x0002); // status flags
    p.put_u16_le(0x0000); // upper capability flags
    p.put_u8(21); // auth plugin data length
    p.put_slice(&[0u8; 10]); // reserved
    p.put_slice(&[0u8; 13]); // auth-plugin-data part 2
    p.put_slice(b"mysql_native_password\0");
    p.to_vec()
}

fn ok_packet(affected_rows: u64) -> Vec<u8> {
    let mut p = BytesMut::new();
    p.put_u8(0x00);
    put_lenenc_int(&mut p, affected_rows);
    put_lenenc_int(&mut p, 0); // last insert id
    p.put_u16_le(0x0002); // status flags: autocommit
    p.put_u16_le(0); // warnings
    p.to_vec()
}

fn eof_packet() -> Vec<u8> {
    vec![0xfe, 0x00, 0x00, 0x02, 0x00]
}

/// ERR 报文：错误码 1064，SQL 状态 42000
fn err_packet(message: &str) -> Vec<u8> {
    let mut p = BytesMut::new();
    p.put_u8(0xff);
    p.put_u16_le(1064);
    p.put_u8(b'#');
    p.put_slice(b"42000");
    p.put_slice(message.as_bytes());
    p.to_vec()
}

/// 列定义报文，所有列统一按 VAR_STRING 声明
fn column_def(name: &str) -> Vec<u8> {
    let mut p = BytesMut::new();
    put_lenenc_str(&mut p, "def"); // catalog
    put_lenenc_str(&mut p, ""); // schema
    put_lenenc_str(&mut p, ""); // table
    put_lenenc_str(&mut p, ""); // org_table
    put_lenenc_str(&mut p, name); // name
    put_lenenc_str(&mut p, name); // org_name
    p.put_u8(0x0c); // length of fixed fields
    p.put_u16_le(0x21); // charset: utf8
    p.put_u32_le(0); // column length
    p.put_u8(0xfd); // type: VAR_STRING
    p.put_u16_le(0); // flags
    p.put_u8(0x00); // decimals
    p.put_u16_le(0); // filler
    p.to_vec()
}

fn put_lenenc_int(buf: &mut BytesMut, n: u64) {
    match n {
        0..=250 => buf.put_u8(n as u8),
        251..=0xffff => {
            buf.put_u8(0xfc);
            buf.put_u16_le(n as u16);
        }
        0x1_0000..=0xff_ffff => {
            buf.put_u8(0xfd);
            buf.put_u8(n as u8);
            buf.put_u8((n >> 8) as u8);
            buf.put_u8((n >> 16) as u8);
        }
        _ => {
            buf.put_u8(0xfe);
            buf.put_u64_le(n);
        }
    }
}

fn put_lenenc_str(buf: &mut BytesMut, s: &str) {
    put_lenenc_int(buf, s.len() as u64);
    buf.put_slice(s.as_bytes());
}
