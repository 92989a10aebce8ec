//! HTTP 正向代理前端
//!
//! 客户端把 HTTP_PROXY 指向本端口，请求行必须是绝对形式。
//! 本前端只做终结，不向上游转发：已配置的键回放配置的响应，
//! 未配置的键注册为 pending 并返回 503。
//! 主机名中包含 `.dynamodb.` 时按 DynamoDB 协议捕获，额外解析
//! 操作名与表名。

use std::{collections::HashMap, net::SocketAddr, str::FromStr, sync::Arc};

use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::{
    errors::Error,
    model::{body_hash, http_key, Protocol, RequestSnapshot, ResponseSpec},
    options::Options,
    store::Store,
};

pub async fn start_server(options: Arc<Options>, store: Arc<Store>) -> Result<(), Error> {
    let addr = SocketAddr::from_str(&options.proxy.addr()).map_err(|e| Error::Config(e.to_string()))?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP proxy front-end listening on {}", addr);
    serve(listener, store).await
}

/// 在已绑定的监听器上运行接受循环，直到收到关闭信号
pub async fn serve(listener: TcpListener, store: Arc<Store>) -> Result<(), Error> {
    let mut shutdown = crate::shutdown_receiver();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => {
                info!("HTTP proxy front-end shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, _) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("proxy accept error: {}", e);
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let store = store.clone();
        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .serve_connection(
                    io,
                    service_fn(move |req| handle_request(req, store.clone())),
                )
                .await
            {
                error!("Error serving proxy connection: {:?}", err);
            }
        });
    }
}

/// 主机名形如 AWS DynamoDB 端点时返回 true，
/// 同时覆盖区域端点（dynamodb.us-east-1.amazonaws.com）
/// 与带账户前缀的形式（xxx.dynamodb.us-east-1.amazonaws.com）
fn is_dynamodb(host: &str) -> bool {
    host.contains(".dynamodb.") || host.starts_with("dynamodb.")
}

/// 从 X-Amz-Target 请求头解析操作名，取第一个 `.` 之后的部分
/// （例如 "DynamoDB_20120810.GetItem" -> "GetItem"）
fn parse_operation(target: &str) -> String {
    match target.split_once('.') {
        Some((_, op)) => op.to_string(),
        None => String::new(),
    }
}

/// 从请求体中按文本搜索提取顶层 TableName 字段的字符串值，
/// 不做完整 JSON 解析，找不到时返回空
fn parse_table_name(body: &str) -> String {
    let Some(i) = body.find("\"TableName\"") else {
        return String::new();
    };
    let rest = body[i + "\"TableName\"".len()..].trim_start();
    let Some(rest) = rest.strip_prefix(':') else {
        return String::new();
    };
    let rest = rest.trim_start();
    let Some(rest) = rest.strip_prefix('"') else {
        return String::new();
    };
    match rest.find('"') {
        Some(end) => rest[..end].to_string(),
        None => String::new(),
    }
}

/// 截取请求体中 Key 字段的对象文本，按括号深度配平，跳过字符串内部
fn parse_key_json(body: &str) -> String {
    let Some(i) = body.find("\"Key\"") else {
        return String::new();
    };
    let rest = body[i + "\"Key\"".len()..].trim_start();
    let Some(rest) = rest.strip_prefix(':') else {
        return String::new();
    };
    let rest = rest.trim_start();
    if !rest.starts_with('{') {
        return String::new();
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, c) in rest.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return rest[..=idx].to_string();
                }
            }
            _ => {}
        }
    }
    String::new()
}

fn text_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from(message.to_string())))
        .unwrap()
}

async fn handle_request(
    req: Request<Incoming>,
    store: Arc<Store>,
) -> Result<Response<Full<Bytes>>, Error> {
    // 代理请求行必须携带绝对 URI
    if req.uri().authority().is_none() {
        return Ok(text_response(
            StatusCode::BAD_REQUEST,
            "veritaserum: absolute-form proxy request required\n",
        ));
    }

    let method = req.method().as_str().to_string();
    let uri = req.uri().clone();
    let host = uri.authority().unwrap().to_string();
    let path = match uri.path() {
        "" => "/".to_string(),
        p => p.to_string(),
    };
    let amz_target = req
        .headers()
        .get("x-amz-target")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let headers: HashMap<String, String> = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();

    // 读取请求体失败按空请求体降级
    let raw_body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!("failed to read proxy request body: {}", e);
            Bytes::new()
        }
    };
    let hash = body_hash(&raw_body);
    let key = http_key(&method, &host, &path, &hash);

    let protocol = if is_dynamodb(&host) {
        Protocol::Dynamodb
    } else {
        Protocol::Http
    };

    if let Some(interaction) = store.lookup_configured(protocol, &key).await {
        info!("PLAYBACK  {} {}", method, uri);
        return Ok(playback(interaction.response).await);
    }

    if store.is_pending(protocol, &key).await {
        info!("PENDING   {} {}", method, uri);
        return Ok(text_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "veritaserum: capture pending configuration\n",
        ));
    }

    let body_text = String::from_utf8_lossy(&raw_body).to_string();
    let request = if protocol == Protocol::Dynamodb {
        RequestSnapshot::Dynamodb {
            method: method.clone(),
            host,
            path,
            headers,
            operation: parse_operation(&amz_target),
            table: parse_table_name(&body_text),
            key_json: parse_key_json(&body_text),
            body: body_text,
            body_hash: hash,
        }
    } else {
        RequestSnapshot::Http {
            method: method.clone(),
            host,
            path,
            headers,
            body: body_text,
            body_hash: hash,
        }
    };
    store.register(protocol, key, request).await;
    info!("INTERCEPT {} {} registered as pending", method, uri);
    Ok(text_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "veritaserum: request intercepted, configure the capture via the management API\n",
    ))
}

/// 回放已配置的响应；未指定 Content-Type 时默认 application/json
async fn playback(response: Option<ResponseSpec>) -> Response<Full<Bytes>> {
    match response {
        Some(ResponseSpec::Http {
            status_code,
            headers,
            body,
            latency_ms,
        }) => {
            if latency_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(latency_ms)).await;
            }
            let mut builder = Response::builder()
                .status(StatusCode::from_u16(status_code).unwrap_or(StatusCode::OK));
            let mut has_content_type = false;
            for (name, value) in &headers {
                if name.eq_ignore_ascii_case("content-type") {
                    has_content_type = true;
                }
                builder = builder.header(name, value);
            }
            if !has_content_type {
                builder = builder.header("Content-Type", "application/json");
            }
            builder
                .body(Full::new(Bytes::from(body)))
                .unwrap_or_else(|e| {
                    warn!("configured response is not serializable: {}", e);
                    text_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "veritaserum: invalid configured response\n",
                    )
                })
        }
        Some(ResponseSpec::Dynamodb { item_json }) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "application/x-amz-json-1.0")
            .body(Full::new(Bytes::from(item_json)))
            .unwrap(),
        other => {
            warn!("mismatched response variant on HTTP playback: {:?}", other);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "application/json")
                .body(Full::new(Bytes::new()))
                .unwrap()
        }
    }
}
