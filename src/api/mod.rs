//! 管理接口 - 捕获记录的查看、配置与持久化
//!
//! 协议前端只负责捕获与回放；把 pending 记录变成 configured 的唯一
//! 入口是这里的 REST 接口。路由一律返回 JSON。

pub mod health;
pub mod interactions;
pub mod schemas;
pub mod suite;
pub mod testcases;

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use bytes::Bytes;
use http::{Method, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, server::conn::http1, service::service_fn, Request};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::{errors::Error, options::Options, store::Store};

pub async fn start_server(options: Arc<Options>, store: Arc<Store>) -> Result<(), Error> {
    let addr =
        SocketAddr::from_str(&options.api.addr()).map_err(|e| Error::Config(e.to_string()))?;
    let listener = TcpListener::bind(addr).await?;
    info!("management API listening on {}", addr);
    serve(listener, store).await
}

/// 在已绑定的监听器上运行接受循环，直到收到关闭信号
pub async fn serve(listener: TcpListener, store: Arc<Store>) -> Result<(), Error> {
    let mut shutdown = crate::shutdown_receiver();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.recv() => {
                info!("management API shutting down");
                return Ok(());
            }
            accepted = listener.accept() => accepted,
        };
        let (stream, _) = match accepted {
            Ok(pair) => pair,
            Err(e) => {
                error!("api accept error: {}", e);
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let store = store.clone();
        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| dispatch(req, store.clone())))
                .await
            {
                error!("Error serving api connection: {:?}", err);
            }
        });
    }
}

/// 路由分发；处理器的错误在这里统一映射为 JSON 错误应答
async fn dispatch(
    req: Request<Incoming>,
    store: Arc<Store>,
) -> Result<Response<Full<Bytes>>, Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let result = route(req, &method, &path, store).await;
    Ok(match result {
        Ok(response) => response,
        Err(Error::NotFound(message)) => error_response(StatusCode::NOT_FOUND, &message),
        Err(Error::Json(e)) => error_response(StatusCode::BAD_REQUEST, &e.to_string()),
        Err(Error::Suite(message)) => error_response(StatusCode::BAD_REQUEST, &message),
        Err(e) => {
            error!("api error on {} {}: {}", method, path, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    })
}

async fn route(
    req: Request<Incoming>,
    method: &Method,
    path: &str,
    store: Arc<Store>,
) -> Result<Response<Full<Bytes>>, Error> {
    match (method, path) {
        (&Method::GET, "/health") => health::handle_health(&store).await,
        (&Method::GET, "/api/interactions") => interactions::handle_list(&store).await,
        (&Method::GET, "/api/interactions/pending") => {
            interactions::handle_pending(&store).await
        }
        (&Method::POST, "/api/import") => suite::handle_import(req, &store).await,
        (&Method::POST, "/api/state/save") => suite::handle_save(&store).await,
        (&Method::GET, "/api/testcases") => testcases::handle_list(&store).await,
        (&Method::POST, "/api/testcases") => testcases::handle_create(req, &store).await,
        (&Method::GET, "/api/schemas") => schemas::handle_list(&store).await,
        (&Method::PUT, "/api/schemas") => schemas::handle_upsert(req, &store).await,
        (&Method::POST, _) => {
            // POST /api/interactions/{id}/configure
            if let Some(id) = path
                .strip_prefix("/api/interactions/")
                .and_then(|rest| rest.strip_suffix("/configure"))
            {
                let id = id.to_string();
                return interactions::handle_configure(req, &id, &store).await;
            }
            Err(Error::NotFound(format!("no route for POST {}", path)))
        }
        (_, _) => {
            // /api/testcases/{id} 的查看、更新与删除
            if let Some(id) = path.strip_prefix("/api/testcases/") {
                if !id.is_empty() && !id.contains('/') {
                    let id = id.to_string();
                    return match method {
                        &Method::GET => testcases::handle_get(&id, &store).await,
                        &Method::PUT => testcases::handle_update(req, &id, &store).await,
                        &Method::DELETE => testcases::handle_delete(&id, &store).await,
                        _ => Err(Error::NotFound(format!("no route for {} {}", method, path))),
                    };
                }
            }
            Err(Error::NotFound(format!("no route for {} {}", method, path)))
        }
    }
}

pub(crate) fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}

pub(crate) fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(status, &serde_json::json!({ "error": message }))
}

pub(crate) fn empty_response(status: StatusCode) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

/// 读取请求体并反序列化为 JSON
pub(crate) async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T, Error> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| Error::Proxy(format!("failed to read request body: {}", e)))?
        .to_bytes();
    Ok(serde_json::from_slice(&body)?)
}
