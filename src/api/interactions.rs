use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, Request};
use serde::Deserialize;
use tracing::info;

use crate::{errors::Error, model::ResponseSpec, store::Store};

use super::{json_response, read_json};

/// 配置请求体：响应按协议打标签，`name` 可省略
#[derive(Debug, Deserialize)]
pub struct ConfigureRequest {
    #[serde(default)]
    pub name: String,
    pub response: ResponseSpec,
}

pub async fn handle_list(store: &Store) -> Result<Response<Full<Bytes>>, Error> {
    let interactions = store.list_all().await;
    Ok(json_response(StatusCode::OK, &interactions))
}

pub async fn handle_pending(store: &Store) -> Result<Response<Full<Bytes>>, Error> {
    let interactions = store.list_pending().await;
    Ok(json_response(StatusCode::OK, &interactions))
}

pub async fn handle_configure(
    req: Request<Incoming>,
    id: &str,
    store: &Store,
) -> Result<Response<Full<Bytes>>, Error> {
    let body: ConfigureRequest = read_json(req).await?;
    let interaction = store.configure(id, body.name, body.response).await?;
    info!("CONFIGURED {} ({})", interaction.key, interaction.id);
    Ok(json_response(StatusCode::OK, &interaction))
}
