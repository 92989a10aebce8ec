use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;

use crate::{errors::Error, store::Store};

use super::json_response;

/// 处理健康检查请求
pub async fn handle_health(store: &Store) -> Result<Response<Full<Bytes>>, Error> {
    let interactions = store.list_all().await;
    let pending = interactions
        .iter()
        .filter(|i| i.state == crate::model::InteractionState::Pending)
        .count();
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({
            "status": "ok",
            "interactions": interactions.len(),
            "pending": pending,
        }),
    ))
}
