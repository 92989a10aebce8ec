use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, Request};
use tracing::info;

use crate::{
    errors::Error,
    store::{Store, SuiteFile},
};

use super::{empty_response, json_response, read_json};

/// 批量导入套件：只装载 state == configured 的记录
pub async fn handle_import(
    req: Request<Incoming>,
    store: &Store,
) -> Result<Response<Full<Bytes>>, Error> {
    let suite: SuiteFile = read_json(req).await?;
    let test_case = suite.test_case.clone();
    let loaded = store.import_suite(suite).await;
    info!("IMPORT {} interactions (test case: {})", loaded, test_case);
    Ok(json_response(
        StatusCode::OK,
        &serde_json::json!({ "loaded": loaded }),
    ))
}

/// 把存储落盘到状态文件
pub async fn handle_save(store: &Store) -> Result<Response<Full<Bytes>>, Error> {
    store.save_state().await?;
    Ok(empty_response(StatusCode::NO_CONTENT))
}
