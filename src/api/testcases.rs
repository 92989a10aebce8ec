use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, Request};
use serde::Deserialize;

use crate::{errors::Error, store::Store};

use super::{empty_response, json_response, read_json};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTestCaseRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTestCaseRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    // Some 时重建捕获记录的归属
    #[serde(default)]
    pub interaction_ids: Option<Vec<String>>,
}

pub async fn handle_list(store: &Store) -> Result<Response<Full<Bytes>>, Error> {
    Ok(json_response(StatusCode::OK, &store.list_test_cases().await))
}

pub async fn handle_create(
    req: Request<Incoming>,
    store: &Store,
) -> Result<Response<Full<Bytes>>, Error> {
    let body: CreateTestCaseRequest = read_json(req).await?;
    let test_case = store.create_test_case(body.name, body.description).await;
    Ok(json_response(StatusCode::CREATED, &test_case))
}

pub async fn handle_get(id: &str, store: &Store) -> Result<Response<Full<Bytes>>, Error> {
    match store.get_test_case(id).await {
        Some(test_case) => Ok(json_response(StatusCode::OK, &test_case)),
        None => Err(Error::NotFound(format!("test case {} not found", id))),
    }
}

pub async fn handle_update(
    req: Request<Incoming>,
    id: &str,
    store: &Store,
) -> Result<Response<Full<Bytes>>, Error> {
    let body: UpdateTestCaseRequest = read_json(req).await?;
    let test_case = store
        .update_test_case(id, body.name, body.description, body.interaction_ids)
        .await?;
    Ok(json_response(StatusCode::OK, &test_case))
}

pub async fn handle_delete(id: &str, store: &Store) -> Result<Response<Full<Bytes>>, Error> {
    store.delete_test_case(id).await?;
    Ok(empty_response(StatusCode::NO_CONTENT))
}
