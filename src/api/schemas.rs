use bytes::Bytes;
use http::{Response, StatusCode};
use http_body_util::Full;
use hyper::{body::Incoming, Request};
use serde::Deserialize;

use crate::{errors::Error, model::Protocol, store::Store};

use super::{empty_response, json_response, read_json};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpsertSchemaRequest {
    pub protocol: Protocol,
    pub table_name: String,
    pub create_statement: String,
}

pub async fn handle_list(store: &Store) -> Result<Response<Full<Bytes>>, Error> {
    Ok(json_response(StatusCode::OK, &store.list_schemas().await))
}

pub async fn handle_upsert(
    req: Request<Incoming>,
    store: &Store,
) -> Result<Response<Full<Bytes>>, Error> {
    let body: UpsertSchemaRequest = read_json(req).await?;
    store
        .upsert_schema(body.protocol, body.table_name, body.create_statement)
        .await;
    Ok(empty_response(StatusCode::NO_CONTENT))
}
