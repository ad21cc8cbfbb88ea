//! HTTP handlers for uploads, signed-URL downloads and the store-side
//! object endpoint those URLs point at. Bodies stream in both directions.

use crate::{
    errors::AppError,
    models::object::StoredObject,
    services::{
        gateway::GatewayService,
        signing::{SignatureParams, SignedMethod},
    },
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method, StatusCode, header},
    response::{Redirect, Response},
};
use futures::StreamExt;
use serde::Serialize;
use std::io;
use tokio_util::io::ReaderStream;

/// Header carrying the caller's filename, used as the key suffix.
pub const FILENAME_HEADER: &str = "x-gaefile-filename";

#[derive(Debug, Serialize)]
pub struct CreateFileResponse {
    pub key: String,
}

/// `PUT /` — store the body under a generated key.
pub async fn upload_file(
    State(gateway): State<GatewayService>,
    headers: HeaderMap,
    body: Body,
) -> Result<Json<CreateFileResponse>, AppError> {
    let filename = headers
        .get(FILENAME_HEADER)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok());

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other));

    let receipt = gateway.upload(&filename, content_type, stream).await?;
    let resp = CreateFileResponse {
        key: receipt.key.into_string(),
    };
    tracing::info!("createFileResponse = {:?}", resp);
    Ok(Json(resp))
}

/// `GET /{key}` — redirect to a short-lived signed URL.
pub async fn download_file(
    State(gateway): State<GatewayService>,
    Path(key): Path<String>,
) -> Result<Redirect, AppError> {
    let signed = gateway.download(&key).await?;
    tracing::debug!(expires_at = %signed.expires_at, "issued signed url");
    Ok(Redirect::temporary(signed.url.as_str()))
}

/// `GET /storage/{bucket}/{key}` — serve an object to a signed URL holder.
pub async fn get_signed_object(
    State(gateway): State<GatewayService>,
    method: Method,
    Path((bucket, key)): Path<(String, String)>,
    Query(params): Query<SignatureParams>,
) -> Result<Response, AppError> {
    let method = SignedMethod::try_from(&method)
        .map_err(|_| AppError::new(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"))?;
    let (meta, file) = gateway
        .open_for_read(method, &bucket, &key, &params)
        .await?;

    let body = Body::from_stream(ReaderStream::new(file));
    let mut response = Response::new(body);
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);

    Ok(response)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &StoredObject) {
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&meta.content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(meta.size_bytes.max(0) as u64),
    );

    let quoted = format!("\"{}\"", meta.etag);
    if let Ok(value) = HeaderValue::from_str(&quoted) {
        headers.insert(header::ETAG, value);
    }

    if let Ok(value) = HeaderValue::from_str(&meta.created_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }
}
