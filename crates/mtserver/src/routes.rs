//! HTTP routes. See [`mountaintools::protocol`] for the wire format.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cas::{Address, ContentStore, Sha1Hash};
use mountaintools::protocol::{
    HealthResponse, KvRecordResponse, KvWriteRequest, KvWriteResponse, BLOB_SIZE_HEADER,
};
use tracing::{debug, info};

use crate::error::ApiError;
use crate::state::ServerState;

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/kv/{collection}/{key_hash}",
            get(get_record).post(apply_op),
        )
        .route(
            "/blobs/{collection}/{hash}",
            get(get_blob).head(head_blob).put(put_blob),
        )
        .with_state(state)
}

/// Run store I/O off the async executor.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
}

fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn get_record(
    State(state): State<ServerState>,
    Path((collection, key_hash)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<KvRecordResponse>, ApiError> {
    state.check_read(bearer(&headers))?;
    let key_hash = Sha1Hash::from_str_checked(&key_hash)?;

    let kv = state.kv(&collection)?;
    let lookup = key_hash.clone();
    match blocking(move || Ok(kv.get_record_by_hash(&lookup)?)).await? {
        Some(record) => Ok(Json(KvRecordResponse { record })),
        None => Err(ApiError::not_found(format!("no record for {}", key_hash))),
    }
}

async fn apply_op(
    State(state): State<ServerState>,
    Path((collection, key_hash)): Path<(String, String)>,
    headers: HeaderMap,
    Json(request): Json<KvWriteRequest>,
) -> Result<Json<KvWriteResponse>, ApiError> {
    state.check_write(bearer(&headers))?;
    let key_hash = Sha1Hash::from_str_checked(&key_hash)?;
    if request.key.hash() != key_hash {
        return Err(ApiError::bad_request("key does not match key hash"));
    }

    let kv = state.kv(&collection)?;
    let applied =
        blocking(move || Ok(kv.apply_by_hash(&key_hash, &request.key, request.op)?)).await?;

    debug!(kv.collection = %collection, applied, "applied write");
    Ok(Json(KvWriteResponse { applied }))
}

async fn head_blob(
    State(state): State<ServerState>,
    Path((collection, hash)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.check_read(bearer(&headers))?;
    let hash = Sha1Hash::from_str_checked(&hash)?;

    let cas = state.cas(&collection)?;
    let lookup = hash.clone();
    let info = blocking(move || Ok(cas.find(&lookup)?))
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no blob {}", hash)))?;
    let size = info.size.to_string();
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_LENGTH, size.clone()),
            (header::HeaderName::from_static(BLOB_SIZE_HEADER), size),
        ],
    )
        .into_response())
}

async fn get_blob(
    State(state): State<ServerState>,
    Path((collection, hash)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    state.check_read(bearer(&headers))?;
    let hash = Sha1Hash::from_str_checked(&hash)?;

    let cas = state.cas(&collection)?;
    let data = blocking(move || Ok(cas.load(&Address::new(hash))?)).await?;
    Ok((
        [(header::CONTENT_TYPE, "application/octet-stream")],
        data,
    )
        .into_response())
}

/// Store an uploaded blob. The body must hash to the address in the path.
async fn put_blob(
    State(state): State<ServerState>,
    Path((collection, hash)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    state.check_write(bearer(&headers))?;
    let hash = Sha1Hash::from_str_checked(&hash)?;

    let cas = state.cas(&collection)?;
    let size = body.len();
    let stored = hash.clone();
    blocking(move || Ok(cas.save_verified(&body, &stored)?)).await?;
    info!(cas.collection = %collection, cas.hash = %hash, size, "stored blob");
    Ok(StatusCode::NO_CONTENT)
}
