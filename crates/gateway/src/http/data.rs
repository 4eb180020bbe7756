use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use super::{ApiError, AppState, body_error, extract_principal, service_error};

pub(super) async fn get_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let principal = extract_principal(&state, &headers).await?;
    let id = state.decode_id(&id)?;

    let data = state
        .documents
        .read_data(principal.as_ref(), id)
        .await
        .map_err(service_error)?;

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    Ok((response_headers, data).into_response())
}

pub(super) async fn put_data(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<StatusCode, ApiError> {
    let principal = extract_principal(&state, &headers).await?;
    let id = state.decode_id(&id)?;
    let data = body.map_err(body_error)?;

    state
        .documents
        .write_data(principal.as_ref(), id, data)
        .await
        .map_err(service_error)?;

    Ok(StatusCode::OK)
}
