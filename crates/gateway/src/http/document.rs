use axum::Json;
use axum::body::Bytes;
use axum::extract::rejection::{BytesRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use robokache_contracts::{CreatedDocument, DocumentRequest, DocumentView, ParentFilter};
use serde::Deserialize;

use super::{ApiError, AppState, body_error, extract_principal, json_error, service_error};
use crate::documents::DocumentChanges;

#[derive(Debug, Default, Deserialize)]
pub(super) struct ListQuery {
    #[serde(default, alias = "hasParent")]
    has_parent: Option<bool>,
}

pub(super) async fn list_documents(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<Vec<DocumentView>>, ApiError> {
    let Query(query) = query.map_err(|err| {
        json_error(
            StatusCode::BAD_REQUEST,
            "ERR_INVALID_QUERY",
            format!("invalid query: {}", err.body_text()),
        )
    })?;
    let principal = extract_principal(&state, &headers).await?;

    let documents = state
        .documents
        .list(
            principal.as_ref(),
            ParentFilter::from_has_parent(query.has_parent),
        )
        .await
        .map_err(service_error)?;

    Ok(Json(
        documents
            .iter()
            .map(|doc| state.render(principal.as_ref(), doc))
            .collect(),
    ))
}

pub(super) async fn create_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<CreatedDocument>), ApiError> {
    let principal = extract_principal(&state, &headers).await?;
    let changes = parse_changes(&state, body)?;

    let id = state
        .documents
        .create(principal.as_ref(), changes)
        .await
        .map_err(service_error)?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedDocument {
            id: state.codec.encode(id),
        }),
    ))
}

pub(super) async fn get_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DocumentView>, ApiError> {
    let principal = extract_principal(&state, &headers).await?;
    let id = state.decode_id(&id)?;

    let document = state
        .documents
        .get(principal.as_ref(), id)
        .await
        .map_err(service_error)?;

    Ok(Json(state.render(principal.as_ref(), &document)))
}

pub(super) async fn update_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<DocumentView>, ApiError> {
    let principal = extract_principal(&state, &headers).await?;
    let id = state.decode_id(&id)?;
    let changes = parse_changes(&state, body)?;

    let document = state
        .documents
        .update(principal.as_ref(), id, changes)
        .await
        .map_err(service_error)?;

    Ok(Json(state.render(principal.as_ref(), &document)))
}

pub(super) async fn delete_document(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let principal = extract_principal(&state, &headers).await?;
    let id = state.decode_id(&id)?;

    state
        .documents
        .delete(principal.as_ref(), id)
        .await
        .map_err(service_error)?;

    Ok(StatusCode::OK)
}

pub(super) async fn list_children(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<Vec<DocumentView>>, ApiError> {
    let principal = extract_principal(&state, &headers).await?;
    let id = state.decode_id(&id)?;

    let children = state
        .documents
        .children(principal.as_ref(), id)
        .await
        .map_err(service_error)?;

    Ok(Json(
        children
            .iter()
            .map(|doc| state.render(principal.as_ref(), doc))
            .collect(),
    ))
}

/// The request body is the new child's payload, not document fields.
pub(super) async fn create_child(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Result<Bytes, BytesRejection>,
) -> Result<(StatusCode, Json<CreatedDocument>), ApiError> {
    let principal = extract_principal(&state, &headers).await?;
    let parent = state.decode_id(&id)?;
    let data = body.map_err(body_error)?;

    let id = state
        .documents
        .create_child_with_data(principal.as_ref(), parent, data)
        .await
        .map_err(service_error)?;

    Ok((
        StatusCode::CREATED,
        Json(CreatedDocument {
            id: state.codec.encode(id),
        }),
    ))
}

fn parse_changes(
    state: &AppState,
    body: Result<Bytes, BytesRejection>,
) -> Result<DocumentChanges, ApiError> {
    let body = body.map_err(body_error)?;

    let request = if body.iter().all(u8::is_ascii_whitespace) {
        DocumentRequest::default()
    } else {
        serde_json::from_slice::<DocumentRequest>(&body).map_err(|err| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_BODY",
                format!("invalid JSON body: {}", err),
            )
        })?
    };

    let parent = request
        .parent
        .as_deref()
        .map(|external| state.decode_id(external))
        .transpose()?;

    Ok(DocumentChanges {
        parent,
        visibility: request.visibility,
        metadata: request.metadata,
    })
}
