use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, MatchedPath, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use robokache_auth::{HttpKeySetFetcher, IdentityVerifier, KeySetFetcher};
use robokache_contracts::opaque_id::{IdCodec, InvalidId};
use robokache_contracts::{Document, DocumentId, DocumentView, Principal};
use robokache_policy::{PolicyError, owned_flag};
use robokache_store::{BlobStore, DocumentRepository, FsBlobStore, SqliteRepository};
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{GatewayConfig, StartupError};
use crate::documents::{DocumentService, ServiceError};

mod data;
mod document;

pub const REQUEST_ID_HEADER: &str = "x-robokache-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<GatewayConfig>,
    verifier: IdentityVerifier,
    codec: IdCodec,
    documents: DocumentService,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

impl AppState {
    pub fn new(
        config: GatewayConfig,
        fetcher: Arc<dyn KeySetFetcher>,
        repo: Arc<dyn DocumentRepository>,
        blobs: Arc<dyn BlobStore>,
    ) -> Result<Self, StartupError> {
        let codec = IdCodec::new(&config.id_codec).map_err(|err| StartupError {
            code: err.code,
            message: err.message,
        })?;

        let verifier =
            IdentityVerifier::new(config.verifier.clone(), fetcher).map_err(|err| StartupError {
                code: err.code(),
                message: err.to_string(),
            })?;

        Ok(Self {
            config: Arc::new(config),
            verifier,
            codec,
            documents: DocumentService::new(repo, blobs),
        })
    }

    fn render(&self, principal: Option<&Principal>, document: &Document) -> DocumentView {
        let owned = principal.map(|p| owned_flag(Some(p), document));
        DocumentView::render(document, &self.codec, owned)
    }

    fn decode_id(&self, external: &str) -> Result<DocumentId, ApiError> {
        self.codec.decode(external).map_err(invalid_id)
    }
}

/// Builds the production state: SQLite repository, filesystem blobs, HTTP key fetcher.
pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    // Opening the blob store creates the data directory the default database lives in.
    let blobs = FsBlobStore::open(&config.data_dir)
        .await
        .map_err(|err| StartupError {
            code: "ERR_STORE_UNAVAILABLE",
            message: format!("failed to initialize blob store: {}", err),
        })?;

    let repo = SqliteRepository::connect_and_migrate(&config.db_url, config.store_timeout())
        .await
        .map_err(|err| StartupError {
            code: "ERR_STORE_UNAVAILABLE",
            message: format!("failed to initialize document store: {}", err),
        })?;

    let fetcher =
        HttpKeySetFetcher::new(config.verifier.keys_timeout).map_err(|err| StartupError {
            code: err.code(),
            message: err.to_string(),
        })?;

    let state = AppState::new(config, Arc::new(fetcher), Arc::new(repo), Arc::new(blobs))?;
    Ok(app(state))
}

pub fn app(state: AppState) -> Router {
    let max_blob_bytes = state.config.max_blob_bytes;

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route(
            "/api/document",
            get(document::list_documents).post(document::create_document),
        )
        .route(
            "/api/document/{id}",
            get(document::get_document)
                .put(document::update_document)
                .delete(document::delete_document),
        )
        .route(
            "/api/document/{id}/children",
            get(document::list_children).post(document::create_child),
        )
        .route(
            "/api/document/{id}/data",
            get(data::get_data).put(data::put_data),
        )
        .layer(DefaultBodyLimit::max(max_blob_bytes))
        .layer(middleware::from_fn(observe_request))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let store_ready = match state.documents.ping().await {
        Ok(()) => true,
        Err(err) => {
            tracing::warn!(error = %err, "robokache.store_not_ready");
            false
        }
    };
    checks.insert("store", store_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

/// Request span, latency metrics and request-id echo for every route.
async fn observe_request(request: Request, next: Next) -> Response {
    let started = Instant::now();
    let request_id = extract_request_id(request.headers());
    let method = request.method().as_str().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let span = tracing::info_span!(
        "http.request",
        request_id = %request_id,
        method = %method,
        route = %route,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );

    let mut response = next.run(request).instrument(span.clone()).await;

    let status = response.status();
    let latency_ms = started.elapsed().as_millis() as u64;
    span.record("status", status.as_u16());
    span.record("latency_ms", latency_ms);
    span.record(
        "outcome",
        if status.is_success() { "ok" } else { "error" },
    );
    span.in_scope(|| tracing::debug!("robokache.request_finished"));

    crate::metrics::observe_http_request(&route, &method, status.as_u16(), started.elapsed());

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// `None` for anonymous callers; a credential that is present but invalid is a 401.
async fn extract_principal(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<Principal>, ApiError> {
    state.verifier.resolve(headers).await.map_err(|err| {
        crate::metrics::inc_auth_failure(err.code());
        tracing::warn!(code = err.code(), reason = %err, "robokache.auth_rejected");
        json_error(StatusCode::UNAUTHORIZED, err.code(), err.to_string())
    })
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorResponse {
    code: String,
    message: String,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
        }),
    )
}

fn invalid_id(err: InvalidId) -> ApiError {
    json_error(StatusCode::BAD_REQUEST, InvalidId::CODE, err.to_string())
}

fn body_error(err: BytesRejection) -> ApiError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return json_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            "ERR_BODY_TOO_LARGE",
            "request body exceeds the configured limit",
        );
    }
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_INVALID_BODY",
        format!("failed to read request body: {}", err.body_text()),
    )
}

fn service_error(err: ServiceError) -> ApiError {
    match err {
        ServiceError::Policy(err) => policy_error(err),
        ServiceError::Store(err) => {
            tracing::error!(code = err.code(), error = %err, "robokache.store_failed");
            internal_error()
        }
    }
}

fn policy_error(err: PolicyError) -> ApiError {
    let (status, kind) = match &err {
        PolicyError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        PolicyError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized"),
        PolicyError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
        PolicyError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
    };
    crate::metrics::inc_policy_denial(kind);

    let message = match &err {
        PolicyError::BadRequest(message) => message.clone(),
        other => other.to_string(),
    };
    json_error(status, err.code(), message)
}

fn internal_error() -> ApiError {
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "ERR_INTERNAL",
        "Internal Server Error",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_ids_are_sanitized() {
        assert_eq!(
            sanitize_request_id("abc-123_x.y"),
            Some("abc-123_x.y".to_string())
        );
        assert_eq!(sanitize_request_id("a b<c>"), Some("abc".to_string()));
        assert_eq!(sanitize_request_id("<>"), None);
        assert_eq!(sanitize_request_id(&"z".repeat(200)).map(|s| s.len()), Some(64));
    }

    #[test]
    fn missing_request_id_gets_a_ulid() {
        let id = extract_request_id(&HeaderMap::new());
        assert!(id.parse::<Ulid>().is_ok());
    }

    #[test]
    fn policy_errors_map_to_statuses() {
        let cases = [
            (PolicyError::BadRequest("nope".to_string()), StatusCode::BAD_REQUEST),
            (PolicyError::Unauthorized, StatusCode::UNAUTHORIZED),
            (PolicyError::Forbidden, StatusCode::FORBIDDEN),
            (PolicyError::NotFound, StatusCode::NOT_FOUND),
        ];
        for (err, expected) in cases {
            let code = err.code();
            let (status, Json(body)) = policy_error(err);
            assert_eq!(status, expected);
            assert_eq!(body.code, code);
        }
    }

    #[test]
    fn store_errors_hide_details() {
        let (status, Json(body)) = service_error(ServiceError::Store(
            robokache_store::StoreError::Corrupt("row 7 is broken".to_string()),
        ));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.message, "Internal Server Error");
        assert!(!body.code.contains("CORRUPT"));
    }
}
