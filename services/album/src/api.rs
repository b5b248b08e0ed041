use crate::config::{ApiConfig, Config};
use crate::issuer::{UploadTargetIssuer, STORE_PATH};
use crate::store::{MemoryStore, StoreError, UploadStore, UploadSummary};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, QueryRejection},
        DefaultBodyLimit, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument, warn};

/// Route that mints upload targets
pub const ISSUE_PATH: &str = "/issue";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub issuer: Arc<UploadTargetIssuer>,
    pub store: Arc<dyn UploadStore>,
    pub max_payload_bytes: usize,
    pub default_content_type: String,
}

impl AppState {
    /// Wire a fresh in-memory store and an issuer from configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            issuer: Arc::new(UploadTargetIssuer::new(&config.uploads)),
            store: Arc::new(MemoryStore::new(config.uploads.max_payload_bytes)),
            max_payload_bytes: config.uploads.max_payload_bytes,
            default_content_type: config.uploads.default_content_type.clone(),
        }
    }
}

/// Issued upload target
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueResponse {
    /// Where the client should PUT the payload
    pub url: String,
    /// Storage key the payload will live under
    pub key: String,
    /// Always true until a real object store backs the service
    pub is_mock: bool,
}

/// Accepted upload
#[derive(Debug, Serialize, Deserialize)]
pub struct PutResponse {
    pub success: bool,
    pub key: String,
    pub message: String,
}

/// Listing entry
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadEntry {
    pub key: String,
    /// Epoch milliseconds
    pub received_at: i64,
    /// RFC 3339 rendering of `received_at`
    pub date: String,
    #[serde(rename = "approxSizeKB")]
    pub approx_size_kb: u64,
}

impl From<UploadSummary> for UploadEntry {
    fn from(s: UploadSummary) -> Self {
        Self {
            key: s.key.into_inner(),
            received_at: s.received_at.timestamp_millis(),
            date: s.received_at.to_rfc3339(),
            approx_size_kb: s.approx_size_kb,
        }
    }
}

/// Upload list response
#[derive(Debug, Serialize, Deserialize)]
pub struct ListResponse {
    pub uploads: Vec<UploadEntry>,
    pub total: usize,
    pub message: String,
}

/// Query carrying a storage key
#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    /// `filename` is what older clients send
    #[serde(alias = "filename")]
    pub key: Option<String>,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: &str, code: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

/// Map a store failure onto the wire, `fallback` naming the failed operation
fn store_error(e: StoreError, fallback: &str) -> ApiError {
    match e {
        StoreError::MissingKey => {
            metrics::counter!("album_upload_rejections_total", "reason" => "missing_key")
                .increment(1);
            warn!("Request without storage key");
            api_error(StatusCode::BAD_REQUEST, "Storage key is required", "MISSING_KEY")
        }
        StoreError::PayloadTooLarge { size, limit } => {
            metrics::counter!("album_upload_rejections_total", "reason" => "too_large")
                .increment(1);
            warn!(size, limit, "Upload exceeds payload limit");
            api_error(
                StatusCode::PAYLOAD_TOO_LARGE,
                &format!("Upload of {size} bytes exceeds the {limit} byte limit"),
                "PAYLOAD_TOO_LARGE",
            )
        }
        StoreError::InternalFailure(reason) => {
            error!(error = %reason, "Store failure");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, fallback, "STORE_ERROR")
        }
    }
}

/// Map an unreadable request body onto the wire
fn body_error(rejection: BytesRejection, limit: usize) -> ApiError {
    if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
        metrics::counter!("album_upload_rejections_total", "reason" => "too_large").increment(1);
        warn!(limit, "Upload body exceeds payload limit");
        return api_error(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!("Upload exceeds the {limit} byte limit"),
            "PAYLOAD_TOO_LARGE",
        );
    }

    warn!(error = %rejection.body_text(), "Unreadable upload body");
    api_error(rejection.status(), &rejection.body_text(), "INVALID_BODY")
}

/// Map a malformed key query onto the wire
fn query_error(rejection: QueryRejection) -> ApiError {
    metrics::counter!("album_upload_rejections_total", "reason" => "bad_query").increment(1);
    warn!(error = %rejection.body_text(), "Malformed key query");
    api_error(
        StatusCode::BAD_REQUEST,
        "Exactly one storage key is required",
        "MISSING_KEY",
    )
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = DefaultBodyLimit::max(state.max_payload_bytes);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(ISSUE_PATH, get(issue_target))
        .route(STORE_PATH, get(list_uploads).put(put_upload))
        .route("/store/item", get(get_upload))
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "album-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let items = state.store.len().await;
    Json(serde_json::json!({
        "status": "ready",
        "store": "memory",
        "items": items
    }))
}

/// Mint a new upload target
#[instrument(skip(state))]
async fn issue_target(State(state): State<AppState>) -> Result<Json<IssueResponse>, ApiError> {
    let target = state.issuer.issue().map_err(|e| {
        error!(error = %e, "Failed to issue upload target");
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to generate upload URL",
            "ISSUE_ERROR",
        )
    })?;

    Ok(Json(IssueResponse {
        url: target.target_url,
        key: target.key.into_inner(),
        is_mock: true,
    }))
}

/// Accept the raw payload for a key
#[instrument(skip(state, query, headers, body))]
async fn put_upload(
    State(state): State<AppState>,
    query: Result<Query<KeyQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<PutResponse>, ApiError> {
    let Query(params) = query.map_err(query_error)?;
    let body = body.map_err(|e| body_error(e, state.max_payload_bytes))?;
    let key = params.key.unwrap_or_default();
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(&state.default_content_type);

    let ack = state
        .store
        .put(&key, content_type, body)
        .await
        .map_err(|e| store_error(e, "Failed to upload photo"))?;

    Ok(Json(PutResponse {
        success: ack.success,
        key: ack.key.into_inner(),
        message: "Photo uploaded successfully (mock mode)".to_string(),
    }))
}

/// List every retained upload, oldest first
#[instrument(skip(state))]
async fn list_uploads(State(state): State<AppState>) -> Result<Json<ListResponse>, ApiError> {
    let uploads: Vec<UploadEntry> = state
        .store
        .list()
        .await
        .map_err(|e| store_error(e, "Failed to retrieve uploads"))?
        .into_iter()
        .map(UploadEntry::from)
        .collect();

    Ok(Json(ListResponse {
        total: uploads.len(),
        uploads,
        message: "Uploads retrieved successfully".to_string(),
    }))
}

/// Return the original bytes of one upload
#[instrument(skip(state, query))]
async fn get_upload(
    State(state): State<AppState>,
    query: Result<Query<KeyQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(params) = query.map_err(query_error)?;
    let key = params.key.unwrap_or_default();

    let object = state
        .store
        .get(&key)
        .await
        .map_err(|e| store_error(e, "Failed to retrieve upload"))?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Upload not found", "NOT_FOUND"))?;

    Ok(([(header::CONTENT_TYPE, object.content_type)], object.data).into_response())
}

/// Start the upload API server, serving until `shutdown` resolves
pub async fn start_api_server<F>(state: AppState, config: &ApiConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting upload API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_key::StorageKey;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_upload_entry_from_summary() {
        let summary = UploadSummary {
            key: StorageKey::parse("wedding-uploads/1-abc.jpg").unwrap(),
            received_at: Utc.with_ymd_and_hms(2026, 6, 20, 18, 30, 0).unwrap(),
            approx_size_kb: 16,
        };

        let entry: UploadEntry = summary.into();
        assert_eq!(entry.key, "wedding-uploads/1-abc.jpg");
        assert_eq!(entry.received_at, 1_781_980_200_000);
        assert_eq!(entry.date, "2026-06-20T18:30:00+00:00");

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["approxSizeKB"], 16);
        assert_eq!(json["receivedAt"], 1_781_980_200_000i64);
    }

    #[test]
    fn test_issue_response_wire_names() {
        let json = serde_json::to_value(IssueResponse {
            url: "/store?key=a".to_string(),
            key: "a".to_string(),
            is_mock: true,
        })
        .unwrap();
        assert_eq!(json["isMock"], true);
        assert_eq!(json["url"], "/store?key=a");
    }

    #[test]
    fn test_store_error_status_codes() {
        assert_eq!(store_error(StoreError::MissingKey, "x").0, StatusCode::BAD_REQUEST);
        assert_eq!(
            store_error(StoreError::PayloadTooLarge { size: 2, limit: 1 }, "x").0,
            StatusCode::PAYLOAD_TOO_LARGE
        );

        let (status, Json(body)) = store_error(StoreError::InternalFailure("boom".into()), "Failed");
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body.error, "Failed");
        assert_eq!(body.code, "STORE_ERROR");
    }
}
