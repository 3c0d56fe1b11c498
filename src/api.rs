//! Audit HTTP API
//!
//! Read-only views over the chain plus on-demand verification.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::audit::entry::{AuditEntry, Level};
use crate::audit::{AuditChain, AuditStats, VerificationResult};
use crate::error::AuditError;
use crate::storage::{Pagination, QueryFilter, QueryResult, SequenceRange, SortOrder};

/// Create the audit router
pub fn router(chain: Arc<AuditChain>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/audit", get(query_entries))
        .route("/audit/search", get(search_entries))
        .route("/audit/stats", get(get_stats))
        .route("/audit/verify", post(verify_chain))
        .route("/audit/:id", get(get_entry))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(chain)
}

/// Error body `{ "error": ... }` with a status derived from the failure
pub struct ApiError(StatusCode, String);

impl From<AuditError> for ApiError {
    fn from(err: AuditError) -> Self {
        let status = match &err {
            AuditError::NotInitialized | AuditError::ChainFaulted(_) => StatusCode::CONFLICT,
            AuditError::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AuditError::InvalidSigningKey(_) => StatusCode::BAD_REQUEST,
            AuditError::Serialization(_) | AuditError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            error!("Audit API request failed: {}", err);
        }
        ApiError(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(StatusCode::BAD_REQUEST, message.into())
}

fn parse_param<T: std::str::FromStr>(
    params: &HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, ApiError> {
    params
        .get(name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|_| bad_request(format!("invalid value for {}: {}", name, raw)))
        })
        .transpose()
}

fn parse_list(params: &HashMap<String, String>, name: &str) -> Vec<String> {
    params
        .get(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn parse_page(params: &HashMap<String, String>) -> Result<Pagination, ApiError> {
    Ok(Pagination::new(
        parse_param(params, "limit")?,
        parse_param(params, "offset")?,
    ))
}

/// Health check endpoint
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "audit-chain",
        "timestamp": chrono::Utc::now()
    }))
}

/// Filtered, paginated listing
pub async fn query_entries(
    State(chain): State<Arc<AuditChain>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<QueryResult>, ApiError> {
    let levels = parse_list(&params, "level")
        .iter()
        .map(|l| l.parse::<Level>().map_err(bad_request))
        .collect::<Result<Vec<_>, _>>()?;
    let order = match params.get("order").map(String::as_str) {
        None | Some("desc") => SortOrder::Desc,
        Some("asc") => SortOrder::Asc,
        Some(other) => return Err(bad_request(format!("invalid order: {}", other))),
    };

    let filter = QueryFilter {
        from: parse_param(&params, "from")?,
        to: parse_param(&params, "to")?,
        levels,
        events: parse_list(&params, "event"),
        user_id: params.get("userId").cloned(),
        task_id: params.get("taskId").cloned(),
        correlation_id: params.get("correlationId").cloned(),
    };

    Ok(Json(chain.query(&filter, parse_page(&params)?, order).await?))
}

/// Relevance-ranked full-text search
pub async fn search_entries(
    State(chain): State<Arc<AuditChain>>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<QueryResult>, ApiError> {
    let text = params
        .get("q")
        .filter(|q| !q.trim().is_empty())
        .ok_or_else(|| bad_request("missing query parameter q"))?;
    Ok(Json(chain.search_full_text(text, parse_page(&params)?).await?))
}

pub async fn get_stats(State(chain): State<Arc<AuditChain>>) -> Result<Json<AuditStats>, ApiError> {
    Ok(Json(chain.get_stats().await?))
}

pub async fn get_entry(
    Path(id): Path<String>,
    State(chain): State<Arc<AuditChain>>,
) -> Result<Json<AuditEntry>, ApiError> {
    match chain.get_by_id(&id).await? {
        Some(entry) => Ok(Json(entry)),
        None => Err(ApiError(
            StatusCode::NOT_FOUND,
            format!("audit entry {} not found", id),
        )),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VerifyRequest {
    pub from: Option<u64>,
    pub to: Option<u64>,
}

/// Verify the chain, or the `{from, to}` sequence range when given.
/// Findings are data: a tampered chain is still a 200.
///
/// An empty body means the whole chain; a body that is not a valid range
/// request is a 400 rather than a silent full verification.
pub async fn verify_chain(
    State(chain): State<Arc<AuditChain>>,
    body: Bytes,
) -> Result<Json<VerificationResult>, ApiError> {
    let request = if body.iter().all(u8::is_ascii_whitespace) {
        VerifyRequest::default()
    } else {
        serde_json::from_slice::<VerifyRequest>(&body)
            .map_err(|e| bad_request(format!("invalid verify request: {}", e)))?
    };
    let result = chain
        .verify_range(SequenceRange {
            from: request.from,
            to: request.to,
        })
        .await?;
    Ok(Json(result))
}
