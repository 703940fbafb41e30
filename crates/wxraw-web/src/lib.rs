//! Axum routers for the HTTP service and the function-trigger shapes.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use tokio::net::TcpListener;
use tracing::{info, warn};
use wxraw_core::{default_date, IngestError, Provenance, DATE_FORMAT};
use wxraw_ingest::forward::{FETCHED_AT_HEADER, SOURCE_URL_HEADER};
use wxraw_ingest::{RunParams, Services};
use wxraw_source::now_timestamp;

pub const CRATE_NAME: &str = "wxraw-web";
pub const SERVICE_NAME: &str = "wxraw";

#[derive(Clone)]
pub struct AppState {
    pub services: Arc<Services>,
}

impl AppState {
    pub fn new(services: Services) -> Self {
        Self {
            services: Arc::new(services),
        }
    }
}

/// Error body for the service routes: `{status, error, kind}` with the mapped status.
#[derive(Debug)]
pub struct ApiError(IngestError);

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        warn!(error = %self.0, kind = self.0.kind(), %status, "request failed");
        (
            status,
            Json(json!({
                "status": "error",
                "error": self.0.to_string(),
                "kind": self.0.kind(),
            })),
        )
            .into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/weather", get(weather_handler))
        .route("/run", post(run_handler))
        .route("/ingest", post(ingest_handler))
        .route("/write", post(write_handler))
        .with_state(Arc::new(state))
}

/// Single-endpoint router for function-style hosting.
pub fn function_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(function_handler).post(function_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(router: Router, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn index_handler() -> Json<JsonValue> {
    Json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<JsonValue> {
    let config = &state.services.config;
    Json(json!({
        "status": "ok",
        "has_api_key": state.services.source.has_credential(),
        "location_default": config.defaults.location,
        "date_default": config
            .defaults
            .date
            .unwrap_or_else(|| default_date(Utc::now()))
            .format(DATE_FORMAT)
            .to_string(),
        "sink": config.sink.backend.as_str(),
        "bq_project": config.sink.target.project,
        "bq_dataset": config.sink.target.dataset,
        "bq_table": config.sink.target.table,
        "writer_configured": state.services.forward.is_some(),
    }))
}

async fn weather_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
) -> Result<Json<JsonValue>, ApiError> {
    let (_request, payload) = state.services.direct.fetch_only(&params).await?;
    Ok(Json(payload))
}

async fn run_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
) -> Result<Json<JsonValue>, ApiError> {
    let report = state.services.direct.run(&params).await?;
    Ok(Json(report.to_json("ok")))
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RunParams>,
) -> Result<Json<JsonValue>, ApiError> {
    let pipeline = state.services.forward.as_ref().ok_or_else(|| {
        IngestError::ConfigurationMissing("WRITER_URL is not configured".into())
    })?;
    let report = pipeline.run(&params).await?;
    Ok(Json(report.to_json("sent")))
}

async fn write_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<JsonValue>, ApiError> {
    let payload: JsonValue = serde_json::from_slice(&body)
        .map_err(|err| IngestError::InvalidRequest(format!("body is not valid JSON: {err}")))?;
    if !payload.is_object() {
        return Err(IngestError::InvalidRequest("body must be a JSON object".into()).into());
    }

    let provenance = write_provenance(
        header_str(&headers, SOURCE_URL_HEADER),
        &payload,
        state.services.config.default_source_url.as_deref(),
    );
    let fetched_at = match header_str(&headers, FETCHED_AT_HEADER) {
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|err| {
                IngestError::InvalidRequest(format!("{FETCHED_AT_HEADER} is not RFC 3339: {err}"))
            })?,
        None => now_timestamp(),
    };

    let outcome = state
        .services
        .writer
        .write_raw(&payload, provenance, fetched_at)
        .await?;
    Ok(Json(json!({
        "status": "ok",
        "table": outcome.table,
        "inserted": outcome.inserted,
    })))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Header, then `_meta.source_url` in the body, then the configured default.
pub fn write_provenance(
    header: Option<&str>,
    payload: &JsonValue,
    default_source_url: Option<&str>,
) -> Provenance {
    let embedded = payload
        .get("_meta")
        .and_then(|meta| meta.get("source_url"))
        .and_then(JsonValue::as_str);
    Provenance::from_optional(
        [header, embedded, default_source_url]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|v| !v.is_empty()),
    )
}

async fn function_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<RunParams>, QueryRejection>,
    body: Bytes,
) -> Response {
    let query = match query {
        Ok(Query(query)) => query,
        Err(rejection) => {
            let err = IngestError::InvalidRequest(rejection.body_text());
            return function_error(&err);
        }
    };
    let from_body: JsonValue = serde_json::from_slice(&body).unwrap_or(JsonValue::Null);
    let body_field = |name: &str| {
        from_body
            .get(name)
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let params = RunParams::new(
        body_field("location").or(query.location),
        body_field("date").or(query.date),
    );

    match state.services.direct.run(&params).await {
        Ok(report) => (StatusCode::OK, Json(report.to_json("success"))).into_response(),
        Err(err) => function_error(&err),
    }
}

fn function_error(err: &IngestError) -> Response {
    warn!(error = %err, kind = err.kind(), "function invocation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"status": "error", "error": err.to_string()})),
    )
        .into_response()
}
