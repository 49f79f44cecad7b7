//! Read-only JSON HTTP API.
//!
//! Serves the ingested catalog straight from SQLite. Nothing here writes;
//! ingestion is the only writer.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET` | `/health` | Health check (returns version) |
//! | `GET` | `/api/v1/titles` | `skip`, `limit`, `include_reserved` |
//! | `GET` | `/api/v1/titles/{number}` | One title |
//! | `GET` | `/api/v1/agencies` | `skip`, `limit`, `parent_id`, `q` |
//! | `GET` | `/api/v1/agencies/{id}` | Agency with children and references |
//! | `GET` | `/api/v1/agencies/slug/{slug}` | Same, by slug |
//! | `GET` | `/api/v1/references/{id}` | Reference with content and agencies |
//! | `GET` | `/api/v1/search` | `q`, `limit` |
//! | `GET` | `/api/v1/stats` | Row counts |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "agency not found: 42" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `internal` (500).

use axum::{
    extract::{rejection::PathRejection, rejection::QueryRejection, Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::catalog::{
    self, AgencyDetail, AgencyQuery, AgencyResponse, ReferenceDetail, TitleResponse,
};
use crate::config::{Config, ServerConfig};
use crate::db;
use crate::search::{self, SearchHit};
use crate::stats::{self, Stats};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pool: SqlitePool,
    database_url: Arc<str>,
}

impl AppState {
    pub fn new(pool: SqlitePool, database_url: &str) -> Self {
        Self {
            pool,
            database_url: Arc::from(database_url),
        }
    }
}

/// Starts the HTTP server on `[server].bind` and runs until the process is
/// terminated.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let app = router(AppState::new(pool, &config.db.url), &config.server)?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(bind = %config.server.bind, "listening");
    println!("eCFR API listening on http://{}", config.server.bind);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Builds the router with CORS applied.
pub fn router(state: AppState, server: &ServerConfig) -> anyhow::Result<Router> {
    let cors = CorsLayer::new()
        .allow_origin(allowed_origins(&server.cors_origins)?)
        .allow_methods([Method::GET]);

    Ok(Router::new()
        .route("/health", get(handle_health))
        .route("/api/v1/titles", get(handle_list_titles))
        .route("/api/v1/titles/{number}", get(handle_get_title))
        .route("/api/v1/agencies", get(handle_list_agencies))
        .route("/api/v1/agencies/{id}", get(handle_get_agency))
        .route("/api/v1/agencies/slug/{slug}", get(handle_get_agency_by_slug))
        .route("/api/v1/references/{id}", get(handle_get_reference))
        .route("/api/v1/search", get(handle_search))
        .route("/api/v1/stats", get(handle_stats))
        .layer(cors)
        .with_state(state))
}

fn allowed_origins(origins: &[String]) -> anyhow::Result<AllowOrigin> {
    if origins.iter().any(|o| o == "*") {
        return Ok(AllowOrigin::any());
    }
    let values = origins
        .iter()
        .map(|o| {
            HeaderValue::from_str(o).map_err(|_| anyhow::anyhow!("invalid CORS origin: {}", o))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(AllowOrigin::list(values))
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        tracing::error!(error = %err, "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal",
            message: err.to_string(),
        }
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        bad_request(rejection.body_text())
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn check_page(skip: i64, limit: Option<i64>) -> Result<(), AppError> {
    if skip < 0 {
        return Err(bad_request("skip must be >= 0"));
    }
    if matches!(limit, Some(l) if l < 1) {
        return Err(bad_request("limit must be >= 1"));
    }
    Ok(())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Titles ============

#[derive(Deserialize)]
struct TitleParams {
    #[serde(default)]
    skip: i64,
    limit: Option<i64>,
    #[serde(default)]
    include_reserved: bool,
}

async fn handle_list_titles(
    State(state): State<AppState>,
    params: Result<Query<TitleParams>, QueryRejection>,
) -> Result<Json<Vec<TitleResponse>>, AppError> {
    let Query(params) = params?;
    check_page(params.skip, params.limit)?;
    let titles =
        catalog::list_titles(&state.pool, params.skip, params.limit, params.include_reserved)
            .await?;
    Ok(Json(titles))
}

async fn handle_get_title(
    State(state): State<AppState>,
    number: Result<Path<i64>, PathRejection>,
) -> Result<Json<TitleResponse>, AppError> {
    let Path(number) = number?;
    catalog::get_title(&state.pool, number)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("title not found: {}", number)))
}

// ============ Agencies ============

#[derive(Deserialize)]
struct AgencyParams {
    #[serde(default)]
    skip: i64,
    limit: Option<i64>,
    parent_id: Option<i64>,
    q: Option<String>,
}

async fn handle_list_agencies(
    State(state): State<AppState>,
    params: Result<Query<AgencyParams>, QueryRejection>,
) -> Result<Json<Vec<AgencyResponse>>, AppError> {
    let Query(params) = params?;
    check_page(params.skip, params.limit)?;
    let query = AgencyQuery {
        skip: params.skip,
        limit: params.limit,
        parent_id: params.parent_id,
        filter: params.q,
    };
    Ok(Json(catalog::list_agencies(&state.pool, &query).await?))
}

async fn handle_get_agency(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<AgencyDetail>, AppError> {
    let Path(id) = id?;
    catalog::get_agency(&state.pool, id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("agency not found: {}", id)))
}

async fn handle_get_agency_by_slug(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<AgencyDetail>, AppError> {
    catalog::get_agency_by_slug(&state.pool, &slug)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("agency not found: {}", slug)))
}

// ============ References ============

async fn handle_get_reference(
    State(state): State<AppState>,
    id: Result<Path<i64>, PathRejection>,
) -> Result<Json<ReferenceDetail>, AppError> {
    let Path(id) = id?;
    catalog::get_reference(&state.pool, id)
        .await?
        .map(Json)
        .ok_or_else(|| not_found(format!("reference not found: {}", id)))
}

// ============ Search ============

#[derive(Deserialize)]
struct SearchParams {
    #[serde(default)]
    q: String,
    limit: Option<i64>,
}

#[derive(Serialize)]
struct SearchResponse {
    query: String,
    results: Vec<SearchHit>,
}

async fn handle_search(
    State(state): State<AppState>,
    params: Result<Query<SearchParams>, QueryRejection>,
) -> Result<Json<SearchResponse>, AppError> {
    let Query(params) = params?;
    if params.q.trim().is_empty() {
        return Err(bad_request("q must not be empty"));
    }
    check_page(0, params.limit)?;
    let results = search::search_references(&state.pool, &params.q, params.limit).await?;
    Ok(Json(SearchResponse {
        query: params.q,
        results,
    }))
}

// ============ Stats ============

async fn handle_stats(State(state): State<AppState>) -> Result<Json<Stats>, AppError> {
    Ok(Json(
        stats::collect_stats(&state.pool, &state.database_url).await?,
    ))
}
