//! HTTP control plane.
//!
//! Routes:
//! - `GET /` — config plus live stats for every service and backend
//! - `GET /_config` — the running config, safe for re-POST
//! - `GET /{service}`, `GET /{service}/{backend}` — per-entity stats
//! - `PUT /{service}` — create or replace; `?backends_only=1` (or an
//!   unchanged service config) diffs only the backend list
//! - `DELETE /{service}` — stop and remove
//! - `PUT /{service}/{backend}`, `DELETE /{service}/{backend}` — mutate a
//!   single backend without bouncing the listener
//!
//! Validation failures answer 400, missing entities 404, bind failures
//! 500, all with an `{"error": …}` body. Every successful mutation
//! rewrites the state config file.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::warn;

use capstan_client::{
    BackendConfig, BackendStat, Config, ServiceConfig, ServiceStat, StatsResponse,
};

use crate::error::ServiceError;
use crate::persistence::StateFiles;
use crate::proxy::Registry;

/// Shared state for the control-plane handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub files: Arc<StateFiles>,
}

impl AppState {
    /// Rewrite the state config after a successful mutation. Failures are
    /// logged, never surfaced to the caller.
    async fn persist(&self) {
        let cfg = self.registry.snapshot_config().await;
        if let Err(e) = self.files.save(&cfg).await {
            warn!(error = %e, "Error saving config state");
        }
    }
}

/// Build the control-plane router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(get_stats))
        .route("/_config", get(get_config))
        .route(
            "/{service}",
            get(get_service).put(put_service).delete(delete_service),
        )
        .route(
            "/{service}/{backend}",
            get(get_backend).put(put_backend).delete(delete_backend),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Error answered by the control plane, rendered as `{"error": …}`.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::Bind { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::NotFound(_) | ServiceError::BackendNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorBody {
                error: self.message,
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
struct UpdateParams {
    backends_only: Option<String>,
}

impl UpdateParams {
    fn backends_only(&self) -> bool {
        matches!(self.backends_only.as_deref(), Some("1") | Some("true"))
    }
}

async fn get_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse {
        services: state.registry.snapshot_stats().await,
    })
}

async fn get_config(State(state): State<AppState>) -> Json<Config> {
    Json(state.registry.snapshot_config().await)
}

async fn get_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceStat>, ApiError> {
    let service = state
        .registry
        .get_service(&name)
        .await
        .ok_or_else(|| ApiError::not_found(format!("service '{name}' not found")))?;
    Ok(Json(service.stats().await))
}

async fn get_backend(
    State(state): State<AppState>,
    Path((service, backend)): Path<(String, String)>,
) -> Result<Json<BackendStat>, ApiError> {
    let service = state
        .registry
        .get_service(&service)
        .await
        .ok_or_else(|| ApiError::not_found(format!("service '{service}' not found")))?;
    let backend = service
        .get_backend(&backend)
        .await
        .ok_or_else(|| ApiError::not_found(format!("backend '{backend}' not found")))?;
    Ok(Json(backend.stats()))
}

async fn put_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(params): Query<UpdateParams>,
    Json(mut cfg): Json<ServiceConfig>,
) -> Result<Json<ServiceStat>, ApiError> {
    cfg.name = name;
    let service = state
        .registry
        .update_service(cfg, params.backends_only())
        .await?;
    state.persist().await;
    Ok(Json(service.stats().await))
}

async fn delete_service(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<StatsResponse>, ApiError> {
    state
        .registry
        .remove_service(&name)
        .await
        .ok_or_else(|| ApiError::not_found(format!("service '{name}' not found")))?;
    state.persist().await;
    Ok(Json(StatsResponse {
        services: state.registry.snapshot_stats().await,
    }))
}

async fn put_backend(
    State(state): State<AppState>,
    Path((service, backend)): Path<(String, String)>,
    Json(mut cfg): Json<BackendConfig>,
) -> Result<Json<BackendStat>, ApiError> {
    cfg.name = backend;
    let backend = state.registry.update_backend(&service, cfg).await?;
    state.persist().await;
    Ok(Json(backend.stats()))
}

async fn delete_backend(
    State(state): State<AppState>,
    Path((service, backend)): Path<(String, String)>,
) -> Result<Json<ServiceStat>, ApiError> {
    let service = state.registry.remove_backend(&service, &backend).await?;
    state.persist().await;
    Ok(Json(service.stats().await))
}
