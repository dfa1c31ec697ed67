//! HTTP facade
//!
//! Thin axum handlers over an [`Executor`]. Handlers never touch models
//! directly, so the same router serves local and remote modes.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};

use crate::catalog;
use crate::dispatch::Executor;
use crate::error::{LensError, LensResult};
use crate::schema::{
    ErrorBody, LogitLensRequest, LogitLensResponse, RunWithSteeringRequest,
    RunWithSteeringResponse, SteeringVectorRequest, SteeringVectorResponse,
};

impl LensError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for LensError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if self.is_client_error() {
            warn!(error = %self, "Request rejected");
        } else {
            error!(error = %format!("{self:#}"), "Request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Clone)]
pub struct AppState {
    executor: Arc<dyn Executor>,
}

impl AppState {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self { executor }
    }
}

/// Allow-list of origins, or any origin when the list is empty
fn cors_layer(origins: &[String]) -> anyhow::Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return Ok(layer.allow_origin(Any));
    }
    let origins = origins
        .iter()
        .map(|o| HeaderValue::from_str(o).map_err(|e| anyhow::anyhow!("Bad CORS origin {o}: {e}")))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(origins)))
}

pub fn router(executor: Arc<dyn Executor>, cors_origins: &[String]) -> anyhow::Result<Router> {
    Ok(Router::new()
        .route("/", get(root))
        .route("/available_models", get(available_models))
        .route("/steering/available_models", get(steering_models))
        .route("/loaded_models", get(loaded_models))
        .route("/logitlens", post(logit_lens))
        .route("/steering/calculate", post(calculate_steering))
        .route("/steering/run_with_steering", post(run_with_steering))
        .layer(cors_layer(cors_origins)?)
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(executor)))
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "lenscope" }))
}

async fn available_models() -> Json<Vec<&'static str>> {
    Json(catalog::available_models())
}

async fn steering_models() -> Json<Vec<&'static str>> {
    Json(catalog::steering_models())
}

async fn loaded_models(State(state): State<AppState>) -> Json<BTreeMap<String, DateTime<Utc>>> {
    Json(state.executor.loaded_models())
}

async fn logit_lens(
    State(state): State<AppState>,
    Json(req): Json<LogitLensRequest>,
) -> LensResult<Json<LogitLensResponse>> {
    Ok(Json(state.executor.logit_lens(req).await?))
}

async fn calculate_steering(
    State(state): State<AppState>,
    Json(req): Json<SteeringVectorRequest>,
) -> LensResult<Json<SteeringVectorResponse>> {
    Ok(Json(state.executor.calculate_steering(req).await?))
}

async fn run_with_steering(
    State(state): State<AppState>,
    Json(req): Json<RunWithSteeringRequest>,
) -> LensResult<Json<RunWithSteeringResponse>> {
    Ok(Json(state.executor.run_with_steering(req).await?))
}
