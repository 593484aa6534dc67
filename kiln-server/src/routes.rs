use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use kiln_core::{GenerationParams, Handle};
use serde_json::json;
use tokio::time::Instant;
use tower_http::trace::TraceLayer;

use crate::{
    error::ApiError,
    schemas::{
        image_to_base64_png, ImageGenerationRequest, ImageGenerationResponse, ImageObject,
        ImageSize, ModelCard, ModelList,
    },
    state::AppState,
};

/// Most images a single request may ask for.
pub const MAX_IMAGES_PER_REQUEST: usize = 10;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(list_models))
        .route("/v1/images/generations", post(generate_image_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> Response {
    match state.dispatcher() {
        Some(dispatcher) => Json(json!({
            "status": "ok",
            "model": dispatcher.model(),
            "queued": dispatcher.queued(),
        }))
        .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "loading" })),
        )
            .into_response(),
    }
}

async fn list_models(State(state): State<Arc<AppState>>) -> Result<Json<ModelList>, ApiError> {
    let dispatcher = state.dispatcher().ok_or(ApiError::NotReady)?;
    Ok(Json(ModelList {
        object: "list".to_string(),
        data: vec![ModelCard {
            id: dispatcher.model().to_string(),
            object: "model".to_string(),
            created: 0,
            owned_by: "kiln".to_string(),
        }],
    }))
}

async fn generate_image_handler(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ImageGenerationRequest>, JsonRejection>,
) -> Result<Json<ImageGenerationResponse>, ApiError> {
    let Json(req) = payload?;
    let dispatcher = state.dispatcher().ok_or(ApiError::NotReady)?;
    let defaults = &state.defaults;

    let n = req.n.unwrap_or(1);
    if !(1..=MAX_IMAGES_PER_REQUEST).contains(&n) {
        return Err(ApiError::BadRequest(format!(
            "n must be between 1 and {MAX_IMAGES_PER_REQUEST}, got {n}"
        )));
    }
    let size = match req.size.as_deref() {
        Some(size) => size.parse::<ImageSize>().map_err(ApiError::BadRequest)?,
        None => defaults.size,
    };
    if size.width > defaults.max_size || size.height > defaults.max_size {
        return Err(ApiError::BadRequest(format!(
            "size must be at most {max}x{max}, got {size}",
            max = defaults.max_size
        )));
    }
    let steps = req.steps.unwrap_or(defaults.steps);
    if steps > defaults.max_steps {
        return Err(ApiError::BadRequest(format!(
            "steps must be at most {}, got {steps}",
            defaults.max_steps
        )));
    }
    let seed = req.seed.unwrap_or(defaults.seed);
    if let Some(model) = req.model.as_deref().filter(|m| *m != dispatcher.model()) {
        tracing::debug!(requested = model, "ignoring requested model, serving the loaded one");
    }

    // Each image is its own job; consecutive seeds keep `n > 1` from repeating itself.
    let params = (0..n as u64)
        .map(|i| {
            GenerationParams::new(
                req.prompt.clone(),
                size.width,
                size.height,
                steps,
                seed.wrapping_add(i),
            )
        })
        .collect::<Result<Vec<_>, _>>()?;
    let handles = dispatcher.try_submit_all(params)?;

    let deadline = defaults.request_timeout.map(|timeout| Instant::now() + timeout);
    let format = req.response_format.unwrap_or_default();
    let mut data = Vec::with_capacity(handles.len());
    for handle in &handles {
        let image = wait_for(handle, deadline).await??;
        let b64 = tokio::task::spawn_blocking(move || image_to_base64_png(&image))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .map_err(|e| ApiError::Internal(e.to_string()))?;
        data.push(ImageObject::new(format, b64));
    }

    Ok(Json(ImageGenerationResponse {
        created: chrono::Utc::now().timestamp(),
        data,
    }))
}

async fn wait_for(
    handle: &Handle,
    deadline: Option<Instant>,
) -> Result<kiln_core::Outcome, ApiError> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, handle.wait())
            .await
            .map_err(|_| {
                tracing::warn!(
                    job = %handle.id(),
                    "request timed out, job keeps its place in the queue"
                );
                ApiError::Timeout
            }),
        None => Ok(handle.wait().await),
    }
}
