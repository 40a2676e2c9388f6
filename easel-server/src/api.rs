use std::convert::Infallible;
use std::path::PathBuf;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{
        sse::{self, KeepAlive, Sse},
        IntoResponse,
    },
    routing::{get, post},
    Router,
};
use easel_core::{
    history::PromptEntry,
    list_models,
    model_manager::ModelEntry,
    orchestrator::BatchStatus,
    persist::MetadataRecord,
    scheduler::SchedulerName,
    GenerationRequest, LoadOptions, ModelInfo, OrchestratorState,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio_stream::{wrappers::ReceiverStream, Stream};
use tracing::{info, warn};

use crate::error::ApiError;
use crate::state::{AppState, Snapshot};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/models", get(models_handler))
        .route("/v1/models/load", post(load_model_handler))
        .route("/v1/models/unload", post(unload_model_handler))
        .route("/v1/schedulers", get(schedulers_handler))
        .route("/v1/status", get(status_handler))
        .route("/v1/images/generations", post(generate_image_handler))
        .route("/v1/images/generations/cancel", post(cancel_handler))
        .route("/v1/events", get(events_handler))
        .route("/v1/history", get(history_handler))
        .route("/v1/gallery", get(gallery_handler).delete(clear_gallery_handler))
        .with_state(state)
}

async fn models_handler(State(state): State<AppState>) -> Result<Json<Vec<ModelEntry>>, ApiError> {
    let models = list_models(&state.config.models_dir).map_err(|err| {
        ApiError::internal(format!(
            "failed to read {}: {err}",
            state.config.models_dir.display()
        ))
    })?;
    Ok(Json(models))
}

#[derive(Debug, Deserialize)]
struct LoadModelRequest {
    path: PathBuf,
    #[serde(default)]
    quantize: bool,
    #[serde(default)]
    large_variant: Option<bool>,
}

async fn load_model_handler(
    State(state): State<AppState>,
    Json(req): Json<LoadModelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let path = state.resolve_model_path(&req.path);
    let options = LoadOptions {
        device: state.config.device,
        quantize: req.quantize,
        large_variant: req.large_variant,
    };
    info!("Load requested for {}", path.display());
    state.orchestrator.load_model(&path, options)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "state": OrchestratorState::ModelLoading, "path": path })),
    ))
}

async fn unload_model_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    state.orchestrator.unload_model()?;
    Ok(Json(json!({ "state": state.orchestrator.state() })))
}

async fn schedulers_handler() -> Json<Vec<String>> {
    Json(SchedulerName::all().iter().map(ToString::to_string).collect())
}

#[derive(Serialize)]
struct StatusResponse {
    state: OrchestratorState,
    model: Option<ModelInfo>,
    batch: Option<BatchStatus>,
    #[serde(flatten)]
    snapshot: Snapshot,
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        state: state.orchestrator.state(),
        model: state.orchestrator.model_info(),
        batch: state.orchestrator.batch_status(),
        snapshot: state.snapshot(),
    })
}

async fn generate_image_handler(
    State(state): State<AppState>,
    Json(req): Json<GenerationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let seed = state.orchestrator.start_generation(req)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "seed": seed }))))
}

async fn cancel_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "cancelled": state.orchestrator.cancel_generation() }))
}

async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<sse::Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(64);
    let mut events = state.subscribe();
    let mut shutdown = state.shutdown_requested();

    tokio::spawn(async move {
        loop {
            let received = tokio::select! {
                _ = shutdown.changed() => break,
                received = events.recv() => received,
            };
            let event = match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event stream client lagged, skipped {skipped} events");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            let sse_event = match sse::Event::default().event(event.name()).json_data(&event) {
                Ok(sse_event) => sse_event,
                Err(err) => {
                    warn!("failed to serialize event: {err}");
                    continue;
                }
            };
            if tx.send(Ok(sse_event)).await.is_err() {
                break;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}

async fn history_handler(State(state): State<AppState>) -> Json<Vec<PromptEntry>> {
    Json(state.orchestrator.history())
}

#[derive(Serialize)]
struct GalleryEntry {
    name: String,
    #[serde(flatten)]
    record: MetadataRecord,
}

async fn gallery_handler(State(state): State<AppState>) -> Json<Vec<GalleryEntry>> {
    let entries = state
        .gallery
        .entries()
        .into_iter()
        .map(|(name, record)| GalleryEntry { name, record })
        .collect();
    Json(entries)
}

async fn clear_gallery_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let removed = state.orchestrator.clear_gallery()?;
    Ok(Json(json!({ "removed": removed })))
}
