use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use talkhead_core::{
    service::FILES_PREFIX, GenerationParams, GenerationRequest, HealthReport, Mode, VideoService,
};
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::error::ApiError;

/// Reference videos routinely exceed axum's 2 MB default.
const MAX_UPLOAD_BYTES: usize = 1 << 30;

#[derive(Clone)]
pub struct AppState {
    pub service: VideoService,
}

#[derive(Serialize)]
struct HealthResponse {
    ok: bool,
    details: HealthReport,
}

#[derive(Serialize)]
struct GenerationResponse {
    ok: bool,
    video_file: String,
    params: GenerationParams,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let files = ServeDir::new(&state.service.config().out_dir);

    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/generate", post(generate_video_handler))
        .nest_service(FILES_PREFIX, files)
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = state.service.config();
    Json(json!({
        "ok": true,
        "msg": "InfiniteTalk talking-head endpoint",
        "health": "/health",
        "generate": { "POST": "/generate" },
        "files": format!("{FILES_PREFIX}/{{name}}.mp4"),
        "workdir": config.workdir,
        "weights_dir": config.weights_dir,
        "out_dir": config.out_dir,
        "code_dir": config.code_dir,
    }))
}

async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, ApiError> {
    let details = state.service.health().await?;
    Ok(Json(HealthResponse {
        ok: details.ok(),
        details,
    }))
}

async fn generate_video_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<GenerationResponse>, ApiError> {
    let request = parse_generation_request(multipart).await?;
    let outcome = state.service.generate(request).await?;

    Ok(Json(GenerationResponse {
        ok: true,
        video_file: outcome.video_file,
        params: outcome.params,
    }))
}

/// Reads the multipart form into a request, applying defaults for absent
/// text fields. The prompt is passed through verbatim unless blank. Empty
/// file parts count as not sent; unknown fields are ignored.
async fn parse_generation_request(mut multipart: Multipart) -> Result<GenerationRequest, ApiError> {
    let mut request = GenerationRequest::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Failed reading multipart field: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "prompt" | "mode" | "sample_steps" => {
                let text = field.text().await.map_err(|e| {
                    ApiError::bad_request(format!("Failed reading multipart '{name}' field: {e}"))
                })?;
                if text.trim().is_empty() {
                    continue;
                }
                if name == "prompt" {
                    request.prompt = text;
                    continue;
                }
                let text = text.trim();
                match name.as_str() {
                    "mode" => {
                        request.mode = text.parse::<Mode>().map_err(|_| {
                            ApiError::bad_request(format!(
                                "Invalid mode '{text}'; expected 'clip' or 'streaming'"
                            ))
                        })?
                    }
                    _ => {
                        request.sample_steps = text.parse::<u32>().map_err(|_| {
                            ApiError::bad_request(format!(
                                "Invalid sample_steps '{text}'; expected a positive integer"
                            ))
                        })?
                    }
                }
            }
            "audio" | "ref_image" | "ref_video" => {
                let bytes = field.bytes().await.map_err(|e| {
                    ApiError::bad_request(format!("Failed reading '{name}' bytes: {e}"))
                })?;
                if bytes.is_empty() {
                    continue;
                }
                let slot = match name.as_str() {
                    "audio" => &mut request.audio,
                    "ref_image" => request.ref_image.get_or_insert_with(Vec::new),
                    _ => request.ref_video.get_or_insert_with(Vec::new),
                };
                *slot = bytes.to_vec();
            }
            _ => {}
        }
    }

    Ok(request)
}
