use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{ApiError, ApiResult};
use super::AppState;
use crate::metrics::export_metrics;
use crate::scheduler::{HealthSnapshot, Priority, StoryRequest};

/// Body of `POST /submit_story`.
#[derive(Debug, Deserialize)]
pub struct SubmitStoryRequest {
    pub user_id: String,
    /// `paid`, `premium` or `free`.
    pub priority: Priority,
    #[serde(default)]
    pub story_id: Option<String>,
    pub content: String,
    pub callback_url: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitStoryResponse {
    pub request_id: Uuid,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ScaleWorkersResponse {
    pub status: &'static str,
    pub workers: usize,
}

pub async fn submit_story(
    State(state): State<AppState>,
    Json(body): Json<SubmitStoryRequest>,
) -> ApiResult<(StatusCode, Json<SubmitStoryResponse>)> {
    if body.user_id.trim().is_empty() {
        return Err(ApiError::BadRequest("user_id must not be empty".to_string()));
    }
    if body.callback_url.trim().is_empty() {
        return Err(ApiError::BadRequest("callback_url must not be empty".to_string()));
    }
    if body.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".to_string()));
    }

    let mut story = StoryRequest::new(body.user_id, body.priority, body.content, body.callback_url);
    if let Some(story_id) = body.story_id.filter(|id| !id.trim().is_empty()) {
        story = story.with_story_id(story_id);
    }

    let request_id = state.scheduler.submit_story(story).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitStoryResponse {
            request_id,
            status: "queued",
        }),
    ))
}

pub async fn health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.scheduler.health_snapshot().await)
}

pub async fn scale_workers(
    State(state): State<AppState>,
    Path(count): Path<usize>,
) -> ApiResult<Json<ScaleWorkersResponse>> {
    state.scheduler.resize_workers(count).await?;
    Ok(Json(ScaleWorkersResponse {
        status: "scaled",
        workers: state.scheduler.pool().active_count(),
    }))
}

pub async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        export_metrics(),
    )
}
