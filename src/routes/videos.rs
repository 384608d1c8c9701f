use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

use crate::errors::AppError;
use crate::models::VideoProcessingRecord;
use crate::routes::ApiResponse;
use crate::store::PgSyncStore;
use crate::sync::{ManualProcessOutcome, SyncEngine};
use crate::InnerState;

/// The video id can arrive as a query parameter (GET) or a JSON body
/// (POST); both use the same field name.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessVideoRequest {
    pub video_id: Option<String>,
}

/// Manual single-video processing: enqueue a video that was never
/// discovered, or resubmit an existing record for reprocessing.
#[tracing::instrument(name = "Process video request", skip(inner, body))]
pub async fn process_video(
    State(inner): State<InnerState>,
    Query(params): Query<ProcessVideoRequest>,
    body: Option<Json<ProcessVideoRequest>>,
) -> Result<Json<ApiResponse<ManualProcessOutcome>>, AppError> {
    let video_id = body
        .and_then(|Json(b)| b.video_id)
        .or(params.video_id)
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AppError::Validation("videoId is required".to_string()))?;

    let InnerState { db, youtube } = inner;

    let engine = SyncEngine::new(PgSyncStore::new(db), youtube);
    let outcome = engine.process_manual(&video_id).await?;

    Ok(Json(ApiResponse::success(outcome)))
}

/// Processing status of one video, looked up by its external id.
#[tracing::instrument(name = "Get video status", skip(inner))]
pub async fn video_status(
    State(inner): State<InnerState>,
    Path(video_id): Path<String>,
) -> Result<Json<ApiResponse<VideoProcessingRecord>>, AppError> {
    let record = PgSyncStore::new(inner.db)
        .find_video(&video_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("No processing record for {video_id}")))?;

    Ok(Json(ApiResponse::success(record)))
}
