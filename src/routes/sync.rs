use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;

use crate::errors::AppError;
use crate::models::SyncHistoryEntry;
use crate::routes::ApiResponse;
use crate::store::PgSyncStore;
use crate::sync::{SyncEngine, SyncRunReport};
use crate::InnerState;

const DEFAULT_HISTORY_LIMIT: i64 = 25;

/// Runs one sync batch over the tracked channels. Triggered on a
/// schedule or manually from the dashboard.
#[tracing::instrument(name = "Channel sync request", skip(inner))]
pub async fn run_channel_sync(
    State(inner): State<InnerState>,
) -> Result<Json<ApiResponse<SyncRunReport>>, AppError> {
    let InnerState { db, youtube } = inner;

    let engine = SyncEngine::new(PgSyncStore::new(db), youtube);
    let report = engine.run_batch().await?;

    tracing::info!(
        channels_synced = report.channels_synced,
        channels_total = report.channels.len(),
        "Sync batch finished"
    );

    let response = if report.channels.is_empty() {
        ApiResponse::success_with_message(report, "No channels due for sync")
    } else {
        ApiResponse::success(report)
    };

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
pub struct SyncHistoryParams {
    pub limit: Option<i64>,
}

/// Recent sync attempts across all channels, newest first. Backs the
/// dashboard's sync activity view.
#[tracing::instrument(name = "Get sync history", skip(inner))]
pub async fn sync_history(
    State(inner): State<InnerState>,
    Query(params): Query<SyncHistoryParams>,
) -> Result<Json<ApiResponse<Vec<SyncHistoryEntry>>>, AppError> {
    let limit = params.limit.unwrap_or(DEFAULT_HISTORY_LIMIT).clamp(1, 100);

    let entries = PgSyncStore::new(inner.db).recent_history(limit).await?;

    Ok(Json(ApiResponse::success(entries)))
}
