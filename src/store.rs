//! Persistence layer for the ingestion workflow.
//!
//! The sync engine talks to storage through [`SyncStore`], so tests can
//! swap in an in-memory implementation. [`PgSyncStore`] is the real one
//! and is the sole writer of processing records and sync history.

use sqlx::PgPool;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::{
    ProcessingStatus, SyncHistoryEntry, SyncStatus, TrackedChannel, VideoMetadata,
    VideoProcessingRecord,
};

pub trait SyncStore {
    /// Channels flagged for auto-processing, oldest watermark first,
    /// never-synced channels ahead of everything else.
    async fn channels_due_for_sync(&self, limit: i64) -> Result<Vec<TrackedChannel>, AppError>;

    /// Opens a pending sync-history row for this channel and returns
    /// its id.
    async fn open_sync_entry(&self, channel: &TrackedChannel) -> Result<String, AppError>;

    async fn close_sync_entry(
        &self,
        entry_id: &str,
        status: SyncStatus,
        videos_processed: i32,
        error_message: Option<&str>,
    ) -> Result<(), AppError>;

    /// Moves the channel's last-synced watermark to now.
    async fn advance_watermark(&self, channel: &TrackedChannel) -> Result<(), AppError>;

    /// Conditionally inserts a processing record for `video_id`.
    /// Returns the new record id, or `None` when a record already
    /// exists. The conflict target is the unique `video_id` column, so
    /// two concurrent invocations cannot both insert.
    async fn enqueue_video(
        &self,
        video_id: &str,
        status: ProcessingStatus,
        metadata: &VideoMetadata,
    ) -> Result<Option<String>, AppError>;

    /// Resets an existing record to `processing` and bumps its retry
    /// counter. Returns the updated record, or `None` when no record
    /// exists for `video_id`.
    async fn resubmit_video(
        &self,
        video_id: &str,
    ) -> Result<Option<VideoProcessingRecord>, AppError>;
}

const VIDEO_RECORD_COLUMNS: &str = "id, video_id, status, title, description, published_at, \
     channel_title, channel_ref, transcript, error_message, retry_count, created_at, \
     last_attempt_at";

#[derive(Clone)]
pub struct PgSyncStore {
    db: PgPool,
}

impl PgSyncStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Looks up the processing record for one external video id. Read
    /// side for the dashboard's status view.
    pub async fn find_video(
        &self,
        video_id: &str,
    ) -> Result<Option<VideoProcessingRecord>, AppError> {
        let record = sqlx::query_as::<_, VideoProcessingRecord>(&format!(
            "SELECT {VIDEO_RECORD_COLUMNS} FROM video_processing_records WHERE video_id = $1"
        ))
        .bind(video_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(record)
    }

    /// Most recent sync attempts across all channels, newest first.
    pub async fn recent_history(&self, limit: i64) -> Result<Vec<SyncHistoryEntry>, AppError> {
        let entries = sqlx::query_as::<_, SyncHistoryEntry>(
            "SELECT id, channel_ref, status, videos_processed, error_message, started_at, \
                    finished_at \
             FROM sync_history \
             ORDER BY started_at DESC \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(entries)
    }
}

impl SyncStore for PgSyncStore {
    async fn channels_due_for_sync(&self, limit: i64) -> Result<Vec<TrackedChannel>, AppError> {
        let channels = sqlx::query_as::<_, TrackedChannel>(
            "SELECT id, channel_id, display_name, auto_process, last_synced_at, created_at \
             FROM tracked_channels \
             WHERE auto_process = TRUE \
             ORDER BY last_synced_at ASC NULLS FIRST \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await?;

        Ok(channels)
    }

    async fn open_sync_entry(&self, channel: &TrackedChannel) -> Result<String, AppError> {
        let entry_id = Uuid::new_v4().to_string();

        sqlx::query(
            "INSERT INTO sync_history (id, channel_ref, status, videos_processed, started_at) \
             VALUES ($1, $2, $3, 0, NOW())",
        )
        .bind(&entry_id)
        .bind(&channel.id)
        .bind(SyncStatus::Pending.as_str())
        .execute(&self.db)
        .await?;

        Ok(entry_id)
    }

    async fn close_sync_entry(
        &self,
        entry_id: &str,
        status: SyncStatus,
        videos_processed: i32,
        error_message: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE sync_history \
             SET status = $2, videos_processed = $3, error_message = $4, finished_at = NOW() \
             WHERE id = $1",
        )
        .bind(entry_id)
        .bind(status.as_str())
        .bind(videos_processed)
        .bind(error_message)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn advance_watermark(&self, channel: &TrackedChannel) -> Result<(), AppError> {
        sqlx::query("UPDATE tracked_channels SET last_synced_at = NOW() WHERE id = $1")
            .bind(&channel.id)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    async fn enqueue_video(
        &self,
        video_id: &str,
        status: ProcessingStatus,
        metadata: &VideoMetadata,
    ) -> Result<Option<String>, AppError> {
        let record_id = Uuid::new_v4().to_string();

        let inserted = sqlx::query_scalar::<_, String>(
            "INSERT INTO video_processing_records \
               (id, video_id, status, title, description, published_at, channel_title, \
                channel_ref, retry_count, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, NOW()) \
             ON CONFLICT (video_id) DO NOTHING \
             RETURNING id",
        )
        .bind(&record_id)
        .bind(video_id)
        .bind(status.as_str())
        .bind(&metadata.title)
        .bind(&metadata.description)
        .bind(metadata.published_at)
        .bind(&metadata.channel_title)
        .bind(&metadata.channel_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(inserted)
    }

    async fn resubmit_video(
        &self,
        video_id: &str,
    ) -> Result<Option<VideoProcessingRecord>, AppError> {
        let record = sqlx::query_as::<_, VideoProcessingRecord>(&format!(
            "UPDATE video_processing_records \
             SET status = 'processing', retry_count = retry_count + 1, \
                 error_message = NULL, last_attempt_at = NOW() \
             WHERE video_id = $1 \
             RETURNING {VIDEO_RECORD_COLUMNS}"
        ))
        .bind(video_id)
        .fetch_optional(&self.db)
        .await?;

        Ok(record)
    }
}
