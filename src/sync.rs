//! Channel-video ingestion workflow.
//!
//! [`SyncEngine`] rotates through tracked channels in small batches,
//! discovers recent videos upstream, and enqueues processing records
//! for anything not yet seen. It is generic over the store and the
//! video source so the orchestration rules can be tested without a
//! database or network.

use serde::Serialize;
use tracing::{error, info};

use crate::errors::AppError;
use crate::models::{ProcessingStatus, SyncStatus, TrackedChannel};
use crate::store::SyncStore;
use crate::youtube::{DiscoveredVideo, YoutubeClient};

/// How many channels one invocation will touch.
pub const SYNC_BATCH_SIZE: i64 = 3;

/// Source of discovered videos. Implemented by the real upstream
/// client and by scripted fixtures in tests.
pub trait VideoSource {
    async fn recent_videos(&self, channel_id: &str) -> Result<Vec<DiscoveredVideo>, AppError>;

    async fn video_details(&self, video_id: &str) -> Result<Option<DiscoveredVideo>, AppError>;
}

impl VideoSource for YoutubeClient {
    async fn recent_videos(&self, channel_id: &str) -> Result<Vec<DiscoveredVideo>, AppError> {
        YoutubeClient::recent_videos(self, channel_id).await
    }

    async fn video_details(&self, video_id: &str) -> Result<Option<DiscoveredVideo>, AppError> {
        YoutubeClient::video_details(self, video_id).await
    }
}

/// Outcome of handing one discovered video to the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum VideoOutcome {
    Queued {
        video_id: String,
        record_id: String,
    },
    AlreadyQueued {
        video_id: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelSyncStatus {
    Synced,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSyncSummary {
    pub channel_id: String,
    pub channel_name: String,
    pub status: ChannelSyncStatus,
    pub videos_processed: i32,
    pub videos: Vec<VideoOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunReport {
    pub channels_synced: usize,
    pub channels: Vec<ChannelSyncSummary>,
}

/// Outcome of the manual single-video entry point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ManualProcessOutcome {
    Queued {
        video_id: String,
        record_id: String,
    },
    Reprocessing {
        video_id: String,
        record_id: String,
        retry_count: i32,
    },
}

pub struct SyncEngine<S, V> {
    store: S,
    source: V,
    batch_size: i64,
}

impl<S: SyncStore, V: VideoSource> SyncEngine<S, V> {
    pub fn new(store: S, source: V) -> Self {
        Self {
            store,
            source,
            batch_size: SYNC_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Runs one sync pass over up to `batch_size` channels, oldest
    /// watermark first. One channel's failure never aborts the batch;
    /// it is recorded in that channel's history row and summary.
    #[tracing::instrument(name = "Run channel sync batch", skip(self))]
    pub async fn run_batch(&self) -> Result<SyncRunReport, AppError> {
        let channels = self.store.channels_due_for_sync(self.batch_size).await?;

        if channels.is_empty() {
            info!("No channels due for sync");
            return Ok(SyncRunReport {
                channels_synced: 0,
                channels: Vec::new(),
            });
        }

        let mut summaries = Vec::with_capacity(channels.len());

        for channel in &channels {
            info!(channel_id = %channel.channel_id, "Syncing channel");

            let entry_id = self.store.open_sync_entry(channel).await?;

            match self.sync_channel(channel).await {
                Ok(videos) => {
                    let processed = videos.len() as i32;
                    self.store
                        .close_sync_entry(&entry_id, SyncStatus::Success, processed, None)
                        .await?;
                    // A successful fetch always advances the watermark,
                    // even when nothing new was queued. This is what
                    // makes oldest-first selection a fair rotation.
                    self.store.advance_watermark(channel).await?;

                    info!(
                        channel_id = %channel.channel_id,
                        videos_processed = processed,
                        "Channel synced"
                    );

                    summaries.push(ChannelSyncSummary {
                        channel_id: channel.channel_id.clone(),
                        channel_name: channel.display_name.clone(),
                        status: ChannelSyncStatus::Synced,
                        videos_processed: processed,
                        videos,
                        error: None,
                    });
                }
                Err(e) => {
                    let message = e.to_string();
                    error!(
                        channel_id = %channel.channel_id,
                        error = %message,
                        "Channel sync failed"
                    );
                    self.store
                        .close_sync_entry(&entry_id, SyncStatus::Failed, 0, Some(&message))
                        .await?;

                    summaries.push(ChannelSyncSummary {
                        channel_id: channel.channel_id.clone(),
                        channel_name: channel.display_name.clone(),
                        status: ChannelSyncStatus::Error,
                        videos_processed: 0,
                        videos: Vec::new(),
                        error: Some(message),
                    });
                }
            }
        }

        let channels_synced = summaries
            .iter()
            .filter(|s| s.status == ChannelSyncStatus::Synced)
            .count();

        Ok(SyncRunReport {
            channels_synced,
            channels: summaries,
        })
    }

    /// Fetches and processes one channel's recent videos sequentially.
    /// Any failure inside the pass (fetch or a per-video database
    /// error) aborts the remaining videos for this channel.
    async fn sync_channel(
        &self,
        channel: &TrackedChannel,
    ) -> Result<Vec<VideoOutcome>, AppError> {
        let discovered = self.source.recent_videos(&channel.channel_id).await?;

        let mut outcomes = Vec::with_capacity(discovered.len());
        for video in &discovered {
            outcomes.push(self.process_discovered_video(video).await?);
        }

        Ok(outcomes)
    }

    /// Records a discovered video as `pending`, or reports it as
    /// already queued. The insert is conditional on the unique video
    /// id, so a video is never double-enqueued.
    pub async fn process_discovered_video(
        &self,
        video: &DiscoveredVideo,
    ) -> Result<VideoOutcome, AppError> {
        let metadata = video.metadata();

        match self
            .store
            .enqueue_video(&video.video_id, ProcessingStatus::Pending, &metadata)
            .await?
        {
            Some(record_id) => Ok(VideoOutcome::Queued {
                video_id: video.video_id.clone(),
                record_id,
            }),
            None => Ok(VideoOutcome::AlreadyQueued {
                video_id: video.video_id.clone(),
            }),
        }
    }

    /// Manual entry point: resume an existing record (bump its retry
    /// counter, reset to `processing`) or look the video up upstream
    /// and enqueue it fresh.
    #[tracing::instrument(name = "Process single video", skip(self))]
    pub async fn process_manual(&self, video_id: &str) -> Result<ManualProcessOutcome, AppError> {
        if let Some(record) = self.store.resubmit_video(video_id).await? {
            info!(
                video_id,
                retry_count = record.retry_count,
                "Resubmitting existing video record"
            );
            return Ok(ManualProcessOutcome::Reprocessing {
                video_id: record.video_id,
                record_id: record.id,
                retry_count: record.retry_count,
            });
        }

        let video = self
            .source
            .video_details(video_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Video {video_id} not found upstream")))?;

        let metadata = video.metadata();
        match self
            .store
            .enqueue_video(video_id, ProcessingStatus::Processing, &metadata)
            .await?
        {
            Some(record_id) => Ok(ManualProcessOutcome::Queued {
                video_id: video.video_id,
                record_id,
            }),
            // Lost a race with another invocation; resume the record it
            // just created.
            None => {
                let record = self.store.resubmit_video(video_id).await?.ok_or_else(|| {
                    AppError::Unexpected(anyhow::anyhow!(
                        "video record for {video_id} vanished during processing"
                    ))
                })?;
                Ok(ManualProcessOutcome::Reprocessing {
                    video_id: record.video_id,
                    record_id: record.id,
                    retry_count: record.retry_count,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SyncHistoryEntry, VideoMetadata, VideoProcessingRecord};
    use crate::youtube::VideoSnippet;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct MemoryStore {
        channels: Mutex<Vec<TrackedChannel>>,
        records: Mutex<HashMap<String, VideoProcessingRecord>>,
        history: Mutex<Vec<SyncHistoryEntry>>,
        // video ids whose enqueue fails with a database error
        poisoned: Mutex<Vec<String>>,
    }

    impl MemoryStore {
        fn add_channel(&self, channel: TrackedChannel) {
            self.channels.lock().unwrap().push(channel);
        }

        fn channel_watermark(&self, id: &str) -> Option<chrono::DateTime<Utc>> {
            self.channels
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.id == id)
                .and_then(|c| c.last_synced_at)
        }

        fn history_entries(&self) -> Vec<SyncHistoryEntry> {
            self.history.lock().unwrap().clone()
        }

        fn record(&self, video_id: &str) -> Option<VideoProcessingRecord> {
            self.records.lock().unwrap().get(video_id).cloned()
        }

        fn insert_record(&self, record: VideoProcessingRecord) {
            self.records
                .lock()
                .unwrap()
                .insert(record.video_id.clone(), record);
        }

        fn poison(&self, video_id: &str) {
            self.poisoned.lock().unwrap().push(video_id.to_string());
        }
    }

    impl SyncStore for MemoryStore {
        async fn channels_due_for_sync(
            &self,
            limit: i64,
        ) -> Result<Vec<TrackedChannel>, AppError> {
            let mut channels: Vec<TrackedChannel> = self
                .channels
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.auto_process)
                .cloned()
                .collect();
            // None sorts before Some, matching NULLS FIRST.
            channels.sort_by_key(|c| c.last_synced_at);
            channels.truncate(limit as usize);
            Ok(channels)
        }

        async fn open_sync_entry(&self, channel: &TrackedChannel) -> Result<String, AppError> {
            let entry = SyncHistoryEntry {
                id: Uuid::new_v4().to_string(),
                channel_ref: channel.id.clone(),
                status: SyncStatus::Pending.as_str().to_string(),
                videos_processed: 0,
                error_message: None,
                started_at: Utc::now(),
                finished_at: None,
            };
            let id = entry.id.clone();
            self.history.lock().unwrap().push(entry);
            Ok(id)
        }

        async fn close_sync_entry(
            &self,
            entry_id: &str,
            status: SyncStatus,
            videos_processed: i32,
            error_message: Option<&str>,
        ) -> Result<(), AppError> {
            let mut history = self.history.lock().unwrap();
            let entry = history
                .iter_mut()
                .find(|e| e.id == entry_id)
                .expect("closing unknown sync entry");
            entry.status = status.as_str().to_string();
            entry.videos_processed = videos_processed;
            entry.error_message = error_message.map(String::from);
            entry.finished_at = Some(Utc::now());
            Ok(())
        }

        async fn advance_watermark(&self, channel: &TrackedChannel) -> Result<(), AppError> {
            let mut channels = self.channels.lock().unwrap();
            let stored = channels
                .iter_mut()
                .find(|c| c.id == channel.id)
                .expect("advancing watermark of unknown channel");
            stored.last_synced_at = Some(Utc::now());
            Ok(())
        }

        async fn enqueue_video(
            &self,
            video_id: &str,
            status: ProcessingStatus,
            metadata: &VideoMetadata,
        ) -> Result<Option<String>, AppError> {
            if self.poisoned.lock().unwrap().iter().any(|v| v == video_id) {
                return Err(AppError::Database(anyhow::anyhow!(
                    "connection reset by peer"
                )));
            }

            let mut records = self.records.lock().unwrap();
            if records.contains_key(video_id) {
                return Ok(None);
            }

            let record = VideoProcessingRecord {
                id: Uuid::new_v4().to_string(),
                video_id: video_id.to_string(),
                status: status.as_str().to_string(),
                title: metadata.title.clone(),
                description: metadata.description.clone(),
                published_at: metadata.published_at,
                channel_title: metadata.channel_title.clone(),
                channel_ref: metadata.channel_id.clone(),
                transcript: None,
                error_message: None,
                retry_count: 0,
                created_at: Utc::now(),
                last_attempt_at: None,
            };
            let id = record.id.clone();
            records.insert(video_id.to_string(), record);
            Ok(Some(id))
        }

        async fn resubmit_video(
            &self,
            video_id: &str,
        ) -> Result<Option<VideoProcessingRecord>, AppError> {
            let mut records = self.records.lock().unwrap();
            let Some(record) = records.get_mut(video_id) else {
                return Ok(None);
            };
            record.status = ProcessingStatus::Processing.as_str().to_string();
            record.retry_count += 1;
            record.error_message = None;
            record.last_attempt_at = Some(Utc::now());
            Ok(Some(record.clone()))
        }
    }

    #[derive(Default)]
    struct ScriptedSource {
        videos: HashMap<String, Vec<DiscoveredVideo>>,
        failures: HashMap<String, String>,
        details: HashMap<String, DiscoveredVideo>,
    }

    impl VideoSource for ScriptedSource {
        async fn recent_videos(
            &self,
            channel_id: &str,
        ) -> Result<Vec<DiscoveredVideo>, AppError> {
            if let Some(message) = self.failures.get(channel_id) {
                return Err(AppError::ExternalService(anyhow::anyhow!("{message}")));
            }
            Ok(self.videos.get(channel_id).cloned().unwrap_or_default())
        }

        async fn video_details(
            &self,
            video_id: &str,
        ) -> Result<Option<DiscoveredVideo>, AppError> {
            Ok(self.details.get(video_id).cloned())
        }
    }

    fn channel(id: &str, hours_since_sync: Option<i64>) -> TrackedChannel {
        TrackedChannel {
            id: id.to_string(),
            channel_id: format!("UC-{id}"),
            display_name: format!("Channel {id}"),
            auto_process: true,
            last_synced_at: hours_since_sync.map(|h| Utc::now() - ChronoDuration::hours(h)),
            created_at: Utc::now() - ChronoDuration::days(30),
        }
    }

    fn video(video_id: &str, channel_id: &str) -> DiscoveredVideo {
        DiscoveredVideo {
            video_id: video_id.to_string(),
            snippet: VideoSnippet {
                published_at: "2024-03-01T12:00:00Z".to_string(),
                channel_id: channel_id.to_string(),
                title: format!("Video {video_id}"),
                description: "desc".to_string(),
                channel_title: "Some Channel".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn discovered_video_is_enqueued_exactly_once() {
        let store = MemoryStore::default();
        let engine = SyncEngine::new(store, ScriptedSource::default());
        let v = video("vid-1", "UC-a");

        let first = engine.process_discovered_video(&v).await.unwrap();
        let second = engine.process_discovered_video(&v).await.unwrap();

        assert!(matches!(first, VideoOutcome::Queued { .. }));
        assert_eq!(
            second,
            VideoOutcome::AlreadyQueued {
                video_id: "vid-1".to_string()
            }
        );

        let record = engine.store.record("vid-1").expect("record missing");
        assert_eq!(record.status, "pending");
        assert_eq!(record.title, "Video vid-1");
    }

    #[tokio::test]
    async fn batch_never_exceeds_limit_and_prefers_oldest() {
        let store = MemoryStore::default();
        store.add_channel(channel("a", Some(1)));
        store.add_channel(channel("b", Some(48)));
        store.add_channel(channel("c", Some(24)));
        store.add_channel(channel("d", Some(2)));
        store.add_channel(channel("e", Some(72)));

        let engine = SyncEngine::new(store, ScriptedSource::default());
        let report = engine.run_batch().await.unwrap();

        assert_eq!(report.channels.len(), 3);
        let ids: Vec<&str> = report
            .channels
            .iter()
            .map(|c| c.channel_id.as_str())
            .collect();
        assert_eq!(ids, vec!["UC-e", "UC-b", "UC-c"]);
    }

    #[tokio::test]
    async fn never_synced_channel_wins_over_recently_synced() {
        let store = MemoryStore::default();
        store.add_channel(channel("a", None));
        store.add_channel(channel("b", Some(1)));
        let b_watermark = store.channel_watermark("b");

        let engine = SyncEngine::new(store, ScriptedSource::default()).with_batch_size(1);
        let report = engine.run_batch().await.unwrap();

        assert_eq!(report.channels.len(), 1);
        assert_eq!(report.channels[0].channel_id, "UC-a");

        let a_watermark = engine.store.channel_watermark("a").expect("not advanced");
        assert!(Utc::now() - a_watermark < ChronoDuration::seconds(5));
        assert_eq!(engine.store.channel_watermark("b"), b_watermark);
    }

    #[tokio::test]
    async fn fetch_failure_records_history_and_batch_continues() {
        let store = MemoryStore::default();
        store.add_channel(channel("bad", Some(48)));
        store.add_channel(channel("good", Some(24)));

        let mut source = ScriptedSource::default();
        source.failures.insert(
            "UC-bad".to_string(),
            "upstream returned HTTP 403: quota exceeded".to_string(),
        );
        source
            .videos
            .insert("UC-good".to_string(), vec![video("vid-1", "UC-good")]);

        let engine = SyncEngine::new(store, source);
        let report = engine.run_batch().await.unwrap();

        assert_eq!(report.channels.len(), 2);
        assert_eq!(report.channels_synced, 1);

        let bad = &report.channels[0];
        assert_eq!(bad.status, ChannelSyncStatus::Error);
        assert!(bad.error.as_deref().unwrap().contains("403"));
        assert!(engine.store.channel_watermark("bad").is_none());

        let good = &report.channels[1];
        assert_eq!(good.status, ChannelSyncStatus::Synced);
        assert_eq!(good.videos_processed, 1);
        assert!(engine.store.channel_watermark("good").is_some());

        let history = engine.store.history_entries();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, "failed");
        assert!(history[0].error_message.as_deref().unwrap().contains("403"));
        assert_eq!(history[1].status, "success");
        assert_eq!(history[1].videos_processed, 1);
    }

    #[tokio::test]
    async fn successful_fetch_with_no_videos_still_advances_watermark() {
        let store = MemoryStore::default();
        store.add_channel(channel("quiet", Some(24)));

        let engine = SyncEngine::new(store, ScriptedSource::default());
        let report = engine.run_batch().await.unwrap();

        assert_eq!(report.channels[0].videos_processed, 0);
        assert_eq!(report.channels[0].status, ChannelSyncStatus::Synced);

        let watermark = engine.store.channel_watermark("quiet").expect("not advanced");
        assert!(Utc::now() - watermark < ChronoDuration::seconds(5));

        let history = engine.store.history_entries();
        assert_eq!(history[0].status, "success");
        assert_eq!(history[0].videos_processed, 0);
    }

    #[tokio::test]
    async fn video_db_error_fails_channel_but_not_batch() {
        let store = MemoryStore::default();
        store.add_channel(channel("first", Some(48)));
        store.add_channel(channel("second", Some(24)));
        store.poison("vid-broken");

        let mut source = ScriptedSource::default();
        source.videos.insert(
            "UC-first".to_string(),
            vec![video("vid-ok", "UC-first"), video("vid-broken", "UC-first")],
        );
        source
            .videos
            .insert("UC-second".to_string(), vec![video("vid-2", "UC-second")]);

        let engine = SyncEngine::new(store, source);
        let report = engine.run_batch().await.unwrap();

        let first = &report.channels[0];
        assert_eq!(first.status, ChannelSyncStatus::Error);
        assert!(first.error.as_deref().unwrap().contains("connection reset"));
        assert!(engine.store.channel_watermark("first").is_none());

        let second = &report.channels[1];
        assert_eq!(second.status, ChannelSyncStatus::Synced);
        assert_eq!(second.videos_processed, 1);
    }

    #[tokio::test]
    async fn empty_selection_reports_nothing_to_sync() {
        let store = MemoryStore::default();
        // Present but not flagged for auto-processing.
        let mut manual_only = channel("manual", None);
        manual_only.auto_process = false;
        store.add_channel(manual_only);

        let engine = SyncEngine::new(store, ScriptedSource::default());
        let report = engine.run_batch().await.unwrap();

        assert_eq!(report.channels_synced, 0);
        assert!(report.channels.is_empty());
        assert!(engine.store.history_entries().is_empty());
    }

    #[tokio::test]
    async fn manual_processing_of_completed_video_bumps_retry_counter() {
        let store = MemoryStore::default();
        store.insert_record(VideoProcessingRecord {
            id: "rec-1".to_string(),
            video_id: "vid-done".to_string(),
            status: ProcessingStatus::Completed.as_str().to_string(),
            title: "Done video".to_string(),
            description: String::new(),
            published_at: None,
            channel_title: "Some Channel".to_string(),
            channel_ref: "UC-a".to_string(),
            transcript: Some("old transcript".to_string()),
            error_message: None,
            retry_count: 0,
            created_at: Utc::now(),
            last_attempt_at: None,
        });

        let engine = SyncEngine::new(store, ScriptedSource::default());
        let outcome = engine.process_manual("vid-done").await.unwrap();

        assert_eq!(
            outcome,
            ManualProcessOutcome::Reprocessing {
                video_id: "vid-done".to_string(),
                record_id: "rec-1".to_string(),
                retry_count: 1,
            }
        );

        let record = engine.store.record("vid-done").unwrap();
        assert_eq!(record.status, "processing");
        assert_eq!(record.retry_count, 1);
        assert!(record.last_attempt_at.is_some());
    }

    #[tokio::test]
    async fn manual_processing_of_unknown_video_fetches_details_and_enqueues() {
        let store = MemoryStore::default();
        let mut source = ScriptedSource::default();
        source
            .details
            .insert("vid-new".to_string(), video("vid-new", "UC-a"));

        let engine = SyncEngine::new(store, source);
        let outcome = engine.process_manual("vid-new").await.unwrap();

        assert!(matches!(outcome, ManualProcessOutcome::Queued { .. }));
        let record = engine.store.record("vid-new").unwrap();
        assert_eq!(record.status, "processing");
        assert_eq!(record.channel_ref, "UC-a");
    }

    #[tokio::test]
    async fn manual_processing_of_video_unknown_upstream_is_not_found() {
        let engine = SyncEngine::new(MemoryStore::default(), ScriptedSource::default());
        let err = engine.process_manual("vid-ghost").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
