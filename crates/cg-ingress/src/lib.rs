#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-ingress** – normalizes three heterogeneous input flows into
//! canonical [`PlaybackEvent`]s and hands them to the producer WAL:
//!
//! - **Live push** (webhooks / WebSocket frames from media servers).
//! - **Periodic pull** (HTTP JSON from aggregator APIs).
//! - **Database import** (an offline scan of an aggregator's embedded
//!   SQLite activity database via [`cg_store_sqlite::BatchReader`]).
//!
//! Live push and periodic pull converge on [`RawEvent`], a flat normalized
//! shape that adapters for each transport produce; the database-import
//! path reads [`cg_store_sqlite::RawImportRecord`] batches directly, since
//! its resumability and batching concerns don't apply to the other two
//! flows.

use async_trait::async_trait;
use cg_identity::{generate_correlation_key, generate_event_id};
use cg_progress::{ProgressError, ProgressTracker};
use cg_store_sqlite::{BatchReader, ImportSourceError, RawImportRecord};
use cg_types::{ImportStats, PlaybackEvent};
use cg_wal::WalError;
use chrono::{DateTime, Utc};

/// Errors raised while normalizing or submitting an ingress input.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    /// A required field was missing or empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    /// `UserID` was present but not a positive integer.
    #[error("user id must be a positive integer, got {0:?}")]
    InvalidUserId(Option<String>),
    /// The submission sink rejected the event.
    #[error("submission failed: {0}")]
    Submit(String),
    /// The producer WAL rejected the write.
    #[error(transparent)]
    Wal(#[from] WalError),
    /// The progress tracker failed to load or save a checkpoint.
    #[error(transparent)]
    Progress(#[from] ProgressError),
    /// The source database could not be read.
    #[error(transparent)]
    Source(#[from] ImportSourceError),
}

/// The sink a normalized event is submitted through once it has passed
/// validation. The producer WAL is the only real implementation; the
/// trait exists so the importer can be driven in tests without one.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Durably record `event` for eventual bus delivery.
    async fn submit(&self, event: &PlaybackEvent) -> Result<(), IngressError>;
}

#[async_trait]
impl<S: cg_store_core::EntryStore> EventSink for cg_wal::ProducerWal<S> {
    async fn submit(&self, event: &PlaybackEvent) -> Result<(), IngressError> {
        let payload = serde_json::to_vec(event)
            .map_err(|e| IngressError::Submit(e.to_string()))?;
        self.write(payload).await?;
        Ok(())
    }
}

/// A flat, already-transport-decoded input record, shared by the live
/// push and periodic pull flows. Adapters for a specific media server's
/// webhook or polling API are responsible for producing this shape;
/// normalization and validation beyond that point are transport-agnostic.
#[derive(Debug, Clone, Default)]
pub struct RawEvent {
    /// Provenance tag, e.g. `plex`, `jellyfin`, `emby`.
    pub source: String,
    /// Media-server instance identifier.
    pub server_id: String,
    /// Session key assigned by the media server.
    pub session_key: Option<String>,
    /// Playback start time.
    pub started_at: Option<DateTime<Utc>>,
    /// Playback stop time, if known.
    pub stopped_at: Option<DateTime<Utc>>,
    /// Numeric user id, as text (validated as a positive integer).
    pub user_id: Option<String>,
    /// Display username; required for validation but not carried into
    /// the canonical event, which identifies users by `user_id` alone.
    pub username: Option<String>,
    /// Client IP address. `""` or `"N/A"` are treated as missing.
    pub ip_address: Option<String>,
    /// `movie`, `episode`, `track`, etc.
    pub media_type: Option<String>,
    /// Title of the media played.
    pub title: Option<String>,
    /// Library rating key, for correlation-key derivation.
    pub rating_key: Option<String>,
    /// Player/device machine id, for correlation-key derivation.
    pub machine_id: Option<String>,
    /// Show title, for episodes.
    pub grandparent_title: Option<String>,
    /// Season title, for episodes.
    pub parent_title: Option<String>,
    /// Season number, for episodes.
    pub season_number: Option<i64>,
    /// Episode number, for episodes.
    pub episode_number: Option<i64>,
    /// Output video resolution.
    pub video_resolution: Option<String>,
    /// Output video codec.
    pub video_codec: Option<String>,
    /// Output audio codec.
    pub audio_codec: Option<String>,
    /// Stream bitrate in kbps.
    pub bitrate: Option<i64>,
    /// `direct play`, `copy`, or `transcode`.
    pub transcode_decision: Option<String>,
    /// Player application name.
    pub player: Option<String>,
    /// Client platform.
    pub platform: Option<String>,
}

fn is_present(field: &Option<String>) -> bool {
    matches!(field, Some(s) if !s.trim().is_empty())
}

fn ip_is_known(ip: &Option<String>) -> bool {
    matches!(ip, Some(s) if !s.is_empty() && s != "N/A")
}

fn positive_user_id(user_id: &Option<String>) -> Result<i64, IngressError> {
    match user_id.as_deref().map(str::trim) {
        Some(s) if !s.is_empty() => s
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| IngressError::InvalidUserId(user_id.clone())),
        _ => Err(IngressError::InvalidUserId(None)),
    }
}

/// Validate a [`RawEvent`] against its required fields: `session_key`,
/// `started_at`, `user_id > 0`, `username`, `ip_address ∉ {"", "N/A"}`,
/// `media_type`, `title`.
pub fn validate_raw_event(event: &RawEvent) -> Result<(), IngressError> {
    if !is_present(&event.session_key) {
        return Err(IngressError::MissingField("session_key"));
    }
    if event.started_at.is_none() {
        return Err(IngressError::MissingField("started_at"));
    }
    positive_user_id(&event.user_id)?;
    if !is_present(&event.username) {
        return Err(IngressError::MissingField("username"));
    }
    if !ip_is_known(&event.ip_address) {
        return Err(IngressError::MissingField("ip_address"));
    }
    if !is_present(&event.media_type) {
        return Err(IngressError::MissingField("media_type"));
    }
    if !is_present(&event.title) {
        return Err(IngressError::MissingField("title"));
    }
    Ok(())
}

/// Normalize an already-validated [`RawEvent`] into a canonical
/// [`PlaybackEvent`], deriving `event_id` and `correlation_key` via
/// `cg-identity`.
///
/// Callers MUST run [`validate_raw_event`] first; this performs no
/// validation of its own beyond what's needed to not panic.
pub fn normalize(event: RawEvent) -> PlaybackEvent {
    let user_id = event.user_id.clone().unwrap_or_default();
    let started_at = event.started_at.unwrap_or_else(cg_types::ImportStats::zero_time);
    let session_key = event.session_key.clone().unwrap_or_default();
    let title = event.title.clone().unwrap_or_default();

    let event_id = generate_event_id(
        &event.source,
        &event.server_id,
        &user_id,
        &session_key,
        started_at,
    );
    let correlation_key = generate_correlation_key(
        &event.source,
        &event.server_id,
        &user_id,
        event.rating_key.as_deref(),
        event.machine_id.as_deref(),
        started_at,
        &session_key,
        &title,
    );

    PlaybackEvent {
        event_id,
        source: event.source,
        server_id: event.server_id,
        user_id,
        session_key,
        media_type: event.media_type.unwrap_or_default(),
        title,
        started_at,
        ip_address: event.ip_address.unwrap_or_default(),
        correlation_key: Some(correlation_key),
        grandparent_title: event.grandparent_title,
        parent_title: event.parent_title,
        season_number: event.season_number,
        episode_number: event.episode_number,
        video_resolution: event.video_resolution,
        video_codec: event.video_codec,
        audio_codec: event.audio_codec,
        bitrate: event.bitrate,
        transcode_decision: event.transcode_decision,
        machine_id: event.machine_id,
        player: event.player,
        platform: event.platform,
        stopped_at: event.stopped_at,
    }
}

fn from_import_record(source: &str, record: &RawImportRecord) -> RawEvent {
    RawEvent {
        source: source.to_string(),
        server_id: record.server_id.clone().unwrap_or_default(),
        session_key: record.session_key.clone(),
        started_at: record.started_at,
        stopped_at: record.stopped_at,
        user_id: if record.user_id > 0 {
            Some(record.user_id.to_string())
        } else {
            None
        },
        username: record.username.clone(),
        ip_address: record.ip_address.clone(),
        media_type: record.media_type.clone(),
        title: record.title.clone(),
        rating_key: None,
        machine_id: None,
        grandparent_title: record.grandparent_title.clone(),
        parent_title: record.parent_title.clone(),
        season_number: None,
        episode_number: None,
        video_resolution: None,
        video_codec: None,
        audio_codec: None,
        bitrate: None,
        transcode_decision: record.transcode_decision.clone(),
        player: record.player.clone(),
        platform: record.platform.clone(),
    }
}

/// Configuration for one database-import run.
#[derive(Debug, Clone)]
pub struct ImporterConfig {
    /// Provenance tag stamped onto every imported event, and the key
    /// progress is tracked under.
    pub source: String,
    /// Rows requested per [`BatchReader::read_batch`] call.
    pub batch_size: i64,
    /// Operator-supplied starting cursor. The importer actually resumes
    /// from `max(configured_resume_id, stored progress)`.
    pub configured_resume_id: i64,
    /// Run end-to-end but skip both submission and progress persistence.
    pub dry_run: bool,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            source: "import".to_string(),
            batch_size: 500,
            configured_resume_id: 0,
            dry_run: false,
        }
    }
}

/// Outcome of a single [`Importer::run_batch`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows read from the source in this batch.
    pub read: usize,
    /// Rows that passed validation and were submitted (or would have
    /// been, in dry-run mode).
    pub processed: usize,
    /// Rows that failed validation and were skipped.
    pub skipped: usize,
}

/// Drives the database-import flow: reads batches via a [`BatchReader`],
/// normalizes and validates each row, submits survivors through an
/// [`EventSink`], and checkpoints progress via a [`ProgressTracker`].
pub struct Importer<R, T, P> {
    reader: R,
    sink: T,
    progress: P,
    config: ImporterConfig,
}

impl<R: BatchReader, T: EventSink, P: ProgressTracker> Importer<R, T, P> {
    /// Build an importer over the given reader, sink, and progress
    /// tracker.
    pub fn new(reader: R, sink: T, progress: P, config: ImporterConfig) -> Self {
        Self {
            reader,
            sink,
            progress,
            config,
        }
    }

    /// Resume cursor for this run: `max(configured_resume_id, stored
    /// last_processed_id)`.
    pub async fn resume_cursor(&self) -> Result<i64, IngressError> {
        let stored = self.progress.load(&self.config.source).await?;
        Ok(self.config.configured_resume_id.max(stored.last_processed_id))
    }

    /// Read and process exactly one batch starting after `since_id`.
    /// Progress is persisted at this batch boundary (unless dry-run),
    /// advancing past every row read regardless of validation outcome —
    /// the cursor tracks what was *read*, not what was valid.
    pub async fn run_batch(&self, since_id: i64) -> Result<(BatchOutcome, i64), IngressError> {
        let batch = self
            .reader
            .read_batch(since_id, self.config.batch_size)
            .await?;

        let mut outcome = BatchOutcome {
            read: batch.len(),
            ..Default::default()
        };
        let mut cursor = since_id;

        for record in &batch {
            cursor = record.id;
            let raw = from_import_record(&self.config.source, record);

            let submitted = match validate_raw_event(&raw) {
                Ok(()) => {
                    let event = normalize(raw);
                    match event.validate() {
                        Ok(()) => {
                            if !self.config.dry_run {
                                self.sink.submit(&event).await?;
                            }
                            true
                        }
                        Err(e) => {
                            tracing::debug!(id = record.id, error = %e, "ingress: skipping invalid record");
                            false
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(id = record.id, error = %e, "ingress: skipping invalid record");
                    false
                }
            };

            if submitted {
                outcome.processed += 1;
            } else {
                outcome.skipped += 1;
            }
        }

        if !self.config.dry_run && !batch.is_empty() {
            let mut stats = self.progress.load(&self.config.source).await?;
            if stats.is_unset() {
                stats.start_time = Utc::now();
            }
            stats.last_processed_id = cursor;
            stats.last_updated = Utc::now();
            stats.records_processed += outcome.processed as u64;
            stats.records_skipped += outcome.skipped as u64;
            self.progress.save(&stats).await?;
        }

        Ok((outcome, cursor))
    }

    /// Run batches until the source is exhausted (a batch reads fewer
    /// rows than requested, or zero rows), starting from
    /// [`Importer::resume_cursor`].
    pub async fn run_to_completion(&self) -> Result<ImportStats, IngressError> {
        let mut cursor = self.resume_cursor().await?;
        loop {
            let (outcome, new_cursor) = self.run_batch(cursor).await?;
            cursor = new_cursor;
            if (outcome.read as i64) < self.config.batch_size {
                break;
            }
        }
        self.progress.load(&self.config.source).await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cg_progress::InMemoryProgressTracker;
    use chrono::TimeZone;
    use std::sync::Mutex;

    fn sample(id: i64) -> RawImportRecord {
        RawImportRecord {
            id,
            session_key: Some(format!("session-{id}")),
            started_at: Some(Utc::now()),
            stopped_at: None,
            user_id: 100 + id,
            username: Some(format!("user-{id}")),
            ip_address: Some("10.0.0.1".to_string()),
            media_type: Some("episode".to_string()),
            title: Some(format!("Title {id}")),
            grandparent_title: None,
            parent_title: None,
            server_id: Some("server-1".to_string()),
            player: None,
            platform: None,
            transcode_decision: None,
        }
    }

    struct FakeReader {
        records: Vec<RawImportRecord>,
    }

    #[async_trait]
    impl BatchReader for FakeReader {
        async fn read_batch(
            &self,
            since_id: i64,
            limit: i64,
        ) -> Result<Vec<RawImportRecord>, ImportSourceError> {
            Ok(self
                .records
                .iter()
                .filter(|r| r.id > since_id)
                .take(limit as usize)
                .cloned()
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeSink {
        submitted: Mutex<Vec<PlaybackEvent>>,
    }

    #[async_trait]
    impl EventSink for FakeSink {
        async fn submit(&self, event: &PlaybackEvent) -> Result<(), IngressError> {
            self.submitted.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    #[test]
    fn validation_rejects_missing_required_fields() {
        let mut event = RawEvent {
            source: "plex".into(),
            server_id: "server-1".into(),
            session_key: Some("s1".into()),
            started_at: Some(Utc::now()),
            user_id: Some("5".into()),
            username: Some("alice".into()),
            ip_address: Some("10.0.0.1".into()),
            media_type: Some("movie".into()),
            title: Some("Arrival".into()),
            ..Default::default()
        };
        assert!(validate_raw_event(&event).is_ok());

        event.ip_address = Some("N/A".into());
        assert!(matches!(
            validate_raw_event(&event),
            Err(IngressError::MissingField("ip_address"))
        ));

        event.ip_address = Some("10.0.0.1".into());
        event.user_id = Some("0".into());
        assert!(matches!(
            validate_raw_event(&event),
            Err(IngressError::InvalidUserId(_))
        ));
    }

    #[test]
    fn normalize_derives_a_stable_event_id() {
        let event = RawEvent {
            source: "plex".into(),
            server_id: "server-1".into(),
            session_key: Some("s1".into()),
            started_at: Some(Utc.timestamp_opt(1_700_000_000, 0).unwrap()),
            user_id: Some("5".into()),
            username: Some("alice".into()),
            ip_address: Some("10.0.0.1".into()),
            media_type: Some("movie".into()),
            title: Some("Arrival".into()),
            ..Default::default()
        };
        let a = normalize(event.clone());
        let b = normalize(event);
        assert_eq!(a.event_id, b.event_id);
        assert!(a.validate().is_ok());
    }

    #[tokio::test]
    async fn run_batch_submits_valid_records_and_advances_the_cursor() {
        let reader = FakeReader {
            records: (1..=3).map(sample).collect(),
        };
        let sink = FakeSink::default();
        let progress = InMemoryProgressTracker::new();
        let config = ImporterConfig {
            source: "plex".into(),
            batch_size: 10,
            ..Default::default()
        };
        let importer = Importer::new(reader, sink, progress, config);

        let (outcome, cursor) = importer.run_batch(0).await.unwrap();
        assert_eq!(outcome.read, 3);
        assert_eq!(outcome.processed, 3);
        assert_eq!(outcome.skipped, 0);
        assert_eq!(cursor, 3);
        assert_eq!(importer.sink.submitted.lock().unwrap().len(), 3);

        let stats = importer.progress.load("plex").await.unwrap();
        assert_eq!(stats.last_processed_id, 3);
        assert_eq!(stats.records_processed, 3);
    }

    #[tokio::test]
    async fn invalid_rows_are_skipped_but_still_advance_the_cursor() {
        let mut bad = sample(2);
        bad.username = None;
        let reader = FakeReader {
            records: vec![sample(1), bad, sample(3)],
        };
        let sink = FakeSink::default();
        let progress = InMemoryProgressTracker::new();
        let importer = Importer::new(
            reader,
            sink,
            progress,
            ImporterConfig {
                source: "plex".into(),
                batch_size: 10,
                ..Default::default()
            },
        );

        let (outcome, cursor) = importer.run_batch(0).await.unwrap();
        assert_eq!(outcome.processed, 2);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(cursor, 3);
    }

    #[tokio::test]
    async fn dry_run_skips_submission_and_progress_persistence() {
        let reader = FakeReader {
            records: (1..=2).map(sample).collect(),
        };
        let sink = FakeSink::default();
        let progress = InMemoryProgressTracker::new();
        let importer = Importer::new(
            reader,
            sink,
            progress,
            ImporterConfig {
                source: "plex".into(),
                batch_size: 10,
                dry_run: true,
                ..Default::default()
            },
        );

        let (outcome, _) = importer.run_batch(0).await.unwrap();
        assert_eq!(outcome.processed, 2);
        assert!(importer.sink.submitted.lock().unwrap().is_empty());
        assert!(importer.progress.load("plex").await.unwrap().is_unset());
    }

    #[tokio::test]
    async fn resume_cursor_takes_the_max_of_configured_and_stored() {
        let progress = InMemoryProgressTracker::new();
        progress
            .save(&ImportStats {
                source: "plex".into(),
                last_processed_id: 50,
                start_time: Utc::now(),
                last_updated: Utc::now(),
                records_processed: 50,
                records_skipped: 0,
            })
            .await
            .unwrap();

        let reader = FakeReader { records: vec![] };
        let sink = FakeSink::default();
        let importer = Importer::new(
            reader,
            sink,
            progress,
            ImporterConfig {
                source: "plex".into(),
                configured_resume_id: 10,
                ..Default::default()
            },
        );
        assert_eq!(importer.resume_cursor().await.unwrap(), 50);

        let progress2 = InMemoryProgressTracker::new();
        let reader2 = FakeReader { records: vec![] };
        let sink2 = FakeSink::default();
        let importer2 = Importer::new(
            reader2,
            sink2,
            progress2,
            ImporterConfig {
                source: "plex".into(),
                configured_resume_id: 99,
                ..Default::default()
            },
        );
        assert_eq!(importer2.resume_cursor().await.unwrap(), 99);
    }

    #[tokio::test]
    async fn run_to_completion_drains_multiple_batches() {
        let reader = FakeReader {
            records: (1..=5).map(sample).collect(),
        };
        let sink = FakeSink::default();
        let progress = InMemoryProgressTracker::new();
        let importer = Importer::new(
            reader,
            sink,
            progress,
            ImporterConfig {
                source: "plex".into(),
                batch_size: 2,
                ..Default::default()
            },
        );

        let stats = importer.run_to_completion().await.unwrap();
        assert_eq!(stats.last_processed_id, 5);
        assert_eq!(stats.records_processed, 5);
        assert_eq!(importer.sink.submitted.lock().unwrap().len(), 5);
    }
}
