#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-types** – Shared primitive data structures for the cartographus
//! event pipeline.
//!
//! The crate is dependency-light and sits at the very bottom of the crate
//! graph so that every other crate can depend on it without causing cycles.
//! It makes no assumptions about I/O, storage backends, or the message bus.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Maximum allowed length for a event `Title`, guarding against
/// pathological upstream payloads before they hit the WAL.
pub const MAX_TITLE_LEN: usize = 4096;

/// Sentinel IP value that upstream sources use to mean "unknown"; treated
/// as missing for validation purposes.
pub const IP_UNKNOWN_SENTINEL: &str = "N/A";

//─────────────────────────────
//  Canonical playback event
//─────────────────────────────

/// A single playback event, normalized from any ingestion source into the
/// canonical shape the rest of the pipeline operates on.
///
/// `event_id` and `correlation_key` are derived deterministically (see
/// `cg-identity`) from the required fields below; this crate only carries
/// the data, it does not derive it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackEvent {
    /// Deterministic identifier, globally unique per logical event.
    pub event_id: uuid::Uuid,
    /// Provenance tag, e.g. `plex`, `jellyfin`, `emby`, `tautulli`,
    /// `tautulli-import`.
    pub source: String,
    /// Media-server instance identifier.
    pub server_id: String,
    /// Playing user identifier.
    pub user_id: String,
    /// Session key assigned by the media server.
    pub session_key: String,
    /// `movie`, `episode`, `track`, etc.
    pub media_type: String,
    /// Human-readable title.
    pub title: String,
    /// UTC start timestamp.
    pub started_at: DateTime<Utc>,
    /// Client IP address. `"N/A"` is treated as missing.
    pub ip_address: String,
    /// Cross-source deduplication fingerprint, populated at creation time.
    pub correlation_key: Option<String>,

    /// Episode hierarchy: show title, if this is an episode.
    pub grandparent_title: Option<String>,
    /// Episode hierarchy: season title, if this is an episode.
    pub parent_title: Option<String>,
    /// Season number, if this is an episode.
    pub season_number: Option<i64>,
    /// Episode number within the season.
    pub episode_number: Option<i64>,

    /// Output video resolution, e.g. `1080`.
    pub video_resolution: Option<String>,
    /// Output video codec, e.g. `h264`.
    pub video_codec: Option<String>,
    /// Output audio codec, e.g. `aac`.
    pub audio_codec: Option<String>,
    /// Stream bitrate in kbps.
    pub bitrate: Option<i64>,
    /// `direct play`, `copy`, or `transcode`.
    pub transcode_decision: Option<String>,

    /// Source-reported machine/device identifier, used for cross-source
    /// correlation.
    pub machine_id: Option<String>,
    /// Player application name.
    pub player: Option<String>,
    /// Client platform, e.g. `Chrome`, `Roku`.
    pub platform: Option<String>,

    /// UTC stop timestamp, populated once the session ends.
    pub stopped_at: Option<DateTime<Utc>>,
}

/// Reasons a [`PlaybackEvent`] fails validation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EventValidationError {
    /// A required field was empty.
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    /// `ip_address` was empty or the `"N/A"` sentinel.
    #[error("ip address missing or unknown")]
    UnknownIpAddress,
    /// `title` exceeded [`MAX_TITLE_LEN`].
    #[error("title too long: {0} > {MAX_TITLE_LEN}", MAX_TITLE_LEN = MAX_TITLE_LEN)]
    TitleTooLong(usize),
}

impl PlaybackEvent {
    /// Validate the required semantic attributes.
    ///
    /// The event is invalid if any required field is missing or if
    /// `ip_address == "N/A"`.
    pub fn validate(&self) -> Result<(), EventValidationError> {
        if self.source.trim().is_empty() {
            return Err(EventValidationError::MissingField("source"));
        }
        if self.server_id.trim().is_empty() {
            return Err(EventValidationError::MissingField("server_id"));
        }
        if self.user_id.trim().is_empty() {
            return Err(EventValidationError::MissingField("user_id"));
        }
        if self.session_key.trim().is_empty() {
            return Err(EventValidationError::MissingField("session_key"));
        }
        if self.media_type.trim().is_empty() {
            return Err(EventValidationError::MissingField("media_type"));
        }
        if self.title.trim().is_empty() {
            return Err(EventValidationError::MissingField("title"));
        }
        if self.title.len() > MAX_TITLE_LEN {
            return Err(EventValidationError::TitleTooLong(self.title.len()));
        }
        if self.ip_address.is_empty() || self.ip_address == IP_UNKNOWN_SENTINEL {
            return Err(EventValidationError::UnknownIpAddress);
        }
        Ok(())
    }
}

//─────────────────────────────
//  WAL entry (shared producer/consumer WAL shape)
//─────────────────────────────

/// The three mutually exclusive states a WAL entry can occupy.
/// Represented on disk as a key-prefix, not a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntryState {
    /// Not yet confirmed or permanently failed; eligible for retry/recovery.
    Pending,
    /// Terminal success state.
    Confirmed,
    /// Terminal failure state (C-WAL only).
    FailedPermanent,
}

impl WalEntryState {
    /// The on-disk key prefix for this state.
    pub fn key_prefix(self) -> &'static str {
        match self {
            WalEntryState::Pending => "pending",
            WalEntryState::Confirmed => "confirmed",
            WalEntryState::FailedPermanent => "failed",
        }
    }
}

/// A single entry in a write-ahead log.
///
/// The producer and consumer WAL share this shape; fields that only
/// apply to the consumer side (`transaction_id`, `subject`, `message_id`)
/// are `None` on the producer side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Fresh UUID per entry; distinct from `PlaybackEvent::event_id` —
    /// multiple WAL entries may share an `event_id` across retries.
    pub id: uuid::Uuid,
    /// Opaque serialized event bytes.
    pub payload: Vec<u8>,
    /// Creation timestamp, used for TTL expiry.
    pub created_at: DateTime<Utc>,
    /// Number of processing attempts so far.
    pub attempts: u32,
    /// Timestamp of the most recent attempt, if any.
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Error string from the most recent failed attempt.
    pub last_error: Option<String>,

    /// Set once the entry reaches the terminal `Confirmed` state.
    pub confirmed: bool,
    /// Timestamp of confirmation.
    pub confirmed_at: Option<DateTime<Utc>>,

    /// Set once the entry reaches the terminal `FailedPermanent` state
    /// (C-WAL only).
    pub failed_permanent: bool,
    /// Timestamp of the terminal failure.
    pub failed_at: Option<DateTime<Utc>>,
    /// Human-readable reason for the terminal failure.
    pub failure_reason: Option<String>,

    /// Durable lease expiry. `None` means unleased.
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Current lease holder identifier.
    pub lease_holder: Option<String>,

    /// C-WAL only: idempotency token presented to the analytical store.
    pub transaction_id: Option<String>,
    /// C-WAL only: bus subject the message was delivered on.
    pub subject: Option<String>,
    /// C-WAL only: bus-assigned message identifier.
    pub message_id: Option<String>,
}

impl WalEntry {
    /// Construct a fresh pending P-WAL entry for `payload`.
    pub fn new_pending(payload: Vec<u8>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            payload,
            created_at: now,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            confirmed: false,
            confirmed_at: None,
            failed_permanent: false,
            failed_at: None,
            failure_reason: None,
            lease_expiry: None,
            lease_holder: None,
            transaction_id: None,
            subject: None,
            message_id: None,
        }
    }

    /// Construct a fresh pending C-WAL entry carrying bus/idempotency
    /// metadata.
    pub fn new_consumer_pending(
        payload: Vec<u8>,
        transaction_id: String,
        subject: Option<String>,
        message_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut entry = Self::new_pending(payload, now);
        entry.transaction_id = Some(transaction_id);
        entry.subject = subject;
        entry.message_id = message_id;
        entry
    }

    /// The entry's current state (always exactly one).
    pub fn state(&self) -> WalEntryState {
        if self.confirmed {
            WalEntryState::Confirmed
        } else if self.failed_permanent {
            WalEntryState::FailedPermanent
        } else {
            WalEntryState::Pending
        }
    }

    /// Age of the entry relative to `now`, used for TTL expiry checks.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

//─────────────────────────────
//  Progress tracker state
//─────────────────────────────

/// Resumable checkpoint for an aggregator-DB import, persisted as a single
/// JSON value under `import:{source}:progress`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStats {
    /// Source tag the progress belongs to.
    pub source: String,
    /// Highest `id` successfully processed so far.
    pub last_processed_id: i64,
    /// When this import run first started.
    pub start_time: DateTime<Utc>,
    /// When this checkpoint was last updated.
    pub last_updated: DateTime<Utc>,
    /// Total records processed across the import's lifetime.
    pub records_processed: u64,
    /// Total records skipped (failed validation).
    pub records_skipped: u64,
}

impl ImportStats {
    /// The Go-style zero `time.Time` value: no progress has ever been
    /// recorded. Mirrors the original "`StartTime` is zero means no
    /// progress" sentinel rather than introducing a second optional field.
    pub fn zero_time() -> DateTime<Utc> {
        DateTime::<Utc>::from_naive_utc_and_offset(
            NaiveDate::from_ymd_opt(1, 1, 1)
                .expect("valid calendar date")
                .and_hms_opt(0, 0, 0)
                .expect("valid time"),
            Utc,
        )
    }

    /// A fresh, empty checkpoint for `source`.
    pub fn empty(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            last_processed_id: 0,
            start_time: Self::zero_time(),
            last_updated: Self::zero_time(),
            records_processed: 0,
            records_skipped: 0,
        }
    }

    /// True when no progress has ever been recorded for this source.
    pub fn is_unset(&self) -> bool {
        self.start_time == Self::zero_time()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> PlaybackEvent {
        PlaybackEvent {
            event_id: uuid::Uuid::new_v4(),
            source: "plex".into(),
            server_id: "srv1".into(),
            user_id: "user1".into(),
            session_key: "sess1".into(),
            media_type: "episode".into(),
            title: "Pilot".into(),
            started_at: Utc::now(),
            ip_address: "10.0.0.1".into(),
            correlation_key: None,
            grandparent_title: None,
            parent_title: None,
            season_number: None,
            episode_number: None,
            video_resolution: None,
            video_codec: None,
            audio_codec: None,
            bitrate: None,
            transcode_decision: None,
            machine_id: None,
            player: None,
            platform: None,
            stopped_at: None,
        }
    }

    #[test]
    fn valid_event_passes() {
        assert!(sample_event().validate().is_ok());
    }

    #[test]
    fn missing_title_is_rejected() {
        let mut event = sample_event();
        event.title.clear();
        assert_eq!(
            event.validate(),
            Err(EventValidationError::MissingField("title"))
        );
    }

    #[test]
    fn na_ip_is_rejected() {
        let mut event = sample_event();
        event.ip_address = "N/A".into();
        assert_eq!(event.validate(), Err(EventValidationError::UnknownIpAddress));
    }

    #[test]
    fn wal_entry_state_is_exclusive() {
        let mut entry = WalEntry::new_pending(vec![1, 2, 3], Utc::now());
        assert_eq!(entry.state(), WalEntryState::Pending);

        entry.confirmed = true;
        assert_eq!(entry.state(), WalEntryState::Confirmed);
    }

    #[test]
    fn import_stats_round_trips() {
        let stats = ImportStats {
            source: "tautulli-import".into(),
            last_processed_id: 42,
            start_time: Utc::now(),
            last_updated: Utc::now(),
            records_processed: 10,
            records_skipped: 1,
        };
        let json = serde_json::to_string(&stats).unwrap();
        let round_tripped: ImportStats = serde_json::from_str(&json).unwrap();
        assert_eq!(stats, round_tripped);
    }

    #[test]
    fn empty_import_stats_is_unset() {
        assert!(ImportStats::empty("plex").is_unset());
    }
}
