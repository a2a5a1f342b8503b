#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **cg-identity** – Deterministic event identity and cross-source
//! correlation.
//!
//! Every function here is a pure mapping from its inputs to an identifier;
//! none of them touch the clock except to *consume* a caller-supplied
//! timestamp, and none of them touch global state. `GenerateTransactionID`
//! needs a monotonic counter, so instead of a process-global static it
//! takes an injected [`TransactionCounter`] — tests construct a fresh one
//! per test rather than relying on a `ResetCounter` primitive.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Namespace UUID used for the version-5 event-id hash. Fixed so that
/// `GenerateEventID` is reproducible across processes and restarts
/// (invariant: `GenerateEventID(x) == GenerateEventID(x)` for all calls).
const EVENT_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x8f, 0x1a, 0x5c, 0x2d, 0x6b, 0x4e, 0x4a, 0x91, 0xb3, 0x7d, 0x2e, 0x0c, 0x9a, 0x5f, 0x61, 0x44,
]);

/// Literal substituted for a missing `machine_id` when deriving a
/// correlation key.
const UNKNOWN_MACHINE_ID: &str = "unknown";

/// Deterministically derive an [`Uuid`] from the fields that define a
/// logical playback event: `(source, server_id, user_id, session_key,
/// started_at)` maps to exactly one `EventID` for all time.
///
/// Uses a version-5 (namespace + SHA-1) UUID so two processes that see the
/// same inputs — live push and a later DB import of the same session, for
/// instance — compute the same id without coordination.
pub fn generate_event_id(
    source: &str,
    server_id: &str,
    user_id: &str,
    session_key: &str,
    started_at: DateTime<Utc>,
) -> Uuid {
    let name = format!(
        "{source}:{server_id}:{user_id}:{session_key}:{}",
        started_at.format("%Y-%m-%dT%H:%M:%S")
    );
    Uuid::new_v5(&EVENT_ID_NAMESPACE, name.as_bytes())
}

/// Derive the textual correlation key used for cross-source deduplication:
///
/// `"{source}:{server_id}:{user_id}:{rating_key}:{machine_id}:{time}:{session_key}"`
///
/// `rating_key`, when missing or empty, is replaced by the first 16 hex
/// characters of a SHA-256 digest over `title`. `machine_id`, when missing,
/// is replaced by the literal `"unknown"`. `started_at` is normalized to
/// UTC second precision.
pub fn generate_correlation_key(
    source: &str,
    server_id: &str,
    user_id: &str,
    rating_key: Option<&str>,
    machine_id: Option<&str>,
    started_at: DateTime<Utc>,
    session_key: &str,
    title: &str,
) -> String {
    let rating_key = match rating_key {
        Some(rk) if !rk.is_empty() => rk.to_string(),
        _ => title_fallback_key(title),
    };
    let machine_id = match machine_id {
        Some(mid) if !mid.is_empty() => mid.to_string(),
        _ => UNKNOWN_MACHINE_ID.to_string(),
    };
    let bucket = started_at.format("%Y-%m-%dT%H:%M:%S");

    format!("{source}:{server_id}:{user_id}:{rating_key}:{machine_id}:{bucket}:{session_key}")
}

/// First 16 hex characters of SHA-256(`title`), used as a `rating_key`
/// substitute when the upstream source didn't supply one.
fn title_fallback_key(title: &str) -> String {
    let digest = Sha256::digest(title.as_bytes());
    let hex = hex_encode(&digest);
    hex[..16].to_string()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Extract the cross-source substring of a correlation key: the portion
/// starting after the 1st `:` (past `source`) and ending before the last
/// `:` (before `session_key`) — i.e.
/// `server_id:user_id:rating_key:machine_id:time-bucket`.
///
/// Equality of this substring across two correlation keys is the
/// authoritative "same playback" test across distinct ingestion sources.
pub fn cross_source_key(correlation_key: &str) -> Option<&str> {
    let mut colon_indices = correlation_key
        .char_indices()
        .filter(|&(_, c)| c == ':')
        .map(|(i, _)| i);

    // Skip past the 1st colon (source|server_id:...).
    let start = colon_indices.next()? + 1;
    let last = correlation_key.rfind(':')?;
    if last <= start {
        return None;
    }
    Some(&correlation_key[start..last])
}

/// Process-local, injectable counter backing [`generate_transaction_id`].
///
/// Abstracted as a struct (rather than a bare `AtomicU64` static) so tests
/// can construct a fresh counter instead of relying on a global reset
/// primitive.
#[derive(Clone, Debug, Default)]
pub struct TransactionCounter {
    value: Arc<AtomicU64>,
}

impl TransactionCounter {
    /// A counter starting at zero.
    pub fn new() -> Self {
        Self {
            value: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Atomically fetch the current value and increment it.
    pub fn fetch_add(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst)
    }
}

/// Derive a `TransactionID`: `"{source}:{event_id}:{n}"`, where `n` comes
/// from `counter`.
///
/// Stable across retries of the same delivery as long as the same
/// `(source, event_id)` pair keeps producing a fresh sequence number;
/// guaranteed unique within the process that owns `counter`.
pub fn generate_transaction_id(source: &str, event_id: Uuid, counter: &TransactionCounter) -> String {
    let n = counter.fetch_add();
    format!("{source}:{event_id}:{n}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn event_id_is_deterministic() {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let a = generate_event_id("plex", "srv1", "user1", "sess1", started_at);
        let b = generate_event_id("plex", "srv1", "user1", "sess1", started_at);
        assert_eq!(a, b);
    }

    #[test]
    fn event_id_differs_on_session_key() {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let a = generate_event_id("plex", "srv1", "user1", "sess1", started_at);
        let b = generate_event_id("plex", "srv1", "user1", "sess2", started_at);
        assert_ne!(a, b);
    }

    #[test]
    fn cross_source_key_matches_across_sources() {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let plex_key = generate_correlation_key(
            "plex", "srv1", "user1", Some("12345"), Some("dev1"), started_at, "sess-ws", "Pilot",
        );
        let import_key = generate_correlation_key(
            "tautulli-import",
            "srv1",
            "user1",
            Some("12345"),
            Some("dev1"),
            started_at,
            "sess-import",
            "Pilot",
        );

        assert_ne!(plex_key, import_key);
        assert_eq!(
            cross_source_key(&plex_key),
            cross_source_key(&import_key)
        );
    }

    #[test]
    fn cross_source_key_differs_when_server_user_or_rating_key_differ() {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let base = generate_correlation_key(
            "plex", "srv1", "user1", Some("12345"), Some("dev1"), started_at, "sess-ws", "Pilot",
        );

        let different_server = generate_correlation_key(
            "tautulli-import", "srv2", "user1", Some("12345"), Some("dev1"), started_at,
            "sess-import", "Pilot",
        );
        let different_user = generate_correlation_key(
            "tautulli-import", "srv1", "user2", Some("12345"), Some("dev1"), started_at,
            "sess-import", "Pilot",
        );
        let different_rating_key = generate_correlation_key(
            "tautulli-import", "srv1", "user1", Some("99999"), Some("dev1"), started_at,
            "sess-import", "Pilot",
        );

        assert_ne!(cross_source_key(&base), cross_source_key(&different_server));
        assert_ne!(cross_source_key(&base), cross_source_key(&different_user));
        assert_ne!(cross_source_key(&base), cross_source_key(&different_rating_key));
    }

    #[test]
    fn missing_rating_key_falls_back_to_title_hash() {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let key = generate_correlation_key(
            "plex", "srv1", "user1", None, Some("dev1"), started_at, "sess1", "Pilot",
        );
        assert!(key.contains(":dev1:"));
        // rating key segment should be 16 hex chars, not empty
        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts[3].len(), 16);
    }

    #[test]
    fn missing_machine_id_uses_unknown_literal() {
        let started_at = Utc.with_ymd_and_hms(2024, 1, 15, 10, 0, 0).unwrap();
        let key = generate_correlation_key(
            "plex", "srv1", "user1", Some("12345"), None, started_at, "sess1", "Pilot",
        );
        assert!(key.contains(":unknown:"));
    }

    #[test]
    fn transaction_ids_increment_and_are_unique() {
        let counter = TransactionCounter::new();
        let event_id = Uuid::new_v4();
        let t1 = generate_transaction_id("plex", event_id, &counter);
        let t2 = generate_transaction_id("plex", event_id, &counter);
        assert_ne!(t1, t2);
        assert!(t1.ends_with(":0"));
        assert!(t2.ends_with(":1"));
    }

    #[test]
    fn fresh_counter_resets_sequence() {
        let counter_a = TransactionCounter::new();
        let counter_b = TransactionCounter::new();
        let event_id = Uuid::new_v4();
        assert_eq!(
            generate_transaction_id("plex", event_id, &counter_a),
            generate_transaction_id("plex", event_id, &counter_b),
        );
    }
}
