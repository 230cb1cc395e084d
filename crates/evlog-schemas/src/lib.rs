//! Domain types shared across the event indexer and the linker sync engine.
//!
//! Nothing here performs I/O. Field names on the `Serialize`/`Deserialize`
//! impls that round-trip through object storage are pinned to the exact
//! wire schema named by the external interfaces so readers and writers
//! stay byte-compatible across versions of this crate.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod reconcile;

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// A single `(key, value)` attribute attached to an [`Event`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attr {
    pub key: String,
    pub value: String,
}

/// An immutable, totally-ordered (within a track/epoch) realm event.
///
/// Total order over a track is `(height, tx_index)`; `epoch` partitions the
/// stream separately — comparing `Event`s with [`Ord`] only compares
/// `(height, tx_index)`, never `epoch`. Callers that cross an epoch boundary
/// must check `epoch` themselves (see [`crate::TrackState`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub epoch: i64,
    pub height: i64,
    #[serde(rename = "txIndex")]
    pub tx_index: i64,
    #[serde(rename = "pkgPath")]
    pub pkg_path: String,
    #[serde(rename = "eventType")]
    pub event_type: String,
    pub timestamp: i64,
    pub attrs: Vec<Attr>,
}

impl Event {
    /// `(height, tx_index)` pair used for total ordering within one epoch.
    pub fn order_key(&self) -> (i64, i64) {
        (self.height, self.tx_index)
    }

    /// Hour bucket (`YYYY-MM-DD-HH`) derived from `timestamp` (UTC epoch seconds).
    pub fn hour_bucket(&self) -> String {
        hour_bucket_for(self.timestamp)
    }

    /// True when the event carries the minimum required fields (§4.5 validation).
    pub fn is_valid(&self) -> bool {
        self.epoch > 0
            && self.height > 0
            && !self.event_type.is_empty()
            && !self.pkg_path.is_empty()
    }
}

/// Format a UTC epoch-seconds timestamp as an `YYYY-MM-DD-HH` hour bucket.
pub fn hour_bucket_for(timestamp_secs: i64) -> String {
    let dt = DateTime::<Utc>::from_timestamp(timestamp_secs, 0).unwrap_or_else(|| {
        DateTime::<Utc>::from_timestamp(0, 0).expect("epoch zero is always representable")
    });
    dt.format("%Y-%m-%d-%H").to_string()
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

// ---------------------------------------------------------------------------
// Cursor / Track / TrackState
// ---------------------------------------------------------------------------

/// Durable high-water mark for one track: `(epoch, height, tx_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    pub epoch: i64,
    pub height: i64,
    pub tx_index: i64,
}

impl Cursor {
    pub fn zero() -> Self {
        Self::default()
    }
}

/// A named stream of events matching a filter, with its own cursor and writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDef {
    pub track_id: String,
    /// Realm filter for the GraphQL query (`response.events.GnoEvent.pkg_path`).
    pub realm_path: String,
    /// Optional event-type family prefix; `None` matches every event type
    /// emitted by `realm_path`.
    pub event_type_prefix: Option<String>,
    /// Upper-bound pagination window `W` (§4.4). Recommended default
    /// 1_000_000; exposed as configuration per §9 Open Question 1.
    pub window: i64,
}

/// Durable state for one track. Mutated only by the active Coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackState {
    #[serde(rename = "track_id")]
    pub track_id: String,
    pub epoch: i64,
    #[serde(rename = "last_processed_height")]
    pub last_processed_height: i64,
    #[serde(rename = "last_processed_tx")]
    pub last_processed_tx: i64,
    #[serde(rename = "last_update")]
    pub last_update: DateTime<Utc>,
    #[serde(rename = "events_recorded")]
    pub events_recorded: u64,
}

impl TrackState {
    /// A freshly registered track: zeroed cursor, epoch `0` (no epoch seen yet).
    pub fn fresh(track_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            track_id: track_id.into(),
            epoch: 0,
            last_processed_height: 0,
            last_processed_tx: 0,
            last_update: now,
            events_recorded: 0,
        }
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            epoch: self.epoch,
            height: self.last_processed_height,
            tx_index: self.last_processed_tx,
        }
    }
}

// ---------------------------------------------------------------------------
// Role mapping / identity (linker sync)
// ---------------------------------------------------------------------------

/// A durable mapping from a realm role to a platform role.
///
/// Uniqueness on `(realm_path, realm_role_name, platform_scope_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMapping {
    pub realm_path: String,
    pub realm_role_name: String,
    pub platform_scope_id: String,
    pub platform_role_id: String,
    pub platform_role_name: String,
    pub linked_at: DateTime<Utc>,
    pub linked_by: String,
}

/// A durable mapping between a realm address and a platform identity.
///
/// Uniqueness on `platform_id` and on `(remote_address, platform_type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub platform_id: String,
    pub platform_type: String,
    pub remote_address: String,
    pub linked_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Distributed lock record
// ---------------------------------------------------------------------------

/// On-disk shape of a lock held at `locks/<name>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub name: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub ttl_secs: u64,
    pub fencing_token: i64,
}

impl LockRecord {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.acquired_at + chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }
}
