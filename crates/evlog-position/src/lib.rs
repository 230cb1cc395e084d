//! Position Store (C1): the durable high-water mark for one track.
//!
//! Owned exclusively by the track's Coordinator — nothing else reads or
//! writes a `TrackState` while that Coordinator is alive, so this type
//! keeps the current state in memory and only round-trips it through
//! object storage on `load`, on an explicit `flush`, or every
//! [`FLUSH_EVERY_N`] advances.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use evlog_objstore::{ObjectStore, ObjectStoreError};
use evlog_schemas::TrackState;

/// Advances auto-flush after this many recorded events.
pub const FLUSH_EVERY_N: u64 = 100;

#[derive(Debug)]
pub enum PositionError {
    /// A new event's epoch is lower than the last recorded epoch — a fatal
    /// state conflict (§9 Open Question 3: epoch decrease is rejected, never
    /// silently reordered).
    EpochRegressed { current: i64, incoming: i64 },
    Transport(String),
}

impl fmt::Display for PositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionError::EpochRegressed { current, incoming } => write!(
                f,
                "epoch regressed from {current} to {incoming}, refusing to record"
            ),
            PositionError::Transport(msg) => write!(f, "position store error: {msg}"),
        }
    }
}

impl std::error::Error for PositionError {}

impl From<ObjectStoreError> for PositionError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound => {
                PositionError::Transport("track state vanished mid-update".to_string())
            }
            ObjectStoreError::PreconditionFailed => {
                PositionError::Transport("concurrent writer updated track state".to_string())
            }
            ObjectStoreError::Transport(msg) => PositionError::Transport(msg),
        }
    }
}

fn state_key(track_id: &str) -> String {
    format!("tracks/{track_id}/state.json")
}

/// In-memory owner of one track's durable cursor.
pub struct PositionStore {
    store: Arc<dyn ObjectStore>,
    state: TrackState,
    etag: Option<String>,
    dirty_since_flush: u64,
}

impl PositionStore {
    /// Loads the track's persisted state, or starts a fresh zeroed one if
    /// none exists yet.
    pub async fn load(
        store: Arc<dyn ObjectStore>,
        track_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Self, PositionError> {
        let key = state_key(track_id);
        match store.get(&key).await {
            Ok((bytes, etag)) => {
                let state: TrackState =
                    serde_json::from_slice(&bytes).map_err(|e| PositionError::Transport(e.to_string()))?;
                Ok(Self {
                    store,
                    state,
                    etag: Some(etag),
                    dirty_since_flush: 0,
                })
            }
            Err(ObjectStoreError::NotFound) => Ok(Self {
                store,
                state: TrackState::fresh(track_id, now),
                etag: None,
                dirty_since_flush: 0,
            }),
            Err(other) => Err(other.into()),
        }
    }

    pub fn state(&self) -> &TrackState {
        &self.state
    }

    /// Records one processed event's position. Returns whether a flush was
    /// performed as a side effect (auto-flush every [`FLUSH_EVERY_N`] events,
    /// or immediately on epoch change).
    pub async fn advance(
        &mut self,
        epoch: i64,
        height: i64,
        tx_index: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, PositionError> {
        if epoch < self.state.epoch {
            return Err(PositionError::EpochRegressed {
                current: self.state.epoch,
                incoming: epoch,
            });
        }

        let epoch_changed = epoch != self.state.epoch;
        if epoch_changed {
            tracing::info!(
                track_id = %self.state.track_id,
                from = self.state.epoch,
                to = epoch,
                "epoch_changed"
            );
        }

        if epoch_changed {
            self.state.events_recorded = 0;
        }

        self.state.epoch = epoch;
        self.state.last_processed_height = height;
        self.state.last_processed_tx = tx_index;
        self.state.events_recorded += 1;
        self.state.last_update = now;
        self.dirty_since_flush += 1;

        if epoch_changed || self.dirty_since_flush >= FLUSH_EVERY_N {
            self.flush().await?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Persists the current in-memory state, creating the object on first
    /// write and conditionally overwriting on subsequent ones.
    pub async fn flush(&mut self) -> Result<(), PositionError> {
        let key = state_key(&self.state.track_id);
        let body = serde_json::to_vec(&self.state).map_err(|e| PositionError::Transport(e.to_string()))?;

        let outcome = match &self.etag {
            None => self.store.put(&key, body.into(), "application/json", true).await?,
            Some(etag) => {
                self.store
                    .put_if_match(&key, body.into(), "application/json", etag)
                    .await?
            }
        };

        self.etag = Some(outcome.etag);
        self.dirty_since_flush = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct InMemoryStore {
        objects: StdMutex<HashMap<String, (Bytes, String)>>,
        next_etag: StdMutex<u64>,
    }

    impl InMemoryStore {
        fn new() -> Self {
            Self {
                objects: StdMutex::new(HashMap::new()),
                next_etag: StdMutex::new(0),
            }
        }

        fn mint_etag(&self) -> String {
            let mut n = self.next_etag.lock().unwrap();
            *n += 1;
            format!("etag-{n}")
        }
    }

    #[async_trait]
    impl ObjectStore for InMemoryStore {
        async fn head_bucket(&self) -> Result<(), ObjectStoreError> {
            Ok(())
        }

        async fn put(
            &self,
            key: &str,
            body: Bytes,
            _content_type: &str,
            if_absent: bool,
        ) -> Result<evlog_objstore::PutOutcome, ObjectStoreError> {
            let mut objects = self.objects.lock().unwrap();
            if if_absent && objects.contains_key(key) {
                return Err(ObjectStoreError::PreconditionFailed);
            }
            let etag = self.mint_etag();
            objects.insert(key.to_string(), (body, etag.clone()));
            Ok(evlog_objstore::PutOutcome { etag })
        }

        async fn put_if_match(
            &self,
            key: &str,
            body: Bytes,
            _content_type: &str,
            etag: &str,
        ) -> Result<evlog_objstore::PutOutcome, ObjectStoreError> {
            let mut objects = self.objects.lock().unwrap();
            match objects.get(key) {
                Some((_, current_etag)) if current_etag == etag => {
                    let new_etag = self.mint_etag();
                    objects.insert(key.to_string(), (body, new_etag.clone()));
                    Ok(evlog_objstore::PutOutcome { etag: new_etag })
                }
                _ => Err(ObjectStoreError::PreconditionFailed),
            }
        }

        async fn get(&self, key: &str) -> Result<(Bytes, String), ObjectStoreError> {
            self.objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or(ObjectStoreError::NotFound)
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    #[tokio::test]
    async fn load_on_missing_key_starts_fresh() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let pos = PositionStore::load(store, "boards-created", Utc::now()).await.unwrap();
        assert_eq!(pos.state().epoch, 0);
        assert_eq!(pos.state().events_recorded, 0);
    }

    #[tokio::test]
    async fn advance_increments_cursor_and_count() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let mut pos = PositionStore::load(store, "boards-created", Utc::now()).await.unwrap();

        pos.advance(3, 100, 0, Utc::now()).await.unwrap();
        assert_eq!(pos.state().last_processed_height, 100);
        assert_eq!(pos.state().events_recorded, 1);
    }

    #[tokio::test]
    async fn advance_rejects_epoch_regression() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let mut pos = PositionStore::load(store, "boards-created", Utc::now()).await.unwrap();

        pos.advance(5, 10, 0, Utc::now()).await.unwrap();
        let err = pos.advance(4, 11, 0, Utc::now()).await.unwrap_err();
        assert!(matches!(err, PositionError::EpochRegressed { current: 5, incoming: 4 }));
    }

    #[tokio::test]
    async fn advance_auto_flushes_on_epoch_change() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let mut pos = PositionStore::load(Arc::clone(&store), "boards-created", Utc::now())
            .await
            .unwrap();

        pos.advance(1, 10, 0, Utc::now()).await.unwrap();
        let flushed = pos.advance(2, 11, 0, Utc::now()).await.unwrap();
        assert!(flushed);

        let reloaded = PositionStore::load(store, "boards-created", Utc::now()).await.unwrap();
        assert_eq!(reloaded.state().epoch, 2);
    }

    #[tokio::test]
    async fn advance_auto_flushes_every_n_events() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let mut pos = PositionStore::load(Arc::clone(&store), "boards-created", Utc::now())
            .await
            .unwrap();

        let mut flushed_on_last = false;
        for i in 0..FLUSH_EVERY_N {
            flushed_on_last = pos.advance(1, i as i64 + 1, 0, Utc::now()).await.unwrap();
        }
        assert!(flushed_on_last);

        let reloaded = PositionStore::load(store, "boards-created", Utc::now()).await.unwrap();
        assert_eq!(reloaded.state().events_recorded, FLUSH_EVERY_N);
    }

    #[tokio::test]
    async fn state_round_trips_through_storage() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let mut pos = PositionStore::load(Arc::clone(&store), "boards-created", Utc::now())
            .await
            .unwrap();
        pos.advance(7, 42, 3, Utc::now()).await.unwrap();
        pos.flush().await.unwrap();

        let reloaded = PositionStore::load(store, "boards-created", Utc::now()).await.unwrap();
        assert_eq!(reloaded.state(), pos.state());
    }
}
