//! Distributed Lock (C3): a TTL'd lease over `evlog-objstore`, giving every
//! Coordinator exclusive ownership of one track and a monotonically
//! increasing fencing token other components can use to reject stale writes.
//!
//! The algorithm is the four-step one from the component design: try a
//! create-if-absent write; on conflict, read the holder's record and take
//! over only if its TTL has elapsed, via a fencing-token-incrementing
//! conditional overwrite keyed on the loser's ETag.

use std::fmt;

use chrono::{DateTime, Utc};
use evlog_objstore::{ObjectStore, ObjectStoreError};
use evlog_schemas::LockRecord;
use std::sync::Arc;

#[derive(Debug)]
pub enum LockError {
    /// Held by another holder whose TTL has not yet elapsed.
    Busy,
    /// Held by us, but a write raced and took it over (fencing token stale).
    Lost,
    Transport(String),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::Busy => write!(f, "lock is held by another holder"),
            LockError::Lost => write!(f, "lock was lost to a competing holder"),
            LockError::Transport(msg) => write!(f, "lock transport error: {msg}"),
        }
    }
}

impl std::error::Error for LockError {}

impl From<ObjectStoreError> for LockError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound => LockError::Transport("lock record vanished".to_string()),
            ObjectStoreError::PreconditionFailed => LockError::Busy,
            ObjectStoreError::Transport(msg) => LockError::Transport(msg),
        }
    }
}

/// A held lock. Carries everything `renew`/`release` need to keep acting on
/// the same object-storage record without re-reading it.
#[derive(Debug, Clone)]
pub struct Lease {
    pub name: String,
    pub holder_id: String,
    pub fencing_token: i64,
    pub expires_at: DateTime<Utc>,
    etag: String,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

fn lock_key(name: &str) -> String {
    format!("locks/{name}.json")
}

/// Distributed lock over an [`ObjectStore`], keyed by lock name
/// (`locks/<name>.json`).
pub struct DistributedLock {
    store: Arc<dyn ObjectStore>,
}

impl DistributedLock {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Attempts to acquire `name` for `holder_id` with a lease of `ttl_secs`.
    /// Succeeds immediately if unheld; takes over an expired holder's record,
    /// incrementing the fencing token; returns [`LockError::Busy`] otherwise.
    pub async fn acquire(
        &self,
        name: &str,
        holder_id: &str,
        ttl_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Lease, LockError> {
        let key = lock_key(name);
        let fresh = LockRecord {
            name: name.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            ttl_secs,
            fencing_token: 1,
        };
        let body = serde_json::to_vec(&fresh).expect("LockRecord always serializes");

        match self.store.put(&key, body.into(), "application/json", true).await {
            Ok(outcome) => {
                return Ok(Lease {
                    name: name.to_string(),
                    holder_id: holder_id.to_string(),
                    fencing_token: fresh.fencing_token,
                    expires_at: fresh.expires_at(),
                    etag: outcome.etag,
                });
            }
            Err(ObjectStoreError::PreconditionFailed) => {
                // Someone already holds it; fall through to the takeover path.
            }
            Err(other) => return Err(other.into()),
        }

        let (bytes, etag) = self.store.get(&key).await?;
        let held: LockRecord =
            serde_json::from_slice(&bytes).map_err(|e| LockError::Transport(e.to_string()))?;

        if !held.is_expired(now) {
            return Err(LockError::Busy);
        }

        let takeover = LockRecord {
            name: name.to_string(),
            holder_id: holder_id.to_string(),
            acquired_at: now,
            ttl_secs,
            fencing_token: held.fencing_token + 1,
        };
        let body = serde_json::to_vec(&takeover).expect("LockRecord always serializes");

        let outcome = self
            .store
            .put_if_match(&key, body.into(), "application/json", &etag)
            .await
            .map_err(|err| match err {
                // Another racer already took it over between our `get` and `put_if_match`.
                ObjectStoreError::PreconditionFailed => LockError::Busy,
                other => other.into(),
            })?;

        tracing::info!(lock = name, fencing_token = takeover.fencing_token, "lease_acquired");

        Ok(Lease {
            name: name.to_string(),
            holder_id: holder_id.to_string(),
            fencing_token: takeover.fencing_token,
            expires_at: takeover.expires_at(),
            etag: outcome.etag,
        })
    }

    /// Extends a held lease, keeping its fencing token. Fails with
    /// [`LockError::Lost`] if the record was overwritten by someone else
    /// since the last successful acquire/renew.
    pub async fn renew(&self, lease: &Lease, ttl_secs: u64, now: DateTime<Utc>) -> Result<Lease, LockError> {
        let key = lock_key(&lease.name);
        let renewed = LockRecord {
            name: lease.name.clone(),
            holder_id: lease.holder_id.clone(),
            acquired_at: now,
            ttl_secs,
            fencing_token: lease.fencing_token,
        };
        let body = serde_json::to_vec(&renewed).expect("LockRecord always serializes");

        let outcome = self
            .store
            .put_if_match(&key, body.into(), "application/json", &lease.etag)
            .await
            .map_err(|err| match err {
                ObjectStoreError::PreconditionFailed => {
                    tracing::warn!(lock = %lease.name, "lease_lost");
                    LockError::Lost
                }
                other => other.into(),
            })?;

        Ok(Lease {
            name: lease.name.clone(),
            holder_id: lease.holder_id.clone(),
            fencing_token: lease.fencing_token,
            expires_at: renewed.expires_at(),
            etag: outcome.etag,
        })
    }

    /// Best-effort release: backdates the record so its TTL has already
    /// elapsed, letting the next acquirer take over without waiting out the
    /// full lease window. A race that loses this write is not an error —
    /// the lock will simply expire naturally.
    pub async fn release(&self, lease: &Lease) -> Result<(), LockError> {
        let key = lock_key(&lease.name);
        let expired = LockRecord {
            name: lease.name.clone(),
            holder_id: lease.holder_id.clone(),
            acquired_at: Utc::now() - chrono::Duration::seconds(1),
            ttl_secs: 0,
            fencing_token: lease.fencing_token,
        };
        let body = serde_json::to_vec(&expired).expect("LockRecord always serializes");

        match self
            .store
            .put_if_match(&key, body.into(), "application/json", &lease.etag)
            .await
        {
            Ok(_) | Err(ObjectStoreError::PreconditionFailed) => Ok(()),
            Err(other) => Err(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::Mutex as StdMutex;
    use std::collections::HashMap;

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

    fn lock_over(store: Arc<dyn ObjectStore>) -> DistributedLock {
        DistributedLock::new(store)
    }

    #[tokio::test]
    async fn acquire_on_unheld_lock_starts_fencing_token_at_one() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let lock = lock_over(store);
        let now = Utc::now();

        let lease = lock.acquire("track/boards", "worker-a", 30, now).await.unwrap();
        assert_eq!(lease.fencing_token, 1);
    }

    #[tokio::test]
    async fn acquire_fails_busy_while_holder_is_live() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let lock = lock_over(store);
        let now = Utc::now();

        lock.acquire("track/boards", "worker-a", 30, now).await.unwrap();
        let err = lock
            .acquire("track/boards", "worker-b", 30, now + chrono::Duration::seconds(5))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Busy));
    }

    #[tokio::test]
    async fn acquire_takes_over_after_ttl_expiry_and_bumps_fencing_token() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let lock = lock_over(store);
        let now = Utc::now();

        let first = lock.acquire("track/boards", "worker-a", 10, now).await.unwrap();
        assert_eq!(first.fencing_token, 1);

        let later = now + chrono::Duration::seconds(11);
        let second = lock.acquire("track/boards", "worker-b", 10, later).await.unwrap();
        assert_eq!(second.fencing_token, 2);
        assert_eq!(second.holder_id, "worker-b");
    }

    #[tokio::test]
    async fn renew_extends_expiry_and_keeps_fencing_token() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let lock = lock_over(store);
        let now = Utc::now();

        let lease = lock.acquire("track/boards", "worker-a", 10, now).await.unwrap();
        let renewed = lock
            .renew(&lease, 10, now + chrono::Duration::seconds(3))
            .await
            .unwrap();
        assert_eq!(renewed.fencing_token, lease.fencing_token);
        assert!(renewed.expires_at > lease.expires_at);
    }

    #[tokio::test]
    async fn renew_after_takeover_reports_lost() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let lock = lock_over(store);
        let now = Utc::now();

        let lease = lock.acquire("track/boards", "worker-a", 10, now).await.unwrap();
        let later = now + chrono::Duration::seconds(11);
        lock.acquire("track/boards", "worker-b", 10, later).await.unwrap();

        let err = lock
            .renew(&lease, 10, later + chrono::Duration::seconds(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LockError::Lost));
    }

    #[tokio::test]
    async fn release_lets_next_acquirer_take_over_immediately() {
        let store: Arc<dyn ObjectStore> = Arc::new(InMemoryStore::new());
        let lock = lock_over(store);
        let now = Utc::now();

        let lease = lock.acquire("track/boards", "worker-a", 300, now).await.unwrap();
        lock.release(&lease).await.unwrap();

        let next = lock
            .acquire("track/boards", "worker-b", 300, now + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(next.holder_id, "worker-b");
        assert_eq!(next.fencing_token, 2);
    }
}
