//! Buffered Writer (C5): batches ordered events into ndjson blobs and flushes
//! them to object storage on size, time, hour-rollover, or epoch-change
//! triggers.
//!
//! Buffer, count, current epoch, current hour bucket, and last-flush instant
//! all live behind one `tokio::sync::Mutex` — they are never split across
//! separate locks, so a flush can never observe a half-updated view of
//! "what's buffered for which epoch/hour".

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use evlog_objstore::{ObjectStore, ObjectStoreError};
use evlog_schemas::Event;
use tokio::sync::Mutex;

#[derive(Debug)]
pub enum WriteError {
    Transport(String),
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteError::Transport(msg) => write!(f, "writer flush failed: {msg}"),
        }
    }
}

impl std::error::Error for WriteError {}

impl From<ObjectStoreError> for WriteError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound => WriteError::Transport("bucket not found".to_string()),
            ObjectStoreError::PreconditionFailed => {
                WriteError::Transport("object already existed at flush key".to_string())
            }
            ObjectStoreError::Transport(msg) => WriteError::Transport(msg),
        }
    }
}

/// Serializes `event` as one canonical-JSON line (object keys sorted, so two
/// writers that buffer the same event produce byte-identical output).
fn canonical_json_line(event: &Event) -> Result<String, WriteError> {
    let value = serde_json::to_value(event).map_err(|e| WriteError::Transport(e.to_string()))?;
    let mut line = serde_json::to_string(&value).map_err(|e| WriteError::Transport(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

struct Inner {
    buffer: Vec<u8>,
    count: u64,
    epoch: i64,
    hour_bucket: String,
    last_flush: DateTime<Utc>,
}

/// Batches events for one track and flushes them as ndjson blobs.
pub struct BufferedWriter {
    store: Arc<dyn ObjectStore>,
    track_id: String,
    flush_bytes: usize,
    last_suffix: AtomicI64,
    inner: Mutex<Inner>,
}

impl BufferedWriter {
    pub fn new(store: Arc<dyn ObjectStore>, track_id: impl Into<String>, flush_bytes: usize, now: DateTime<Utc>) -> Self {
        Self {
            store,
            track_id: track_id.into(),
            flush_bytes,
            last_suffix: AtomicI64::new(0),
            inner: Mutex::new(Inner {
                buffer: Vec::new(),
                count: 0,
                epoch: 0,
                hour_bucket: String::new(),
                last_flush: now,
            }),
        }
    }

    /// Buffers one event, flushing first if it would cross an epoch or hour
    /// boundary, and again afterward if the buffer now exceeds
    /// `flush_bytes`.
    pub async fn write(&self, event: &Event) -> Result<(), WriteError> {
        let line = canonical_json_line(event)?;
        let mut inner = self.inner.lock().await;

        let hour_bucket = event.hour_bucket();
        let crosses_boundary = inner.count > 0
            && (event.epoch != inner.epoch || hour_bucket != inner.hour_bucket);
        if crosses_boundary {
            self.flush_locked(&mut inner).await?;
        }

        inner.epoch = event.epoch;
        inner.hour_bucket = hour_bucket;
        inner.buffer.extend_from_slice(line.as_bytes());
        inner.count += 1;

        if inner.buffer.len() >= self.flush_bytes {
            self.flush_locked(&mut inner).await?;
        }

        Ok(())
    }

    /// Called from the periodic flush task. A no-op when nothing is
    /// buffered; otherwise flushes unconditionally regardless of size.
    pub async fn flush_if_due(&self, now: DateTime<Utc>, flush_interval: chrono::Duration) -> Result<(), WriteError> {
        let mut inner = self.inner.lock().await;
        if inner.count == 0 {
            return Ok(());
        }
        if now - inner.last_flush >= flush_interval {
            self.flush_locked(&mut inner).await?;
        }
        Ok(())
    }

    /// Flushes whatever is currently buffered, regardless of triggers.
    /// Called on track shutdown (`Draining`) so no buffered event is lost.
    pub async fn flush(&self) -> Result<(), WriteError> {
        let mut inner = self.inner.lock().await;
        self.flush_locked(&mut inner).await
    }

    async fn flush_locked(&self, inner: &mut Inner) -> Result<(), WriteError> {
        if inner.buffer.is_empty() {
            return Ok(());
        }

        let key = self.object_key(inner.epoch, &inner.hour_bucket);
        let body = Bytes::copy_from_slice(&inner.buffer);

        match self.store.put(&key, body, "application/x-ndjson", false).await {
            Ok(_) => {
                tracing::info!(track_id = %self.track_id, key = %key, events = inner.count, "flush_ok");
                inner.buffer.clear();
                inner.count = 0;
                inner.last_flush = Utc::now();
                Ok(())
            }
            Err(err) => {
                // A failed put never clears the buffer — the next attempt
                // (timer or next `write`) retries the same bytes.
                tracing::warn!(track_id = %self.track_id, key = %key, error = %err, "flush_failed");
                Err(err.into())
            }
        }
    }

    fn object_key(&self, epoch: i64, hour_bucket: &str) -> String {
        format!(
            "events/{}/{}/epoch-{:020}-{:020}.ndjson",
            self.track_id,
            hour_bucket,
            epoch,
            self.next_suffix()
        )
    }

    /// Monotonically increasing suffix seeded from wall-clock nanoseconds,
    /// fused with a strictly-increasing tiebreak so two flushes issued
    /// within the same nanosecond never collide.
    fn next_suffix(&self) -> i64 {
        let now_ns = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);

        loop {
            let prev = self.last_suffix.load(Ordering::SeqCst);
            let candidate = if now_ns > prev { now_ns } else { prev + 1 };
            if self
                .last_suffix
                .compare_exchange(prev, candidate, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return candidate;
            }
        }
    }
}
