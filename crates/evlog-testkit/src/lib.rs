//! Shared test fixtures used by scenario tests across the workspace: an
//! in-memory [`ObjectStore`] and a scriptable GraphQL transport, so every
//! crate's `tests/scenario_*.rs` can exercise real component code without
//! live infrastructure.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use evlog_objstore::{ObjectStore, ObjectStoreError, PutOutcome};
use evlog_puller::{GraphQlTransport, PullError};
use serde_json::Value;

/// An in-memory [`ObjectStore`] with the same conditional-write semantics as
/// `S3ObjectStore` (`if_absent` / `if_match` against a minted ETag), so
/// lock/position/writer/config code under test behaves exactly as it would
/// against real object storage.
pub struct InMemoryObjectStore {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    next_etag: Mutex<u64>,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            next_etag: Mutex::new(0),
        }
    }

    fn mint_etag(&self) -> String {
        let mut n = self.next_etag.lock().unwrap();
        *n += 1;
        format!("etag-{n}")
    }

    /// Snapshot of every key currently stored, for assertions.
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn head_bucket(&self) -> Result<(), ObjectStoreError> {
        Ok(())
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        _content_type: &str,
        if_absent: bool,
    ) -> Result<PutOutcome, ObjectStoreError> {
        let mut objects = self.objects.lock().unwrap();
        if if_absent && objects.contains_key(key) {
            return Err(ObjectStoreError::PreconditionFailed);
        }
        let etag = self.mint_etag();
        objects.insert(key.to_string(), (body, etag.clone()));
        Ok(PutOutcome { etag })
    }

    async fn put_if_match(
        &self,
        key: &str,
        body: Bytes,
        _content_type: &str,
        etag: &str,
    ) -> Result<PutOutcome, ObjectStoreError> {
        let mut objects = self.objects.lock().unwrap();
        match objects.get(key) {
            Some((_, current)) if current == etag => {
                let new_etag = self.mint_etag();
                objects.insert(key.to_string(), (body, new_etag.clone()));
                Ok(PutOutcome { etag: new_etag })
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

/// A [`GraphQlTransport`] that replays a fixed script of responses in order,
/// one per `execute` call, regardless of the query/variables passed in.
/// Scenario tests that need query-shape-sensitive behavior should implement
/// `GraphQlTransport` directly instead.
pub struct ScriptedTransport {
    responses: Mutex<Vec<Result<Value, PullError>>>,
}

impl ScriptedTransport {
    pub fn new(responses: Vec<Result<Value, PullError>>) -> Self {
        Self {
            responses: Mutex::new(responses),
        }
    }

    /// Convenience constructor for a transport that only ever serves
    /// `events` pages (no `latest_block_height` calls expected).
    pub fn with_event_pages(pages: Vec<Value>) -> Self {
        Self::new(pages.into_iter().map(Ok).collect())
    }
}

#[async_trait]
impl GraphQlTransport for ScriptedTransport {
    async fn execute(&self, _query: &str, _variables: Value) -> Result<Value, PullError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Ok(serde_json::json!({ "events": [] }));
        }
        responses.remove(0)
    }
}
