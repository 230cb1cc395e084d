//! Object-Storage Client (C2): the minimal capability set the rest of the
//! workspace needs — head-bucket, put (with optional conditional
//! create-if-absent / if-match), get, list — behind one trait so callers
//! never touch the AWS SDK directly.
//!
//! A typed [`ObjectStoreError::NotFound`] is required by C1 and C3 to tell
//! "key does not exist" apart from a transport failure; everything else
//! collapses to `Transport`.

use async_trait::async_trait;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::head_bucket::HeadBucketError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use std::fmt;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ObjectStoreError {
    /// The requested key (or bucket) does not exist.
    NotFound,
    /// A conditional put's precondition (`if_absent` / `if_match`) failed —
    /// someone else won the race.
    PreconditionFailed,
    /// Network or service-side failure not covered by the above.
    Transport(String),
}

impl fmt::Display for ObjectStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectStoreError::NotFound => write!(f, "object not found"),
            ObjectStoreError::PreconditionFailed => {
                write!(f, "conditional write precondition failed")
            }
            ObjectStoreError::Transport(msg) => write!(f, "object store transport error: {msg}"),
        }
    }
}

impl std::error::Error for ObjectStoreError {}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Outcome of a successful `put`/`put_if_match`: the resulting ETag, used by
/// C3 to chain fencing-token-guarded writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Confirms the configured bucket exists and is reachable. Called once
    /// at startup; a failure here is a hard failure (§7 "refuse to start").
    async fn head_bucket(&self) -> Result<(), ObjectStoreError>;

    /// Writes `body` at `key`. When `if_absent` is true, the write only
    /// succeeds if no object currently exists at `key`
    /// (`ObjectStoreError::PreconditionFailed` otherwise).
    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        if_absent: bool,
    ) -> Result<PutOutcome, ObjectStoreError>;

    /// Writes `body` at `key` only if the current object's ETag equals
    /// `etag`. Used to chain updates onto a previously observed lock or
    /// config record without clobbering a concurrent writer.
    async fn put_if_match(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        etag: &str,
    ) -> Result<PutOutcome, ObjectStoreError>;

    /// Reads the full byte contents at `key`, plus its ETag.
    async fn get(&self, key: &str) -> Result<(Bytes, String), ObjectStoreError>;

    /// Lists keys under `prefix` (non-recursive pagination handled internally;
    /// returns the full set of matching keys).
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError>;
}

// ---------------------------------------------------------------------------
// S3-backed implementation
// ---------------------------------------------------------------------------

/// The sole concrete [`ObjectStore`]: an S3-compatible bucket, optionally
/// behind a custom endpoint (MinIO, etc.) with path-style addressing.
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
    prefix: Option<String>,
}

impl S3ObjectStore {
    /// Builds a client from the standard region/credentials/endpoint
    /// environment triplet. Path-style addressing is enabled automatically
    /// when `endpoint_url` is `Some` (custom/non-AWS endpoints usually need
    /// it; real AWS S3 does not).
    pub async fn new(bucket: impl Into<String>, endpoint_url: Option<String>, prefix: Option<String>) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(endpoint) = endpoint_url.clone() {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&shared_config);
        if endpoint_url.is_some() {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: bucket.into(),
            prefix,
        }
    }

    fn full_key(&self, key: &str) -> String {
        match &self.prefix {
            Some(p) if !p.is_empty() => format!("{}/{}", p.trim_end_matches('/'), key),
            _ => key.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head_bucket(&self) -> Result<(), ObjectStoreError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|err| match err.into_service_error() {
                HeadBucketError::NotFound(_) => ObjectStoreError::NotFound,
                other => ObjectStoreError::Transport(other.to_string()),
            })
    }

    async fn put(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        if_absent: bool,
    ) -> Result<PutOutcome, ObjectStoreError> {
        let mut req = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .content_type(content_type)
            .body(ByteStream::from(body));

        if if_absent {
            req = req.if_none_match("*");
        }

        let out = req.send().await.map_err(|err| classify_put_error(err))?;
        Ok(PutOutcome {
            etag: out.e_tag().unwrap_or_default().trim_matches('"').to_string(),
        })
    }

    async fn put_if_match(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
        etag: &str,
    ) -> Result<PutOutcome, ObjectStoreError> {
        let out = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .content_type(content_type)
            .if_match(etag)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify_put_error)?;

        Ok(PutOutcome {
            etag: out.e_tag().unwrap_or_default().trim_matches('"').to_string(),
        })
    }

    async fn get(&self, key: &str) -> Result<(Bytes, String), ObjectStoreError> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.full_key(key))
            .send()
            .await
            .map_err(|err| match err.into_service_error() {
                GetObjectError::NoSuchKey(_) => ObjectStoreError::NotFound,
                other => ObjectStoreError::Transport(other.to_string()),
            })?;

        let etag = out.e_tag().unwrap_or_default().trim_matches('"').to_string();
        let bytes = out
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Transport(e.to_string()))?
            .into_bytes();

        Ok((bytes, etag))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ObjectStoreError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut req = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.full_key(prefix));
            if let Some(token) = continuation.clone() {
                req = req.continuation_token(token);
            }

            let out = req
                .send()
                .await
                .map_err(|err| ObjectStoreError::Transport(err.to_string()))?;

            for obj in out.contents() {
                if let Some(k) = obj.key() {
                    keys.push(k.to_string());
                }
            }

            if out.is_truncated().unwrap_or(false) {
                continuation = out.next_continuation_token().map(str::to_string);
            } else {
                break;
            }
        }

        Ok(keys)
    }
}

fn classify_put_error(
    err: aws_sdk_s3::error::SdkError<PutObjectError, aws_smithy_runtime_api::client::orchestrator::HttpResponse>,
) -> ObjectStoreError {
    match err.into_service_error() {
        PutObjectError::Unhandled(unhandled) => {
            // S3 signals a failed `If-None-Match`/`If-Match` precondition as a
            // 412 response, which the SDK surfaces as an unhandled/generic
            // service error rather than a named variant.
            let msg = unhandled.to_string();
            if msg.contains("PreconditionFailed") || msg.contains("412") {
                ObjectStoreError::PreconditionFailed
            } else {
                ObjectStoreError::Transport(msg)
            }
        }
        other => ObjectStoreError::Transport(other.to_string()),
    }
}
