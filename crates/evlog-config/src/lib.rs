//! Configuration Registry (C8): two independent surfaces.
//!
//! `load_layered_yaml` is the static, file-based config loader — layered
//! YAML files deep-merged in order, then canonicalized (sorted keys) and
//! hashed, kept close to how the teacher's config loader already does this.
//!
//! `ConfigRegistry` is new: per-tenant JSON config documents stored as
//! objects, guarded by a lock for read-modify-write, with a monotonic
//! version counter enforced as an optimistic-concurrency check.

use std::fmt;
use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use evlog_lock::{DistributedLock, LockError};
use evlog_objstore::{ObjectStore, ObjectStoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Static layered YAML config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

/// Loads and deep-merges YAML files in order (later files override earlier
/// ones), then canonicalizes the merged document to sorted-key JSON and
/// hashes it so operators can confirm which config a running process
/// actually loaded.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let yaml_val: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let json_val = serde_json::to_value(yaml_val).context("yaml->json conversion failed")?;
        deep_merge(&mut merged, json_val);
    }

    let canonical = canonicalize_json(&merged);

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Ok(LoadedConfig {
        config_json: serde_json::from_str(&canonical).context("canonical json parse failed")?,
        canonical_json: canonical,
        config_hash: hash,
    })
}

fn deep_merge(dst: &mut Value, src: Value) {
    match (dst, src) {
        (Value::Object(dst_map), Value::Object(src_map)) => {
            for (k, v) in src_map {
                match dst_map.get_mut(&k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        dst_map.insert(k, v);
                    }
                }
            }
        }
        (dst_slot, src_val) => {
            *dst_slot = src_val;
        }
    }
}

fn canonicalize_json(v: &Value) -> String {
    let sorted = sort_keys(v);
    serde_json::to_string(&sorted).expect("json serialization must not fail")
}

fn sort_keys(v: &Value) -> Value {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            let mut new = serde_json::Map::new();
            for k in keys {
                new.insert(k.clone(), sort_keys(&map[&k]));
            }
            Value::Object(new)
        }
        Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
        _ => v.clone(),
    }
}

// ---------------------------------------------------------------------------
// Per-tenant config registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    VersionConflict { expected: u64, actual: u64 },
    Lock(LockError),
    Transport(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::VersionConflict { expected, actual } => write!(
                f,
                "config version conflict: expected {expected}, found {actual}"
            ),
            ConfigError::Lock(e) => write!(f, "{e}"),
            ConfigError::Transport(msg) => write!(f, "config transport error: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<LockError> for ConfigError {
    fn from(e: LockError) -> Self {
        ConfigError::Lock(e)
    }
}

impl From<ObjectStoreError> for ConfigError {
    fn from(e: ObjectStoreError) -> Self {
        match e {
            ObjectStoreError::NotFound => ConfigError::Transport("config document vanished".to_string()),
            ObjectStoreError::PreconditionFailed => {
                ConfigError::Transport("concurrent write raced the lock".to_string())
            }
            ObjectStoreError::Transport(msg) => ConfigError::Transport(msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    pub version: u64,
    pub document: Value,
}

fn config_key(tenant_id: &str) -> String {
    format!("config/{tenant_id}.json")
}

fn lock_name(tenant_id: &str) -> String {
    format!("config/{tenant_id}")
}

/// Per-tenant JSON config documents over object storage, guarded by a lock
/// so concurrent `set` calls never lose an update.
pub struct ConfigRegistry {
    store: Arc<dyn ObjectStore>,
    lock: Arc<DistributedLock>,
}

impl ConfigRegistry {
    pub fn new(store: Arc<dyn ObjectStore>, lock: Arc<DistributedLock>) -> Self {
        Self { store, lock }
    }

    /// Reads the current document, or a fresh `version: 0` empty document if
    /// the tenant has never been configured.
    pub async fn get(&self, tenant_id: &str) -> Result<TenantConfig, ConfigError> {
        match self.store.get(&config_key(tenant_id)).await {
            Ok((bytes, _etag)) => {
                serde_json::from_slice(&bytes).map_err(|e| ConfigError::Transport(e.to_string()))
            }
            Err(ObjectStoreError::NotFound) => Ok(TenantConfig {
                tenant_id: tenant_id.to_string(),
                version: 0,
                document: Value::Object(Default::default()),
            }),
            Err(other) => Err(other.into()),
        }
    }

    /// Writes `document` as the new version, only if `expected_version`
    /// matches the currently stored version — the monotonic version counter
    /// invariant. Takes out the tenant's lock for the duration of the
    /// read-modify-write so two racing `set` calls can't both succeed
    /// against the same `expected_version`.
    pub async fn set(
        &self,
        tenant_id: &str,
        holder_id: &str,
        expected_version: u64,
        document: Value,
    ) -> Result<TenantConfig, ConfigError> {
        let lease = self
            .lock
            .acquire(&lock_name(tenant_id), holder_id, 10, Utc::now())
            .await?;

        let current = self.get(tenant_id).await?;
        if current.version != expected_version {
            let _ = self.lock.release(&lease).await;
            return Err(ConfigError::VersionConflict {
                expected: expected_version,
                actual: current.version,
            });
        }

        let updated = TenantConfig {
            tenant_id: tenant_id.to_string(),
            version: current.version + 1,
            document,
        };
        let body = serde_json::to_vec(&updated).map_err(|e| ConfigError::Transport(e.to_string()))?;
        self.store
            .put(&config_key(tenant_id), body.into(), "application/json", false)
            .await?;

        let _ = self.lock.release(&lease).await;
        Ok(updated)
    }
}
