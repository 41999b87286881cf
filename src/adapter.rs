/*!
Backend-agnostic key/value storage over [object_store] backends, plus the
on-disk key layout of the store.

Four backends are supported: in-memory, local filesystem (one file per
key, `/`-separated prefixes become directories), S3-compatible services
(including R2 through an endpoint override) and Google Cloud Storage.
Regardless of backend, entity vector keys are sharded by the first two hex
characters of the entity UUID.
*/

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::TryStreamExt;
use lazy_static::lazy_static;
use log::debug;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::{path::Path, Error as StoreError, ObjectStore};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngramError, Result};

/// Prefix of sharded entity vector records.
pub const VECTORS_PREFIX: &str = "entities/nouns/vectors/";
/// Prefix of sharded entity metadata records (the vector-less copies).
pub const METADATA_PREFIX: &str = "entities/nouns/metadata/";
/// Prefix of relation records.
pub const VERBS_PREFIX: &str = "entities/verbs/";
/// Prefix of index persistence and system markers.
pub const SYSTEM_PREFIX: &str = "_system/";
/// Prefix of copy-on-write objects and refs.
pub const COW_PREFIX: &str = "_cow/";
/// Marker key whose presence disables copy-on-write history.
pub const COW_DISABLED_KEY: &str = "_system/cow-disabled";

/// Upper bound on keys enumerated by a single list call. A prefix holding
/// more keys than this paginates with a truncated `total_count`.
const LIST_SAFETY_CAP: usize = 100_000;

lazy_static! {
    static ref S3_LOCATION: Regex = Regex::new("^s3a?://([^/]+)").unwrap();
    static ref GS_LOCATION: Regex = Regex::new("^gs://([^/]+)").unwrap();
}

/// Where a store lives. Parsed from a location string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// Volatile in-memory map.
    Memory,
    /// Local directory root.
    Filesystem(PathBuf),
    /// S3-compatible bucket (S3, R2, MinIO via `AWS_ENDPOINT`).
    S3 {
        /// Bucket name.
        bucket: String,
    },
    /// Google Cloud Storage bucket.
    Gcs {
        /// Bucket name.
        bucket: String,
    },
}

impl Location {
    /// Parse a location string: `mem:`, `s3://bucket/...`, `gs://bucket/...`
    /// or a filesystem path.
    pub fn parse(location: &str) -> Location {
        if location == "mem:" || location == "memory" {
            Location::Memory
        } else if let Some(captures) = S3_LOCATION.captures(location) {
            Location::S3 {
                bucket: captures[1].to_string(),
            }
        } else if let Some(captures) = GS_LOCATION.captures(location) {
            Location::Gcs {
                bucket: captures[1].to_string(),
            }
        } else {
            Location::Filesystem(PathBuf::from(location))
        }
    }
}

/// Options for a paginated list.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Maximum number of keys to return. None returns everything up to the
    /// safety cap.
    pub limit: Option<usize>,
    /// Opaque cursor from a previous page.
    pub cursor: Option<String>,
}

/// One page of a paginated list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListPage {
    /// Keys on this page, in lexicographic order (shards concatenate
    /// naturally because the shard is a key component).
    pub items: Vec<String>,
    /// Cursor for the next page, or None when exhausted.
    pub next_cursor: Option<String>,
    /// Total number of keys under the prefix. Computed eagerly on the
    /// first page and reused from cache afterwards.
    pub total_count: Option<usize>,
}

/// The decoded form of the opaque cursor: which shard the previous page
/// ended in, and the last key it returned.
#[derive(Serialize, Deserialize)]
struct Cursor {
    shard: String,
    after: String,
}

impl Cursor {
    fn encode(&self) -> Result<String> {
        Ok(hex::encode(serde_json::to_vec(self)?))
    }

    fn decode(encoded: &str) -> Result<Cursor> {
        let bytes = hex::decode(encoded)
            .map_err(|e| EngramError::Message(format!("malformed cursor: {}", e)))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

/// Uniform async K/V access over a pluggable [ObjectStore] backend.
pub struct StorageAdapter {
    store: Arc<dyn ObjectStore>,
    location: Location,
    counts: Mutex<HashMap<String, usize>>,
}

impl StorageAdapter {
    /// Open an adapter at a parsed [Location].
    pub fn open(location: Location) -> Result<StorageAdapter> {
        let store: Arc<dyn ObjectStore> = match &location {
            Location::Memory => Arc::new(InMemory::new()),
            Location::Filesystem(root) => {
                std::fs::create_dir_all(root)?;
                Arc::new(LocalFileSystem::new_with_prefix(root)?)
            }
            Location::S3 { bucket } => {
                let mut builder = AmazonS3Builder::new().with_bucket_name(bucket.as_str());
                if let Ok(region) = std::env::var("AWS_REGION") {
                    builder = builder.with_region(region);
                }
                if let Ok(key) = std::env::var("AWS_ACCESS_KEY_ID") {
                    builder = builder.with_access_key_id(key);
                }
                if let Ok(secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
                    builder = builder.with_secret_access_key(secret);
                }
                if let Ok(endpoint) = std::env::var("AWS_ENDPOINT") {
                    builder = builder.with_endpoint(endpoint).with_allow_http(true);
                }
                Arc::new(builder.build()?)
            }
            Location::Gcs { bucket } => {
                let mut builder =
                    GoogleCloudStorageBuilder::new().with_bucket_name(bucket.as_str());
                if let Ok(account) = std::env::var("GOOGLE_SERVICE_ACCOUNT") {
                    builder = builder.with_service_account_path(account);
                }
                Arc::new(builder.build()?)
            }
        };
        Ok(StorageAdapter {
            store,
            location,
            counts: Mutex::new(HashMap::new()),
        })
    }

    /// Volatile in-memory adapter.
    pub fn memory() -> StorageAdapter {
        StorageAdapter {
            store: Arc::new(InMemory::new()),
            location: Location::Memory,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// Adapter over a caller-supplied backend.
    pub fn from_store(store: Arc<dyn ObjectStore>, location: Location) -> StorageAdapter {
        StorageAdapter {
            store,
            location,
            counts: Mutex::new(HashMap::new()),
        }
    }

    /// The location this adapter was opened at.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Verify the backend is reachable. For bucket backends a missing
    /// bucket is fatal at init, per the external interface contract.
    pub async fn probe(&self) -> Result<()> {
        let mut stream = self.store.list(None).await?;
        // One item is enough; an empty bucket is a valid store.
        let _ = stream.try_next().await?;
        Ok(())
    }

    /// Read the value at `key`. Backend `NoSuchKey`-class failures map to
    /// [EngramError::NotFound]; other failures surface as `Backend`.
    pub async fn get(&self, key: &str) -> Result<Bytes> {
        let path = Path::from(key);
        match self.store.get(&path).await {
            Ok(result) => Ok(result.bytes().await?),
            Err(StoreError::NotFound { .. }) => Err(EngramError::NotFound(key.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Write `bytes` at `key`, replacing any existing value.
    pub async fn put(&self, key: &str, bytes: Bytes) -> Result<()> {
        debug!("put {} ({} bytes)", key, bytes.len());
        self.store.put(&Path::from(key), bytes).await?;
        self.counts.lock().unwrap().clear();
        Ok(())
    }

    /// Delete the value at `key`. Deleting a missing key is a no-op.
    pub async fn delete(&self, key: &str) -> Result<()> {
        match self.store.delete(&Path::from(key)).await {
            Ok(()) | Err(StoreError::NotFound { .. }) => {
                self.counts.lock().unwrap().clear();
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// True when a value exists at `key`.
    pub async fn has(&self, key: &str) -> Result<bool> {
        match self.store.head(&Path::from(key)).await {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound { .. }) => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Enumerate every key under `prefix`, sorted, capped at the safety
    /// limit. The prefix is matched at the string level so callers can
    /// filter inside a directory (`_cow/commit:`).
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = match prefix.rfind('/') {
            Some(i) => &prefix[..i],
            None => "",
        };
        let dir_path = if dir.is_empty() {
            None
        } else {
            Some(Path::from(dir))
        };
        let mut stream = match self.store.list(dir_path.as_ref()).await {
            Ok(stream) => stream,
            // A prefix directory that was never written to is an empty
            // listing, not a failure (the filesystem backend reports it
            // as NotFound).
            Err(StoreError::NotFound { .. }) => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut keys = Vec::new();
        loop {
            match stream.try_next().await {
                Ok(Some(meta)) => {
                    let key = meta.location.to_string();
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                    if keys.len() >= LIST_SAFETY_CAP {
                        break;
                    }
                }
                Ok(None) => break,
                Err(StoreError::NotFound { .. }) => break,
                Err(err) => return Err(err.into()),
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Paginated list of keys under `prefix`.
    ///
    /// The cursor opaquely encodes (shard, per-shard position); pages walk
    /// shards in lexicographic order. `total_count` is computed on the
    /// first page and served from cache on later pages.
    pub async fn list(&self, prefix: &str, options: ListOptions) -> Result<ListPage> {
        let keys = self.list_keys(prefix).await?;

        let total_count = match &options.cursor {
            None => {
                let count = keys.len();
                self.counts
                    .lock()
                    .unwrap()
                    .insert(prefix.to_string(), count);
                Some(count)
            }
            Some(_) => self.counts.lock().unwrap().get(prefix).copied(),
        };

        let start = match &options.cursor {
            Some(encoded) => {
                let cursor = Cursor::decode(encoded)?;
                keys.partition_point(|k| k.as_str() <= cursor.after.as_str())
            }
            None => 0,
        };

        let limit = options.limit.unwrap_or(keys.len());
        let end = start.saturating_add(limit).min(keys.len());
        let items: Vec<String> = keys[start..end].to_vec();

        let next_cursor = if end < keys.len() && !items.is_empty() {
            let last = &items[items.len() - 1];
            Some(
                Cursor {
                    shard: shard_component(last, prefix),
                    after: last.clone(),
                }
                .encode()?,
            )
        } else {
            None
        };

        Ok(ListPage {
            items,
            next_cursor,
            total_count,
        })
    }

    /// Delete every key under `prefix`. Returns the number deleted.
    pub async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let keys = self.list_keys(prefix).await?;
        let count = keys.len();
        for key in &keys {
            match self.store.delete(&Path::from(key.as_str())).await {
                Ok(()) | Err(StoreError::NotFound { .. }) => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.counts.lock().unwrap().clear();
        debug!("deleted {} keys under {}", count, prefix);
        Ok(count)
    }
}

/// The shard component of `key`: the first path component after `prefix`
/// when one exists, otherwise empty.
fn shard_component(key: &str, prefix: &str) -> String {
    key.strip_prefix(prefix)
        .and_then(|rest| {
            let mut parts = rest.split('/');
            let first = parts.next()?;
            parts.next().map(|_| first.to_string())
        })
        .unwrap_or_default()
}

/// Two-hex-character shard of an entity UUID: its first two hex digits.
pub fn shard_of(id: &Uuid) -> String {
    id.to_string()[..2].to_string()
}

/// Sharded key of an entity's full record (vector included).
pub fn vector_key(id: &Uuid) -> String {
    format!("{}{}/{}", VECTORS_PREFIX, shard_of(id), id)
}

/// Sharded key of an entity's vector-less metadata record.
pub fn metadata_key(id: &Uuid) -> String {
    format!("{}{}/{}", METADATA_PREFIX, shard_of(id), id)
}

/// Key of a relation record.
pub fn verb_key(id: &Uuid) -> String {
    format!("{}{}", VERBS_PREFIX, id)
}
