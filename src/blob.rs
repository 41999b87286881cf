/*!
Content-addressed object storage under the `_cow/` prefix.

Objects are keyed `<kind>:<hash>` where the kind prefix equals the object
type (`blob`, `commit`, `tree`) and the hash is SHA-256 over the raw
content. A JSON sidecar at `<kind>:-meta:<hash>` records the type,
uncompressed size and compression flag.

Reads with only a hash probe all three prefixes: a legacy writer stored
commits under `blob:`, and readers must keep tolerating those objects.
*/

use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::adapter::{StorageAdapter, COW_PREFIX};
use crate::error::{EngramError, Result};
use crate::model::{BlobMeta, ContentHash, ObjectKind};

/// Content-addressed read/write over a [StorageAdapter].
pub struct BlobStorage {
    adapter: Arc<StorageAdapter>,
    compress: bool,
}

fn object_key(kind: ObjectKind, hash: &ContentHash) -> String {
    format!("{}{}:{}", COW_PREFIX, kind.as_str(), hash)
}

fn meta_key(kind: ObjectKind, hash: &ContentHash) -> String {
    format!("{}{}:-meta:{}", COW_PREFIX, kind.as_str(), hash)
}

impl BlobStorage {
    /// Create a blob store over `adapter`, optionally deflating content
    /// before it is written.
    pub fn new(adapter: Arc<StorageAdapter>, compress: bool) -> BlobStorage {
        BlobStorage { adapter, compress }
    }

    /// Write `bytes` as an object of `kind`. Returns the content address.
    ///
    /// The address is the hash of the uncompressed bytes, so toggling
    /// compression never changes an object's identity.
    pub async fn write(&self, kind: ObjectKind, bytes: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(bytes);
        let stored = if self.compress {
            deflate(bytes)?
        } else {
            bytes.to_vec()
        };
        self.adapter
            .put(&object_key(kind, &hash), Bytes::from(stored))
            .await?;
        self.write_meta(
            &hash,
            BlobMeta {
                kind,
                size: bytes.len(),
                compressed: self.compress,
            },
        )
        .await?;
        Ok(hash)
    }

    /// Write the metadata sidecar for an existing object.
    pub async fn write_meta(&self, hash: &ContentHash, meta: BlobMeta) -> Result<()> {
        let bytes = serde_json::to_vec(&meta)?;
        self.adapter
            .put(&meta_key(meta.kind, hash), Bytes::from(bytes))
            .await?;
        Ok(())
    }

    /// Read an object of a known kind, verifying its content address.
    pub async fn read_kind(&self, kind: ObjectKind, hash: &ContentHash) -> Result<Vec<u8>> {
        let stored = self.adapter.get(&object_key(kind, hash)).await?;
        let compressed = match self.meta_of(kind, hash).await? {
            Some(meta) => meta.compressed,
            // Sidecar missing: a legacy object, always uncompressed.
            None => false,
        };
        let bytes = if compressed {
            inflate(&stored)?
        } else {
            stored.to_vec()
        };
        let actual = ContentHash::of(&bytes);
        if &actual != hash {
            return Err(EngramError::CorruptBlob {
                hash: hash.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(bytes)
    }

    /// Auto-detect read: probe `commit:`, `tree:`, `blob:` in order and
    /// return the first hit with its detected kind.
    pub async fn read(&self, hash: &ContentHash) -> Result<(ObjectKind, Vec<u8>)> {
        for kind in ObjectKind::PROBE_ORDER {
            match self.read_kind(kind, hash).await {
                Ok(bytes) => return Ok((kind, bytes)),
                Err(EngramError::NotFound(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(EngramError::NotFound(hash.to_string()))
    }

    /// True when an object with this hash exists under any prefix.
    pub async fn has(&self, hash: &ContentHash) -> Result<bool> {
        for kind in ObjectKind::PROBE_ORDER {
            if self.adapter.has(&object_key(kind, hash)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Delete an object and its sidecar under every prefix it exists at.
    ///
    /// There is no orphan GC: objects unreferenced by any commit simply
    /// accumulate until the store is cleared.
    pub async fn delete(&self, hash: &ContentHash) -> Result<()> {
        for kind in ObjectKind::PROBE_ORDER {
            self.adapter.delete(&object_key(kind, hash)).await?;
            self.adapter.delete(&meta_key(kind, hash)).await?;
        }
        Ok(())
    }

    /// Read the metadata sidecar, probing all prefixes.
    pub async fn read_meta(&self, hash: &ContentHash) -> Result<BlobMeta> {
        for kind in ObjectKind::PROBE_ORDER {
            if let Some(meta) = self.meta_of(kind, hash).await? {
                return Ok(meta);
            }
        }
        Err(EngramError::NotFound(hash.to_string()))
    }

    async fn meta_of(&self, kind: ObjectKind, hash: &ContentHash) -> Result<Option<BlobMeta>> {
        match self.adapter.get(&meta_key(kind, hash)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(EngramError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn deflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    Ok(encoder.finish()?)
}

fn inflate(bytes: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(bytes).read_to_end(&mut out)?;
    Ok(out)
}
