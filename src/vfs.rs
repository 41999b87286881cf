/*!
The virtual filesystem layered on entities.

Every path component is an entity with `isVFS: true`: directories carry
`contains` relations to their children, files keep their bytes in a
content blob referenced by the `blobHash` metadata field. The root
directory owns the fixed nil UUID and is recreated lazily after a
`clear()`.

Historical reads delegate to the COW layer: the path is walked through
the commit's trees and the file's content blob is read directly.
*/

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::{json, Map};
use uuid::Uuid;

use crate::blob::BlobStorage;
use crate::cow::{CowStore, ResolveTarget};
use crate::error::{EngramError, Result};
use crate::index::graph::RelationFilter;
use crate::model::{vfs_root_id, ContentHash, EntryKind, NounType, ObjectKind, VerbType, VfsType};
use crate::store::{EntityDraft, EntityStore, RelationDraft};

/// One directory listing entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Final path component.
    pub name: String,
    /// File or directory.
    pub vfs_type: VfsType,
}

/// Metadata of a path, as returned by [Vfs::stat].
#[derive(Debug, Clone, PartialEq)]
pub struct FileStat {
    /// Normalized absolute path.
    pub path: String,
    /// File or directory.
    pub vfs_type: VfsType,
    /// Content size in bytes; None for directories and for historical
    /// objects missing their sidecar.
    pub size: Option<usize>,
    /// Node creation time; None on historical reads.
    pub created_at: Option<DateTime<Utc>>,
    /// Node mutation time; None on historical reads.
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct PathCache {
    root_ready: bool,
    paths: HashMap<String, Uuid>,
}

/// The path → entity tree.
pub struct Vfs {
    store: Arc<EntityStore>,
    blobs: Arc<BlobStorage>,
    cow: Arc<CowStore>,
    cache: RwLock<PathCache>,
}

impl Vfs {
    /// A VFS over the given stores.
    pub fn new(store: Arc<EntityStore>, blobs: Arc<BlobStorage>, cow: Arc<CowStore>) -> Vfs {
        Vfs {
            store,
            blobs,
            cow,
            cache: RwLock::new(PathCache::default()),
        }
    }

    /// Discard all in-memory VFS state (root handle and path cache).
    /// The next operation re-initializes the root lazily.
    pub fn reset(&self) {
        let mut cache = self.cache.write().unwrap();
        cache.root_ready = false;
        cache.paths.clear();
    }

    /// Write `bytes` at `path`, creating intermediate directories and
    /// replacing any existing file content.
    pub async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<Uuid> {
        let path = normalize(path)?;
        if path == "/" {
            return Err(EngramError::Message("cannot write to /".to_string()));
        }
        self.ensure_root().await?;
        let parent = self.ensure_dirs(&parent_path(&path)).await?;
        let content = self.blobs.write(ObjectKind::Blob, bytes).await?;

        if let Some(existing) = self.lookup(&path).await? {
            let entity = self
                .store
                .get(&existing, false)
                .await?
                .ok_or_else(|| EngramError::NotFound(path.clone()))?;
            if entity.vfs_type != Some(VfsType::File) {
                return Err(EngramError::Message(format!("{} is a directory", path)));
            }
            let mut patch = Map::new();
            patch.insert("blobHash".to_string(), json!(content.to_string()));
            self.store.update(&existing, patch).await?;
            return Ok(existing);
        }

        let name = basename(&path);
        let mut metadata = Map::new();
        metadata.insert("blobHash".to_string(), json!(content.to_string()));
        let mut draft = EntityDraft::new(NounType::File, name);
        draft.metadata = metadata;
        draft.is_vfs = true;
        draft.vfs_type = Some(VfsType::File);
        draft.path = Some(path.clone());
        let id = self.store.add(draft).await?;
        self.store
            .relate(RelationDraft {
                from: parent,
                to: id,
                verb_type: VerbType::Contains,
                metadata: Map::new(),
            })
            .await?;
        self.cache.write().unwrap().paths.insert(path, id);
        Ok(id)
    }

    /// Read a file's bytes, now or at a commit.
    pub async fn read_file(&self, path: &str, at: Option<&ContentHash>) -> Result<Vec<u8>> {
        let path = normalize(path)?;
        if let Some(commit) = at {
            let entry = self.cow.resolve(commit, ResolveTarget::Path(&path)).await?;
            if entry.kind != EntryKind::Blob {
                return Err(EngramError::Message(format!("{} is a directory", path)));
            }
            return self.blobs.read_kind(ObjectKind::Blob, &entry.hash).await;
        }

        let id = self
            .lookup(&path)
            .await?
            .ok_or_else(|| EngramError::NotFound(path.clone()))?;
        let entity = self
            .store
            .get(&id, false)
            .await?
            .ok_or_else(|| EngramError::NotFound(path.clone()))?;
        if entity.vfs_type != Some(VfsType::File) {
            return Err(EngramError::Message(format!("{} is a directory", path)));
        }
        let hash = entity
            .metadata
            .get("blobHash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| EngramError::NotFound(format!("{} has no content", path)))?;
        self.blobs
            .read_kind(ObjectKind::Blob, &ContentHash::from(hash))
            .await
    }

    /// Create a directory. With `recursive`, missing parents are created
    /// too; without it a missing parent is an error. Creating an
    /// existing directory is a no-op.
    pub async fn mkdir(&self, path: &str, recursive: bool) -> Result<Uuid> {
        let path = normalize(path)?;
        self.ensure_root().await?;
        if path == "/" {
            return Ok(vfs_root_id());
        }
        if let Some(existing) = self.lookup(&path).await? {
            let entity = self
                .store
                .get(&existing, false)
                .await?
                .ok_or_else(|| EngramError::NotFound(path.clone()))?;
            if entity.vfs_type == Some(VfsType::Directory) {
                return Ok(existing);
            }
            return Err(EngramError::Message(format!("{} is a file", path)));
        }

        let parent_path = parent_path(&path);
        let parent = if recursive {
            self.ensure_dirs(&parent_path).await?
        } else {
            self.lookup(&parent_path)
                .await?
                .ok_or_else(|| EngramError::NotFound(parent_path.clone()))?
        };
        self.create_dir(&path, parent).await
    }

    /// List a directory, now or at a commit. Entries are sorted by name.
    pub async fn read_dir(&self, path: &str, at: Option<&ContentHash>) -> Result<Vec<DirEntry>> {
        let path = normalize(path)?;
        if let Some(commit) = at {
            let entry = self.cow.resolve(commit, ResolveTarget::Path(&path)).await?;
            if entry.kind != EntryKind::Tree {
                return Err(EngramError::Message(format!("{} is a file", path)));
            }
            let tree = self.cow.load_tree(&entry.hash).await?;
            return Ok(tree
                .entries
                .iter()
                .map(|e| DirEntry {
                    name: e.name.clone(),
                    vfs_type: match e.kind {
                        EntryKind::Blob => VfsType::File,
                        EntryKind::Tree => VfsType::Directory,
                    },
                })
                .collect());
        }

        self.ensure_root().await?;
        let id = self
            .lookup(&path)
            .await?
            .ok_or_else(|| EngramError::NotFound(path.clone()))?;
        let mut entries = Vec::new();
        for child in self.store.relations(RelationFilter {
            from: Some(id),
            verb: Some(VerbType::Contains),
            ..Default::default()
        }) {
            if let Some(entity) = self.store.get(&child.to, false).await? {
                if let (Some(child_path), Some(vfs_type)) = (&entity.path, entity.vfs_type) {
                    entries.push(DirEntry {
                        name: basename(child_path),
                        vfs_type,
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// Stat a path, now or at a commit.
    pub async fn stat(&self, path: &str, at: Option<&ContentHash>) -> Result<FileStat> {
        let path = normalize(path)?;
        if let Some(commit) = at {
            let entry = self.cow.resolve(commit, ResolveTarget::Path(&path)).await?;
            let (vfs_type, size) = match entry.kind {
                EntryKind::Tree => (VfsType::Directory, None),
                EntryKind::Blob => {
                    let size = match self.blobs.read_meta(&entry.hash).await {
                        Ok(meta) => Some(meta.size),
                        Err(EngramError::NotFound(_)) => None,
                        Err(err) => return Err(err),
                    };
                    (VfsType::File, size)
                }
            };
            return Ok(FileStat {
                path,
                vfs_type,
                size,
                created_at: None,
                updated_at: None,
            });
        }

        self.ensure_root().await?;
        let id = self
            .lookup(&path)
            .await?
            .ok_or_else(|| EngramError::NotFound(path.clone()))?;
        let entity = self
            .store
            .get(&id, false)
            .await?
            .ok_or_else(|| EngramError::NotFound(path.clone()))?;
        let vfs_type = entity
            .vfs_type
            .ok_or_else(|| EngramError::NotFound(path.clone()))?;
        let size = match (vfs_type, entity.metadata.get("blobHash").and_then(|v| v.as_str())) {
            (VfsType::File, Some(hash)) => {
                match self.blobs.read_meta(&ContentHash::from(hash)).await {
                    Ok(meta) => Some(meta.size),
                    Err(EngramError::NotFound(_)) => None,
                    Err(err) => return Err(err),
                }
            }
            _ => None,
        };
        Ok(FileStat {
            path,
            vfs_type,
            size,
            created_at: Some(entity.created_at),
            updated_at: Some(entity.updated_at),
        })
    }

    /// Whether a path exists, now or at a commit. At a commit, a missing
    /// path answers `false` while an unknown commit propagates as
    /// [EngramError::InvalidCommit].
    pub async fn exists(&self, path: &str, at: Option<&ContentHash>) -> Result<bool> {
        let path = normalize(path)?;
        if let Some(commit) = at {
            return match self.cow.resolve(commit, ResolveTarget::Path(&path)).await {
                Ok(_) => Ok(true),
                Err(EngramError::NotFoundAtCommit { .. }) => Ok(false),
                Err(err) => Err(err),
            };
        }
        self.ensure_root().await?;
        Ok(self.lookup(&path).await?.is_some())
    }

    /// Remove a file or directory. Directories require `recursive`
    /// unless empty; `contains` edges cascade with their entities.
    pub async fn remove(&self, path: &str, recursive: bool) -> Result<()> {
        let path = normalize(path)?;
        if path == "/" {
            return Err(EngramError::Message("cannot remove /".to_string()));
        }
        self.ensure_root().await?;
        let id = self
            .lookup(&path)
            .await?
            .ok_or_else(|| EngramError::NotFound(path.clone()))?;
        let entity = self
            .store
            .get(&id, false)
            .await?
            .ok_or_else(|| EngramError::NotFound(path.clone()))?;

        if entity.vfs_type == Some(VfsType::Directory) {
            let children = self.read_dir(&path, None).await?;
            if !children.is_empty() && !recursive {
                return Err(EngramError::Message(format!("{} is not empty", path)));
            }
            for child in children {
                let child_path = join(&path, &child.name);
                Box::pin(self.remove(&child_path, true)).await?;
            }
        }

        self.store.delete(&id).await?;
        let mut cache = self.cache.write().unwrap();
        cache.paths.remove(&path);
        let prefix = format!("{}/", path);
        cache.paths.retain(|p, _| !p.starts_with(&prefix));
        Ok(())
    }

    /// Resolve a normalized path to its entity id, if present.
    async fn lookup(&self, path: &str) -> Result<Option<Uuid>> {
        if path == "/" {
            return Ok(Some(vfs_root_id()));
        }
        if let Some(&id) = self.cache.read().unwrap().paths.get(path) {
            return Ok(Some(id));
        }
        let parent = match Box::pin(self.lookup(&parent_path(path))).await? {
            Some(parent) => parent,
            None => return Ok(None),
        };
        for child in self.store.relations(RelationFilter {
            from: Some(parent),
            verb: Some(VerbType::Contains),
            ..Default::default()
        }) {
            if let Some(entity) = self.store.get(&child.to, false).await? {
                if entity.path.as_deref() == Some(path) {
                    self.cache
                        .write()
                        .unwrap()
                        .paths
                        .insert(path.to_string(), entity.id);
                    return Ok(Some(entity.id));
                }
            }
        }
        Ok(None)
    }

    /// Lazily create the root directory entity at the nil UUID.
    async fn ensure_root(&self) -> Result<()> {
        if self.cache.read().unwrap().root_ready {
            return Ok(());
        }
        if self.store.get(&vfs_root_id(), false).await?.is_none() {
            let mut draft = EntityDraft::new(NounType::File, "/");
            draft.is_vfs = true;
            draft.vfs_type = Some(VfsType::Directory);
            draft.path = Some("/".to_string());
            self.store.put_with_id(vfs_root_id(), draft).await?;
        }
        self.cache.write().unwrap().root_ready = true;
        Ok(())
    }

    /// Make sure every directory on `path` exists; returns the deepest.
    async fn ensure_dirs(&self, path: &str) -> Result<Uuid> {
        if path == "/" {
            return Ok(vfs_root_id());
        }
        if let Some(id) = self.lookup(path).await? {
            return Ok(id);
        }
        let parent = Box::pin(self.ensure_dirs(&parent_path(path))).await?;
        self.create_dir(path, parent).await
    }

    async fn create_dir(&self, path: &str, parent: Uuid) -> Result<Uuid> {
        let mut draft = EntityDraft::new(NounType::File, basename(path));
        draft.is_vfs = true;
        draft.vfs_type = Some(VfsType::Directory);
        draft.path = Some(path.to_string());
        let id = self.store.add(draft).await?;
        self.store
            .relate(RelationDraft {
                from: parent,
                to: id,
                verb_type: VerbType::Contains,
                metadata: Map::new(),
            })
            .await?;
        self.cache
            .write()
            .unwrap()
            .paths
            .insert(path.to_string(), id);
        Ok(id)
    }
}

/// Normalize to an absolute path with a single leading slash and no
/// empty, `.` or `..` components.
fn normalize(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(EngramError::Message(format!(
                    "unsupported path component in {}",
                    path
                )))
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(format!("/{}", parts.join("/")))
    }
}

fn parent_path(path: &str) -> String {
    match path.trim_start_matches('/').rfind('/') {
        Some(i) => format!("/{}", &path.trim_start_matches('/')[..i]),
        None => "/".to_string(),
    }
}

fn basename(path: &str) -> String {
    path.trim_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("")
        .to_string()
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::StorageAdapter;

    async fn vfs() -> Vfs {
        let adapter = Arc::new(StorageAdapter::memory());
        let blobs = Arc::new(BlobStorage::new(Arc::clone(&adapter), false));
        let cow = Arc::new(
            CowStore::open(Arc::clone(&adapter), Arc::clone(&blobs))
                .await
                .unwrap(),
        );
        let store = Arc::new(EntityStore::open(adapter, None, 8).await.unwrap());
        Vfs::new(store, blobs, cow)
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("/a//b/").unwrap(), "/a/b");
        assert_eq!(normalize("a/b").unwrap(), "/a/b");
        assert_eq!(normalize("/").unwrap(), "/");
        assert!(normalize("/a/../b").is_err());
    }

    #[tokio::test]
    async fn test_write_read_file() {
        let vfs = vfs().await;
        vfs.write_file("/notes/today.txt", b"hello").await.unwrap();
        assert_eq!(
            vfs.read_file("/notes/today.txt", None).await.unwrap(),
            b"hello"
        );

        // Overwrite replaces content in place.
        vfs.write_file("/notes/today.txt", b"later").await.unwrap();
        assert_eq!(
            vfs.read_file("/notes/today.txt", None).await.unwrap(),
            b"later"
        );
    }

    #[tokio::test]
    async fn test_mkdir_and_read_dir() {
        let vfs = vfs().await;
        vfs.mkdir("/a/b", true).await.unwrap();
        vfs.write_file("/a/x.txt", b"x").await.unwrap();

        let entries = vfs.read_dir("/a", None).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["b", "x.txt"]);
        assert_eq!(entries[0].vfs_type, VfsType::Directory);
        assert_eq!(entries[1].vfs_type, VfsType::File);

        // Non-recursive mkdir needs its parent.
        assert!(matches!(
            vfs.mkdir("/missing/deep", false).await,
            Err(EngramError::NotFound(_))
        ));
        // Existing directory is fine.
        vfs.mkdir("/a/b", false).await.unwrap();
    }

    #[tokio::test]
    async fn test_stat_and_exists() {
        let vfs = vfs().await;
        vfs.write_file("/f.bin", &[0u8; 32]).await.unwrap();

        let stat = vfs.stat("/f.bin", None).await.unwrap();
        assert_eq!(stat.vfs_type, VfsType::File);
        assert_eq!(stat.size, Some(32));
        assert!(stat.created_at.is_some());

        assert!(vfs.exists("/f.bin", None).await.unwrap());
        assert!(!vfs.exists("/ghost", None).await.unwrap());
        assert_eq!(
            vfs.stat("/", None).await.unwrap().vfs_type,
            VfsType::Directory
        );
    }

    #[tokio::test]
    async fn test_remove_cascades() {
        let vfs = vfs().await;
        vfs.write_file("/d/one.txt", b"1").await.unwrap();
        vfs.write_file("/d/two.txt", b"2").await.unwrap();

        assert!(vfs.remove("/d", false).await.is_err());
        vfs.remove("/d", true).await.unwrap();
        assert!(!vfs.exists("/d", None).await.unwrap());
        assert!(!vfs.exists("/d/one.txt", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_reset_then_lazy_root() {
        let vfs = vfs().await;
        vfs.write_file("/a.txt", b"v").await.unwrap();
        vfs.reset();
        // Cache is cold but the tree is still on storage.
        assert!(vfs.exists("/a.txt", None).await.unwrap());
    }
}
