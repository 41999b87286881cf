/*!
The copy-on-write history layer: an immutable commit/tree/blob DAG with
named branch refs, forks, history walks and historical read resolution.

Branch refs live at `_cow/refs/<branch>` (the bytes are the tip commit
hash) and the current branch name at `_cow/HEAD`, so a fresh handle opened
against the same path observes the same truth as the handle that wrote it.

A `clear()` writes the `_system/cow-disabled` marker and wipes `_cow/`;
while the marker is present every commit and fork fails with
[EngramError::CowDisabled], in this process and any future one.
*/

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use log::debug;
use uuid::Uuid;

use crate::adapter::{StorageAdapter, COW_DISABLED_KEY, COW_PREFIX};
use crate::blob::BlobStorage;
use crate::error::{EngramError, Result};
use crate::model::{
    BranchHandle, Commit, CommitInfo, CommitRecord, ContentHash, EntryKind, ObjectKind, Tree,
    TreeEntry,
};

/// The default branch name.
pub const DEFAULT_BRANCH: &str = "main";

const HEAD_KEY: &str = "_cow/HEAD";

fn ref_key(branch: &str) -> String {
    format!("{}refs/{}", COW_PREFIX, branch)
}

/// What a historical read resolves: a VFS path or an entity id.
#[derive(Debug, Clone, Copy)]
pub enum ResolveTarget<'a> {
    /// Absolute VFS path, walked segment by segment through the trees.
    Path(&'a str),
    /// Entity UUID, looked up in the root tree.
    Id(Uuid),
}

impl ResolveTarget<'_> {
    fn describe(&self) -> String {
        match self {
            ResolveTarget::Path(path) => path.to_string(),
            ResolveTarget::Id(id) => id.to_string(),
        }
    }
}

/// The outcome of a historical resolution: the entry kind and the content
/// address to read.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEntry {
    /// Blob for files and entity records, tree for directories.
    pub kind: EntryKind,
    /// Content address of the resolved object.
    pub hash: ContentHash,
}

/// The material a commit snapshots: entity record blobs plus the VFS
/// shape. The caller (the brain) gathers this from durable storage at the
/// moment the commit begins.
#[derive(Debug, Default)]
pub struct WorkingSet {
    /// Non-VFS entities: id and the content address of the serialized
    /// record.
    pub entities: Vec<(Uuid, ContentHash)>,
    /// VFS files: absolute path and the content address of the file bytes.
    pub files: Vec<(String, ContentHash)>,
    /// VFS directories (absolute paths; the root is implicit).
    pub dirs: Vec<String>,
}

struct CowState {
    enabled: bool,
    branch: String,
}

/// The copy-on-write store.
pub struct CowStore {
    adapter: Arc<StorageAdapter>,
    blobs: Arc<BlobStorage>,
    state: RwLock<CowState>,
}

impl CowStore {
    /// Open the COW layer. Presence of the `cow-disabled` marker disables
    /// all history writes until the store is recreated at a fresh path.
    pub async fn open(adapter: Arc<StorageAdapter>, blobs: Arc<BlobStorage>) -> Result<CowStore> {
        let enabled = !adapter.has(COW_DISABLED_KEY).await?;
        let branch = match adapter.get(HEAD_KEY).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim().to_string(),
            Err(EngramError::NotFound(_)) => DEFAULT_BRANCH.to_string(),
            Err(err) => return Err(err),
        };
        Ok(CowStore {
            adapter,
            blobs,
            state: RwLock::new(CowState { enabled, branch }),
        })
    }

    /// Whether history writes are currently allowed.
    pub fn is_enabled(&self) -> bool {
        self.state.read().unwrap().enabled
    }

    /// The branch the working set pointer is on.
    pub fn current_branch(&self) -> String {
        self.state.read().unwrap().branch.clone()
    }

    /// The tip commit of the current branch, or None before any commit.
    pub async fn head(&self) -> Result<Option<ContentHash>> {
        self.branch_tip(&self.current_branch()).await
    }

    /// The tip commit of a named branch, or None when the ref is missing.
    pub async fn branch_tip(&self, branch: &str) -> Result<Option<ContentHash>> {
        match self.adapter.get(&ref_key(branch)).await {
            Ok(bytes) => Ok(Some(ContentHash(
                String::from_utf8_lossy(&bytes).trim().to_string(),
            ))),
            Err(EngramError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Snapshot `working_set` into a tree, write a commit referencing the
    /// current head as parent, and advance the branch ref. An unchanged
    /// (even empty) working set still commits.
    pub async fn commit(
        &self,
        working_set: WorkingSet,
        message: &str,
        author: &str,
    ) -> Result<ContentHash> {
        self.require_enabled()?;
        let branch = self.current_branch();
        let parent = self.branch_tip(&branch).await?;

        let root = self.write_snapshot_tree(working_set).await?;
        let commit = Commit::new(parent, root, message, author)?;
        let bytes = commit.record().canonical_bytes()?;
        let stored = self.blobs.write(ObjectKind::Commit, &bytes).await?;
        debug_assert_eq!(stored, commit.hash);

        self.adapter
            .put(&ref_key(&branch), Bytes::from(commit.hash.to_string()))
            .await?;
        self.adapter
            .put(HEAD_KEY, Bytes::from(branch.clone()))
            .await?;
        debug!("commit {} on {}: {}", commit.hash, branch, message);
        Ok(commit.hash)
    }

    /// Create a branch pointing at the current head. Writes against the
    /// fork append to its own history without touching the source branch.
    pub async fn fork(&self, branch: &str) -> Result<BranchHandle> {
        self.require_enabled()?;
        let head = self.head().await?;
        if let Some(tip) = &head {
            self.adapter
                .put(&ref_key(branch), Bytes::from(tip.to_string()))
                .await?;
        }
        Ok(BranchHandle {
            name: branch.to_string(),
            head,
        })
    }

    /// Move the working set pointer to a branch tip. The caller is
    /// responsible for resetting VFS and index caches afterwards.
    pub async fn checkout(&self, branch: &str) -> Result<BranchHandle> {
        let head = self.branch_tip(branch).await?;
        if head.is_none() && branch != DEFAULT_BRANCH {
            return Err(EngramError::NotFound(format!("branch {}", branch)));
        }
        self.adapter
            .put(HEAD_KEY, Bytes::from(branch.to_string()))
            .await?;
        self.state.write().unwrap().branch = branch.to_string();
        Ok(BranchHandle {
            name: branch.to_string(),
            head,
        })
    }

    /// Walk parent pointers from the current head, newest first.
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<CommitInfo>> {
        let mut entries = Vec::new();
        let mut seen: HashSet<ContentHash> = HashSet::new();
        let mut cursor = self.head().await?;
        let limit = limit.unwrap_or(usize::MAX);
        while let Some(hash) = cursor {
            if entries.len() >= limit || !seen.insert(hash.clone()) {
                break;
            }
            let commit = self.load_commit(&hash).await?;
            entries.push(CommitInfo {
                hash: commit.hash,
                message: commit.message,
                author: commit.author,
                timestamp: commit.timestamp,
            });
            cursor = commit.parent;
        }
        Ok(entries)
    }

    /// Load a commit object. A hash that does not resolve to a parsable
    /// commit is [EngramError::InvalidCommit], regardless of which key
    /// prefix it was stored under.
    pub async fn load_commit(&self, hash: &ContentHash) -> Result<Commit> {
        let (_, bytes) = match self.blobs.read(hash).await {
            Ok(found) => found,
            Err(EngramError::NotFound(_)) => {
                return Err(EngramError::InvalidCommit(hash.to_string()))
            }
            Err(err) => return Err(err),
        };
        let record: CommitRecord = serde_json::from_slice(&bytes)
            .map_err(|_| EngramError::InvalidCommit(hash.to_string()))?;
        Commit::from_record(record)
    }

    /// Load a tree object.
    pub async fn load_tree(&self, hash: &ContentHash) -> Result<Tree> {
        let (_, bytes) = self.blobs.read(hash).await?;
        let entries: Vec<TreeEntry> = serde_json::from_slice(&bytes)?;
        Ok(Tree {
            hash: hash.clone(),
            entries,
        })
    }

    /// Resolve a path or entity id against a commit.
    ///
    /// Fails with [EngramError::InvalidCommit] when the commit hash does
    /// not exist and [EngramError::NotFoundAtCommit] when the commit is
    /// fine but the target was absent in its snapshot.
    pub async fn resolve(
        &self,
        commit: &ContentHash,
        target: ResolveTarget<'_>,
    ) -> Result<ResolvedEntry> {
        let loaded = self.load_commit(commit).await?;
        let not_found = || EngramError::NotFoundAtCommit {
            commit: commit.to_string(),
            target: target.describe(),
        };

        match target {
            ResolveTarget::Id(id) => {
                let root = self.load_tree(&loaded.tree).await?;
                let entry = root.entry(&id.to_string()).ok_or_else(not_found)?;
                Ok(ResolvedEntry {
                    kind: entry.kind,
                    hash: entry.hash.clone(),
                })
            }
            ResolveTarget::Path(path) => {
                let segments: Vec<&str> =
                    path.split('/').filter(|s| !s.is_empty()).collect();
                if segments.is_empty() {
                    return Ok(ResolvedEntry {
                        kind: EntryKind::Tree,
                        hash: loaded.tree,
                    });
                }
                let mut tree = self.load_tree(&loaded.tree).await?;
                for segment in &segments[..segments.len() - 1] {
                    let entry = tree.entry(segment).ok_or_else(not_found)?;
                    if entry.kind != EntryKind::Tree {
                        return Err(not_found());
                    }
                    tree = self.load_tree(&entry.hash).await?;
                }
                let entry = tree
                    .entry(segments[segments.len() - 1])
                    .ok_or_else(not_found)?;
                Ok(ResolvedEntry {
                    kind: entry.kind,
                    hash: entry.hash.clone(),
                })
            }
        }
    }

    /// Wipe `_cow/` and write the disabled marker. Called by `clear()`.
    pub async fn disable_and_wipe(&self) -> Result<()> {
        self.adapter.delete_prefix(COW_PREFIX).await?;
        self.adapter
            .put(COW_DISABLED_KEY, Bytes::from_static(b""))
            .await?;
        let mut state = self.state.write().unwrap();
        state.enabled = false;
        state.branch = DEFAULT_BRANCH.to_string();
        Ok(())
    }

    fn require_enabled(&self) -> Result<()> {
        if self.is_enabled() {
            Ok(())
        } else {
            Err(EngramError::CowDisabled)
        }
    }

    /// Build the snapshot tree bottom-up: nested trees for VFS
    /// directories, one blob entry per entity at the root.
    async fn write_snapshot_tree(&self, working_set: WorkingSet) -> Result<ContentHash> {
        // Children of each directory; "" is the root.
        let mut children: BTreeMap<String, Vec<TreeEntry>> = BTreeMap::new();
        children.insert(String::new(), Vec::new());

        let mut dirs: HashSet<String> = HashSet::new();
        for dir in &working_set.dirs {
            for ancestor in ancestors_of(dir) {
                dirs.insert(ancestor);
            }
        }
        for (path, _) in &working_set.files {
            if let Some(parent) = parent_of(path) {
                for ancestor in ancestors_of(&parent) {
                    dirs.insert(ancestor);
                }
            }
        }
        dirs.remove("");
        for dir in &dirs {
            children.entry(dir.clone()).or_default();
        }

        for (path, hash) in &working_set.files {
            let parent = parent_of(path).unwrap_or_default();
            children.entry(parent).or_default().push(TreeEntry {
                name: basename_of(path),
                kind: EntryKind::Blob,
                hash: hash.clone(),
            });
        }

        // Deepest directories first so parents can reference child trees.
        let mut ordered: Vec<String> = dirs.into_iter().collect();
        ordered.sort_by_key(|d| std::cmp::Reverse(d.matches('/').count()));
        for dir in ordered {
            let entries = children.remove(&dir).unwrap_or_default();
            let tree = Tree::new(entries)?;
            let bytes = serde_json::to_vec(&tree.entries)?;
            let stored = self.blobs.write(ObjectKind::Tree, &bytes).await?;
            debug_assert_eq!(stored, tree.hash);
            let parent = parent_of(&dir).unwrap_or_default();
            children.entry(parent).or_default().push(TreeEntry {
                name: basename_of(&dir),
                kind: EntryKind::Tree,
                hash: tree.hash,
            });
        }

        let mut root_entries = children.remove("").unwrap_or_default();
        for (id, hash) in working_set.entities {
            root_entries.push(TreeEntry {
                name: id.to_string(),
                kind: EntryKind::Blob,
                hash,
            });
        }
        let root = Tree::new(root_entries)?;
        let bytes = serde_json::to_vec(&root.entries)?;
        let stored = self.blobs.write(ObjectKind::Tree, &bytes).await?;
        debug_assert_eq!(stored, root.hash);
        Ok(root.hash)
    }
}

/// Parent of a slash-separated path, None for top-level names. Snapshot
/// paths carry no leading slash.
fn parent_of(path: &str) -> Option<String> {
    let trimmed = path.trim_matches('/');
    trimmed.rfind('/').map(|i| trimmed[..i].to_string())
}

fn basename_of(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    match trimmed.rfind('/') {
        Some(i) => trimmed[i + 1..].to_string(),
        None => trimmed.to_string(),
    }
}

/// The path and every ancestor above it, excluding the root.
fn ancestors_of(path: &str) -> Vec<String> {
    let trimmed = path.trim_matches('/');
    let mut out = Vec::new();
    if trimmed.is_empty() {
        return out;
    }
    let mut end = trimmed.len();
    loop {
        out.push(trimmed[..end].to_string());
        match trimmed[..end].rfind('/') {
            Some(i) => end = i,
            None => break,
        }
    }
    out
}
