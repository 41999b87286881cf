/*!
The [Brain]: one handle over the entity store, the index complex, the
copy-on-write history and the VFS.

Built with [BrainBuilder], which wires a storage backend from a location
string, an embedding collaborator (the deterministic
[HashingEmbedder](crate::infer::HashingEmbedder) by default) and a type
inference collaborator (the keyword path by default).
*/

use std::sync::Arc;

use serde_json::Map;
use uuid::Uuid;

use crate::adapter::{Location, StorageAdapter, SYSTEM_PREFIX};
use crate::blob::BlobStorage;
use crate::cow::{CowStore, ResolveTarget, WorkingSet};
use crate::error::{EngramError, Result};
use crate::index::graph::{RelationFilter, RelationRef};
use crate::infer::{Embedder, HashingEmbedder, KeywordTypeInference, TypeInference};
use crate::model::{
    BranchHandle, CommitInfo, ContentHash, Entity, ObjectKind, VerbType, VfsType, VECTOR_DIM,
};
use crate::store::{EntityDraft, EntityStore, RelationDraft};
use crate::vfs::Vfs;

const ENTITIES_PREFIX: &str = "entities/";

/// Configures and opens a [Brain].
pub struct BrainBuilder {
    location: Location,
    compression: bool,
    dimension: usize,
    embedder: Option<Arc<dyn Embedder>>,
    use_default_embedder: bool,
    inference: Arc<dyn TypeInference>,
}

impl BrainBuilder {
    /// Deflate blob content before it is written.
    pub fn with_compression(mut self, compression: bool) -> BrainBuilder {
        self.compression = compression;
        self
    }

    /// Override the vector dimension (default [VECTOR_DIM]).
    pub fn with_dimension(mut self, dimension: usize) -> BrainBuilder {
        self.dimension = dimension;
        self
    }

    /// Plug in a real embedding model.
    pub fn with_embedder(mut self, embedder: Arc<dyn Embedder>) -> BrainBuilder {
        self.embedder = Some(embedder);
        self.use_default_embedder = false;
        self
    }

    /// Run without any embedder; every `add` must then supply a vector
    /// (or none, for metadata-only entities).
    pub fn without_embedder(mut self) -> BrainBuilder {
        self.embedder = None;
        self.use_default_embedder = false;
        self
    }

    /// Plug in a type inference collaborator.
    pub fn with_type_inference(mut self, inference: Arc<dyn TypeInference>) -> BrainBuilder {
        self.inference = inference;
        self
    }

    /// Open the brain: probe the backend, check the COW marker, load
    /// persisted index state.
    pub async fn build(self) -> Result<Brain> {
        let adapter = Arc::new(StorageAdapter::open(self.location)?);
        adapter.probe().await?;

        let embedder = if self.use_default_embedder {
            Some(Arc::new(HashingEmbedder::with_dimension(self.dimension)) as Arc<dyn Embedder>)
        } else {
            self.embedder
        };

        let blobs = Arc::new(BlobStorage::new(Arc::clone(&adapter), self.compression));
        let cow = Arc::new(CowStore::open(Arc::clone(&adapter), Arc::clone(&blobs)).await?);
        let store = Arc::new(
            EntityStore::open(Arc::clone(&adapter), embedder, self.dimension).await?,
        );
        let vfs = Vfs::new(Arc::clone(&store), Arc::clone(&blobs), Arc::clone(&cow));

        Ok(Brain {
            adapter,
            blobs,
            cow,
            store,
            vfs,
            inference: self.inference,
        })
    }
}

/// The embedded brain.
pub struct Brain {
    adapter: Arc<StorageAdapter>,
    blobs: Arc<BlobStorage>,
    cow: Arc<CowStore>,
    store: Arc<EntityStore>,
    vfs: Vfs,
    inference: Arc<dyn TypeInference>,
}

impl Brain {
    /// A builder for the given location string (`mem:`, a directory
    /// path, `s3://bucket`, `gs://bucket`).
    pub fn builder(location: &str) -> BrainBuilder {
        BrainBuilder {
            location: Location::parse(location),
            compression: false,
            dimension: VECTOR_DIM,
            embedder: None,
            use_default_embedder: true,
            inference: Arc::new(KeywordTypeInference::new()),
        }
    }

    /// An in-memory brain with defaults, mostly for tests and demos.
    pub async fn open_in_memory() -> Result<Brain> {
        Brain::builder("mem:").build().await
    }

    /// The entity store.
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    /// The virtual filesystem.
    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    /// The content-addressed blob layer.
    pub fn blobs(&self) -> &BlobStorage {
        &self.blobs
    }

    /// The storage adapter.
    pub fn adapter(&self) -> &StorageAdapter {
        &self.adapter
    }

    /// The type inference collaborator.
    pub fn inference(&self) -> &dyn TypeInference {
        self.inference.as_ref()
    }

    /// Create an entity. See [EntityStore::add].
    pub async fn add(&self, draft: EntityDraft) -> Result<Uuid> {
        self.store.add(draft).await
    }

    /// Load an entity, metadata-only by default.
    pub async fn get(&self, id: &Uuid, include_vectors: bool) -> Result<Option<Entity>> {
        self.store.get(id, include_vectors).await
    }

    /// Load an entity as it existed at a commit.
    pub async fn get_at(&self, commit: &ContentHash, id: &Uuid) -> Result<Entity> {
        let entry = self.cow.resolve(commit, ResolveTarget::Id(*id)).await?;
        let bytes = self.blobs.read_kind(ObjectKind::Blob, &entry.hash).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Merge metadata into an entity.
    pub async fn update(&self, id: &Uuid, patch: Map<String, serde_json::Value>) -> Result<Entity> {
        self.store.update(id, patch).await
    }

    /// Delete an entity and its relations.
    pub async fn delete(&self, id: &Uuid) -> Result<()> {
        self.store.delete(id).await
    }

    /// Create a relation.
    pub async fn relate(&self, draft: RelationDraft) -> Result<Uuid> {
        self.store.relate(draft).await
    }

    /// Relations matching a filter.
    pub fn relations(&self, filter: RelationFilter) -> Vec<RelationRef> {
        self.store.relations(filter)
    }

    /// Bounded BFS from an entity.
    pub fn traverse(&self, start: Uuid, verb: Option<VerbType>, depth: usize) -> Vec<Uuid> {
        self.store.traverse(start, verb, depth)
    }

    /// Snapshot the durable working set into a commit on the current
    /// branch.
    ///
    /// The snapshot covers whatever is stored at the adapter when the
    /// commit begins; concurrent writers may straddle that boundary, so
    /// multi-entity atomicity inside one commit is not guaranteed.
    pub async fn commit(&self, message: &str, author: &str) -> Result<ContentHash> {
        if !self.cow.is_enabled() {
            return Err(EngramError::CowDisabled);
        }
        let working_set = self.collect_working_set().await?;
        self.cow.commit(working_set, message, author).await
    }

    /// Create a branch at the current head.
    pub async fn fork(&self, branch: &str) -> Result<BranchHandle> {
        self.cow.fork(branch).await
    }

    /// Switch to a branch, flushing and reloading index state and
    /// discarding VFS caches.
    pub async fn checkout(&self, branch: &str) -> Result<BranchHandle> {
        let handle = self.cow.checkout(branch).await?;
        self.store.flush().await?;
        self.store.reload().await?;
        self.vfs.reset();
        Ok(handle)
    }

    /// The current branch tip, if any commit exists.
    pub async fn head(&self) -> Result<Option<ContentHash>> {
        self.cow.head().await
    }

    /// The current branch name.
    pub fn current_branch(&self) -> String {
        self.cow.current_branch()
    }

    /// History of the current branch, newest first.
    pub async fn history(&self, limit: Option<usize>) -> Result<Vec<CommitInfo>> {
        self.cow.history(limit).await
    }

    /// Wipe the store: every entity, relation, index object and COW
    /// object is deleted, the `cow-disabled` marker is written, and all
    /// in-memory state resets. Idempotent.
    pub async fn clear(&self) -> Result<()> {
        self.adapter.delete_prefix(ENTITIES_PREFIX).await?;
        self.adapter.delete_prefix(SYSTEM_PREFIX).await?;
        self.cow.disable_and_wipe().await?;
        self.store.reset_memory();
        self.vfs.reset();
        Ok(())
    }

    /// Flush pending index persistence and release the handle.
    pub async fn close(self) -> Result<()> {
        self.store.flush().await
    }

    /// Gather the durable working set for a commit: entity record blobs
    /// plus the VFS shape.
    async fn collect_working_set(&self) -> Result<WorkingSet> {
        let mut working_set = WorkingSet::default();
        for id in self.store.all_ids().await? {
            let entity = match self.store.get(&id, true).await? {
                Some(entity) => entity,
                None => continue,
            };
            if entity.is_vfs {
                let path = match &entity.path {
                    Some(path) if path != "/" => path.trim_matches('/').to_string(),
                    _ => continue,
                };
                match entity.vfs_type {
                    Some(VfsType::Directory) => working_set.dirs.push(path),
                    Some(VfsType::File) => {
                        if let Some(hash) =
                            entity.metadata.get("blobHash").and_then(|v| v.as_str())
                        {
                            working_set.files.push((path, ContentHash::from(hash)));
                        }
                    }
                    None => {}
                }
            } else {
                let bytes = serde_json::to_vec(&entity)?;
                let hash = self.blobs.write(ObjectKind::Blob, &bytes).await?;
                working_set.entities.push((id, hash));
            }
        }
        Ok(working_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NounType;

    #[tokio::test]
    async fn test_open_add_commit_history() {
        let brain = Brain::open_in_memory().await.unwrap();
        let id = brain
            .add(EntityDraft::new(NounType::Concept, "sourdough starter"))
            .await
            .unwrap();

        let h1 = brain.commit("first", "me").await.unwrap();
        brain
            .update(&id, {
                let mut m = Map::new();
                m.insert("fed".to_string(), serde_json::json!(true));
                m
            })
            .await
            .unwrap();
        let h2 = brain.commit("second", "me").await.unwrap();

        let history = brain.history(None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].hash, h2);
        assert_eq!(history[1].hash, h1);
    }

    #[tokio::test]
    async fn test_historical_entity_read() {
        let brain = Brain::open_in_memory().await.unwrap();
        let id = brain
            .add(EntityDraft::new(NounType::Concept, "v1"))
            .await
            .unwrap();
        let h1 = brain.commit("c1", "me").await.unwrap();

        brain
            .store()
            .put_with_id(id, EntityDraft::new(NounType::Concept, "v2"))
            .await
            .unwrap();
        brain.commit("c2", "me").await.unwrap();

        assert_eq!(brain.get(&id, false).await.unwrap().unwrap().data, "v2");
        assert_eq!(brain.get_at(&h1, &id).await.unwrap().data, "v1");

        let other = Uuid::new_v4();
        assert!(matches!(
            brain.get_at(&h1, &other).await,
            Err(EngramError::NotFoundAtCommit { .. })
        ));
    }

    #[tokio::test]
    async fn test_clear_disables_history() {
        let brain = Brain::open_in_memory().await.unwrap();
        brain
            .add(EntityDraft::new(NounType::Concept, "x"))
            .await
            .unwrap();
        brain.commit("c", "me").await.unwrap();

        brain.clear().await.unwrap();
        assert!(matches!(
            brain.commit("after", "me").await,
            Err(EngramError::CowDisabled)
        ));
        // Idempotent.
        brain.clear().await.unwrap();
    }
}
