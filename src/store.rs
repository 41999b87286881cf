/*!
Entity and relation CRUD over the adapter, with index maintenance.

Every entity is written twice: the full record (vector included) at the
sharded `entities/nouns/vectors/` key and a vector-less copy at the
`entities/nouns/metadata/` key. The default read path touches only the
latter, which is what makes metadata-only loads strictly cheaper than
full loads.

Write ordering within one entity: record blobs first, then the HNSW
graph, then the metadata index, then graph adjacency. Record failures
abort the operation; in-memory index maintenance after a durable write
cannot fail, and index persistence failures at flush time are logged as
warnings rather than escalated, since a rebuild can always recover them.
*/

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use chrono::Utc;
use log::warn;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::adapter::{
    metadata_key, vector_key, verb_key, StorageAdapter, METADATA_PREFIX, VERBS_PREFIX,
};
use crate::error::{EngramError, Result};
use crate::index::graph::{GraphIndex, RelationFilter, RelationRef};
use crate::index::hnsw::{HnswIndex, SearchHit};
use crate::index::metadata::MetadataIndex;
use crate::infer::Embedder;
use crate::model::{Entity, NounType, Relation, VerbType, VfsType, NORM_TOLERANCE};

const HNSW_PREFIX: &str = "_system/hnsw/";
const CHUNK_PREFIX: &str = "_system/__chunk__";

/// The fields of a new entity. Identity and timestamps are assigned by
/// the store.
#[derive(Debug, Clone)]
pub struct EntityDraft {
    /// Taxonomy type.
    pub noun_type: NounType,
    /// Free payload, embedded when no vector is supplied.
    pub data: String,
    /// Metadata map.
    pub metadata: Map<String, Value>,
    /// Precomputed vector; when absent the configured embedder runs over
    /// `data`. Entities may be stored without any vector at all.
    pub vector: Option<Vec<f32>>,
    /// Marks VFS nodes, which are excluded from user queries by default.
    pub is_vfs: bool,
    /// File or directory, for VFS nodes.
    pub vfs_type: Option<VfsType>,
    /// Absolute path, for VFS nodes.
    pub path: Option<String>,
}

impl EntityDraft {
    /// A draft with empty metadata and no vector.
    pub fn new(noun_type: NounType, data: impl Into<String>) -> EntityDraft {
        EntityDraft {
            noun_type,
            data: data.into(),
            metadata: Map::new(),
            vector: None,
            is_vfs: false,
            vfs_type: None,
            path: None,
        }
    }

    /// Attach metadata.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> EntityDraft {
        self.metadata = metadata;
        self
    }

    /// Attach a precomputed vector.
    pub fn with_vector(mut self, vector: Vec<f32>) -> EntityDraft {
        self.vector = Some(vector);
        self
    }
}

/// The fields of a new relation.
#[derive(Debug, Clone)]
pub struct RelationDraft {
    /// Source entity; must exist at write time.
    pub from: Uuid,
    /// Target entity; must exist at write time.
    pub to: Uuid,
    /// Verb type.
    pub verb_type: VerbType,
    /// Optional edge metadata.
    pub metadata: Map<String, Value>,
}

/// Entity (noun) and relation (verb) storage with index maintenance.
pub struct EntityStore {
    adapter: Arc<StorageAdapter>,
    embedder: Option<Arc<dyn Embedder>>,
    dim: usize,
    hnsw: RwLock<HnswIndex>,
    metadata: RwLock<MetadataIndex>,
    graph: RwLock<GraphIndex>,
}

impl EntityStore {
    /// Open a store, loading persisted index state from `_system/` and
    /// rebuilding graph adjacency from the relation records.
    pub async fn open(
        adapter: Arc<StorageAdapter>,
        embedder: Option<Arc<dyn Embedder>>,
        dim: usize,
    ) -> Result<EntityStore> {
        let store = EntityStore {
            adapter,
            embedder,
            dim,
            hnsw: RwLock::new(HnswIndex::new(dim)),
            metadata: RwLock::new(MetadataIndex::new()),
            graph: RwLock::new(GraphIndex::new()),
        };
        store.load_indexes().await?;
        Ok(store)
    }

    /// The vector dimension this store validates against.
    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Create an entity with a fresh UUID.
    pub async fn add(&self, draft: EntityDraft) -> Result<Uuid> {
        self.put_with_id(Uuid::new_v4(), draft).await
    }

    /// Create or replace an entity at a caller-chosen id (upsert).
    pub async fn put_with_id(&self, id: Uuid, draft: EntityDraft) -> Result<Uuid> {
        let vector = match draft.vector {
            Some(vector) => Some(vector),
            None => match (&self.embedder, draft.is_vfs) {
                (Some(embedder), false) => Some(embedder.embed(&draft.data).await?),
                _ => None,
            },
        };
        if let Some(vector) = &vector {
            if vector.len() != self.dim {
                return Err(EngramError::DimensionMismatch {
                    expected: self.dim,
                    actual: vector.len(),
                });
            }
            let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
            if (norm - 1.0).abs() > NORM_TOLERANCE {
                return Err(EngramError::InvalidVector { norm });
            }
        }

        let existing = self.get(&id, false).await?;
        let now = Utc::now();
        let entity = Entity {
            id,
            noun_type: draft.noun_type,
            data: draft.data,
            metadata: draft.metadata,
            vector: vector.unwrap_or_default(),
            created_at: existing.as_ref().map(|e| e.created_at).unwrap_or(now),
            updated_at: now,
            is_vfs: draft.is_vfs,
            vfs_type: draft.vfs_type,
            path: draft.path,
        };

        // Record blobs first; failures here abort before any index moves.
        self.write_records(&entity).await?;

        if entity.has_vector() {
            self.hnsw
                .write()
                .unwrap()
                .insert(id, entity.vector.clone(), entity.noun_type)?;
        } else {
            self.hnsw.write().unwrap().delete(&id);
        }
        self.metadata.write().unwrap().index_entity(id, &entity.metadata);
        Ok(id)
    }

    /// Load an entity. The default path reads only the metadata record
    /// and returns `vector = []`; with `include_vectors` the full record
    /// is read instead.
    pub async fn get(&self, id: &Uuid, include_vectors: bool) -> Result<Option<Entity>> {
        let key = if include_vectors {
            vector_key(id)
        } else {
            metadata_key(id)
        };
        match self.adapter.get(&key).await {
            Ok(bytes) => {
                let mut entity: Entity = serde_json::from_slice(&bytes)?;
                if !include_vectors {
                    // Explicitly empty so downstream consumers can reject
                    // vector-requiring operations.
                    entity.vector = Vec::new();
                }
                Ok(Some(entity))
            }
            Err(EngramError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Merge `patch` into an entity's metadata. The vector and the HNSW
    /// graph are untouched.
    pub async fn update(&self, id: &Uuid, patch: Map<String, Value>) -> Result<Entity> {
        let mut full = match self.get(id, true).await? {
            Some(full) => full,
            None => return Err(EngramError::NotFound(id.to_string())),
        };
        for (key, value) in patch {
            if value.is_null() {
                full.metadata.remove(&key);
            } else {
                full.metadata.insert(key, value);
            }
        }
        full.updated_at = Utc::now();

        self.write_records(&full).await?;
        self.metadata.write().unwrap().index_entity(*id, &full.metadata);
        Ok(full.without_vector())
    }

    /// Delete an entity from every index and from storage, cascading the
    /// relations that touch it. Partial presence is fine; the operation
    /// is idempotent best-effort.
    pub async fn delete(&self, id: &Uuid) -> Result<()> {
        self.hnsw.write().unwrap().delete(id);
        self.metadata.write().unwrap().remove_entity(id);
        let removed = self.graph.write().unwrap().unlink_entity(id);
        for verb_id in removed {
            if let Err(err) = self.adapter.delete(&verb_key(&verb_id)).await {
                warn!("cascade delete of relation {} failed: {}", verb_id, err);
            }
        }
        self.adapter.delete(&vector_key(id)).await?;
        self.adapter.delete(&metadata_key(id)).await?;
        Ok(())
    }

    /// Create a relation. Both endpoints must exist at write time.
    pub async fn relate(&self, draft: RelationDraft) -> Result<Uuid> {
        for endpoint in [&draft.from, &draft.to] {
            if !self.adapter.has(&metadata_key(endpoint)).await? {
                return Err(EngramError::NotFound(endpoint.to_string()));
            }
        }
        let relation = Relation {
            id: Uuid::new_v4(),
            from: draft.from,
            to: draft.to,
            verb_type: draft.verb_type,
            metadata: draft.metadata,
            created_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&relation)?;
        self.adapter
            .put(&verb_key(&relation.id), Bytes::from(bytes))
            .await?;
        self.graph.write().unwrap().link(&relation);
        Ok(relation.id)
    }

    /// Load a relation record.
    pub async fn relation(&self, id: &Uuid) -> Result<Option<Relation>> {
        match self.adapter.get(&verb_key(id)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(EngramError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Delete a relation record and its adjacency entries.
    pub async fn unrelate(&self, id: &Uuid) -> Result<()> {
        self.graph.write().unwrap().unlink(id);
        self.adapter.delete(&verb_key(id)).await
    }

    /// Relations matching a filter.
    pub fn relations(&self, filter: RelationFilter) -> Vec<RelationRef> {
        self.graph.read().unwrap().relations_of(filter)
    }

    /// Bounded BFS along outgoing edges.
    pub fn traverse(&self, start: Uuid, verb: Option<VerbType>, depth: usize) -> Vec<Uuid> {
        self.graph.read().unwrap().traverse(start, verb, depth)
    }

    /// Nearest-neighbor search over the vector index.
    pub fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        types: Option<&[NounType]>,
    ) -> Result<Vec<SearchHit>> {
        self.hnsw.read().unwrap().search(query, k, ef, types)
    }

    /// Evaluate a metadata where-clause. None means no filter applied.
    pub fn where_query(&self, where_clause: &Map<String, Value>) -> Option<BTreeSet<Uuid>> {
        self.metadata.read().unwrap().query(where_clause)
    }

    /// Embed text with the configured embedder.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.embedder {
            Some(embedder) => embedder.embed(text).await,
            None => Err(EngramError::Message(
                "no embedder configured and no vector supplied".to_string(),
            )),
        }
    }

    /// Whether an embedder was configured.
    pub fn has_embedder(&self) -> bool {
        self.embedder.is_some()
    }

    /// Ids of every stored entity, via the metadata records.
    pub async fn all_ids(&self) -> Result<Vec<Uuid>> {
        let keys = self.adapter.list_keys(METADATA_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|key| key.rsplit('/').next())
            .filter_map(|name| Uuid::parse_str(name).ok())
            .collect())
    }

    /// Persist HNSW layers and metadata chunks under `_system/`.
    /// Failures are logged and reported as warnings per the propagation
    /// policy; a rebuild pass can always reconstruct the indexes.
    pub async fn flush(&self) -> Result<()> {
        let layers = self.hnsw.read().unwrap().to_layer_files()?;
        let chunks = self.metadata.read().unwrap().to_chunks()?;

        if let Err(err) = self.adapter.delete_prefix(HNSW_PREFIX).await {
            warn!("dropping stale hnsw layers failed: {}", err);
        }
        if let Err(err) = self.adapter.delete_prefix(CHUNK_PREFIX).await {
            warn!("dropping stale metadata chunks failed: {}", err);
        }
        for (layer, bytes) in layers {
            let key = format!("{}{}", HNSW_PREFIX, layer);
            if let Err(err) = self.adapter.put(&key, Bytes::from(bytes)).await {
                warn!("persisting hnsw layer {} failed: {}", layer, err);
            }
        }
        for (key, bytes) in chunks {
            if let Err(err) = self.adapter.put(&key, Bytes::from(bytes)).await {
                warn!("persisting metadata chunk {} failed: {}", key, err);
            }
        }
        Ok(())
    }

    /// Drop in-memory index state and rebuild it from storage.
    pub async fn reload(&self) -> Result<()> {
        self.reset_memory();
        self.load_indexes().await
    }

    /// Drop all in-memory index state.
    pub fn reset_memory(&self) {
        self.hnsw.write().unwrap().reset();
        self.metadata.write().unwrap().reset();
        self.graph.write().unwrap().reset();
    }

    async fn write_records(&self, entity: &Entity) -> Result<()> {
        let full = serde_json::to_vec(entity)?;
        let stripped = serde_json::to_vec(&entity.without_vector())?;
        self.adapter
            .put(&vector_key(&entity.id), Bytes::from(full))
            .await?;
        self.adapter
            .put(&metadata_key(&entity.id), Bytes::from(stripped))
            .await?;
        Ok(())
    }

    async fn load_indexes(&self) -> Result<()> {
        // HNSW layers.
        let layer_keys = self.adapter.list_keys(HNSW_PREFIX).await?;
        if !layer_keys.is_empty() {
            let mut files = Vec::new();
            for key in &layer_keys {
                let layer: usize = key
                    .strip_prefix(HNSW_PREFIX)
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
                files.push((layer, self.adapter.get(key).await?.to_vec()));
            }
            *self.hnsw.write().unwrap() = HnswIndex::from_layer_files(self.dim, &files)?;
        }

        // Metadata chunks.
        let chunk_keys = self.adapter.list_keys(CHUNK_PREFIX).await?;
        if !chunk_keys.is_empty() {
            let mut chunks = Vec::new();
            for key in &chunk_keys {
                chunks.push(self.adapter.get(key).await?.to_vec());
            }
            *self.metadata.write().unwrap() = MetadataIndex::from_chunks(&chunks)?;
        }

        // Graph adjacency rebuilds from the relation records.
        let verb_keys = self.adapter.list_keys(VERBS_PREFIX).await?;
        for key in &verb_keys {
            let bytes = self.adapter.get(key).await?;
            match serde_json::from_slice::<Relation>(&bytes) {
                Ok(relation) => self.graph.write().unwrap().link(&relation),
                Err(err) => warn!("skipping unparsable relation at {}: {}", key, err),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DIM: usize = 8;

    async fn store() -> EntityStore {
        EntityStore::open(
            Arc::new(StorageAdapter::memory()),
            Some(Arc::new(crate::infer::HashingEmbedder::with_dimension(DIM))),
            DIM,
        )
        .await
        .unwrap()
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_add_and_read_paths() {
        let store = store().await;
        let id = store
            .add(
                EntityDraft::new(NounType::Concept, "copy on write")
                    .with_metadata(object(json!({"kind": "storage"}))),
            )
            .await
            .unwrap();

        let lean = store.get(&id, false).await.unwrap().unwrap();
        assert_eq!(lean.vector, Vec::<f32>::new());
        assert_eq!(lean.data, "copy on write");

        let full = store.get(&id, true).await.unwrap().unwrap();
        assert_eq!(full.vector.len(), DIM);
        assert_eq!(full.metadata, lean.metadata);
    }

    #[tokio::test]
    async fn test_upsert_replaces_in_place() {
        let store = store().await;
        let id = store
            .add(EntityDraft::new(NounType::Concept, "first"))
            .await
            .unwrap();
        let created = store.get(&id, false).await.unwrap().unwrap().created_at;

        store
            .put_with_id(id, EntityDraft::new(NounType::Concept, "second"))
            .await
            .unwrap();
        let replaced = store.get(&id, false).await.unwrap().unwrap();
        assert_eq!(replaced.data, "second");
        assert_eq!(replaced.created_at, created);
        assert_eq!(store.all_ids().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_merges_metadata_only() {
        let store = store().await;
        let id = store
            .add(
                EntityDraft::new(NounType::Person, "ada")
                    .with_metadata(object(json!({"role": "engineer", "drop": 1}))),
            )
            .await
            .unwrap();
        let before = store.get(&id, true).await.unwrap().unwrap();

        store
            .update(&id, object(json!({"role": "director", "drop": null})))
            .await
            .unwrap();
        let after = store.get(&id, true).await.unwrap().unwrap();
        assert_eq!(after.metadata.get("role"), Some(&json!("director")));
        assert!(after.metadata.get("drop").is_none());
        assert_eq!(after.vector, before.vector);

        let err = store
            .update(&Uuid::new_v4(), object(json!({"x": 1})))
            .await
            .unwrap_err();
        assert!(matches!(err, EngramError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_relate_requires_endpoints() {
        let store = store().await;
        let a = store
            .add(EntityDraft::new(NounType::Person, "a"))
            .await
            .unwrap();
        let err = store
            .relate(RelationDraft {
                from: a,
                to: Uuid::new_v4(),
                verb_type: VerbType::Knows,
                metadata: Map::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngramError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_cascades_relations() {
        let store = store().await;
        let a = store
            .add(EntityDraft::new(NounType::Person, "a"))
            .await
            .unwrap();
        let b = store
            .add(EntityDraft::new(NounType::Person, "b"))
            .await
            .unwrap();
        let verb_id = store
            .relate(RelationDraft {
                from: a,
                to: b,
                verb_type: VerbType::Knows,
                metadata: Map::new(),
            })
            .await
            .unwrap();

        store.delete(&b).await.unwrap();
        assert!(store.get(&b, false).await.unwrap().is_none());
        assert!(store.relation(&verb_id).await.unwrap().is_none());
        assert!(store
            .relations(RelationFilter {
                from: Some(a),
                ..Default::default()
            })
            .is_empty());
        // Second delete is a no-op.
        store.delete(&b).await.unwrap();
    }

    #[tokio::test]
    async fn test_indexes_survive_reopen_after_flush() {
        let adapter = Arc::new(StorageAdapter::memory());
        let embedder: Arc<dyn Embedder> =
            Arc::new(crate::infer::HashingEmbedder::with_dimension(DIM));
        let store = EntityStore::open(Arc::clone(&adapter), Some(Arc::clone(&embedder)), DIM)
            .await
            .unwrap();

        let id = store
            .add(
                EntityDraft::new(NounType::Document, "quarterly report")
                    .with_metadata(object(json!({"year": 2024}))),
            )
            .await
            .unwrap();
        let vector = store.get(&id, true).await.unwrap().unwrap().vector;
        store.flush().await.unwrap();

        let reopened = EntityStore::open(adapter, Some(embedder), DIM).await.unwrap();
        let hits = reopened
            .vector_search(&vector, 1, None, Some(&[NounType::Document]))
            .unwrap();
        assert_eq!(hits[0].id, id);
        let matched = reopened
            .where_query(&object(json!({"year": 2024})))
            .unwrap();
        assert!(matched.contains(&id));
    }
}
