/*!
The query surface consumed by collaborators: [Brain::find],
[Brain::similar] and [Brain::triple_search].

`find` with a `query` string runs vector search (consulting type
inference when no type is given) and intersects with the where-clause;
with only a where-clause it uses the metadata index alone. VFS entities
are excluded from results unless `include_vfs` is set or the caller
explicitly selects `isVFS: true` in the where-clause.
*/

use serde_json::{Map, Value};
use uuid::Uuid;

use crate::brain::Brain;
use crate::error::{EngramError, Result};
use crate::model::{Entity, NounType};

/// Default page size of [Brain::find].
pub const DEFAULT_FIND_LIMIT: usize = 10;

/// Minimum inference confidence for a type hint to narrow the search.
const MIN_TYPE_CONFIDENCE: f32 = 0.1;

/// Overfetch factor for vector candidates that still face filtering.
fn overfetch(limit: usize) -> usize {
    limit.saturating_mul(4).saturating_add(16)
}

/// Options for [Brain::find].
#[derive(Debug, Clone, Default)]
pub struct FindOptions {
    /// Natural-language query; switches on the vector path.
    pub query: Option<String>,
    /// Restrict to one taxonomy type (skips type inference).
    pub noun_type: Option<NounType>,
    /// Metadata filter: a conjunction of equality and
    /// `greaterThan`/`lessThan` conditions. Unknown operators are
    /// ignored. `isVFS: true` explicitly selects VFS entities.
    pub where_clause: Option<Map<String, Value>>,
    /// Include VFS entities in results.
    pub include_vfs: bool,
    /// Page size, default [DEFAULT_FIND_LIMIT].
    pub limit: Option<usize>,
    /// Opaque cursor from a previous page (metadata path only).
    pub cursor: Option<String>,
}

/// One page of [Brain::find] results.
#[derive(Debug, Clone)]
pub struct FindResult {
    /// Matching entities, metadata-only.
    pub entities: Vec<Entity>,
    /// Cursor for the next page, when more matches remain.
    pub next_cursor: Option<String>,
    /// Total number of matches, known on unpaginated metadata queries.
    pub total_count: Option<usize>,
}

/// An entity with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredEntity {
    /// The entity, metadata-only.
    pub entity: Entity,
    /// Cosine similarity in `[0, 1]`.
    pub score: f32,
}

/// What to find neighbors of.
#[derive(Debug, Clone)]
pub enum SimilarTarget {
    /// A stored entity, loaded with its vector.
    Id(Uuid),
    /// An entity value the caller already holds. It must carry its
    /// vector; a metadata-only load is rejected.
    Entity(Box<Entity>),
}

/// Options for [Brain::triple_search]: vector search intersected with
/// metadata filters.
#[derive(Debug, Clone)]
pub struct TripleQuery {
    /// Text to embed and search by.
    pub like: String,
    /// Metadata filter, including range operators.
    pub where_clause: Option<Map<String, Value>>,
    /// Maximum results.
    pub limit: Option<usize>,
}

impl Brain {
    /// Entity search. See [FindOptions].
    pub async fn find(&self, options: FindOptions) -> Result<FindResult> {
        let mut where_clause = options.where_clause;
        let vfs_selector = where_clause
            .as_mut()
            .and_then(|m| m.remove("isVFS"))
            .and_then(|v| v.as_bool());
        let include_vfs = options.include_vfs || vfs_selector == Some(true);
        let where_set = where_clause
            .as_ref()
            .and_then(|m| self.store().where_query(m));
        let limit = options.limit.unwrap_or(DEFAULT_FIND_LIMIT);

        let keep = |entity: &Entity| -> bool {
            if let Some(noun_type) = options.noun_type {
                if entity.noun_type != noun_type {
                    return false;
                }
            }
            match vfs_selector {
                Some(true) => entity.is_vfs,
                Some(false) => !entity.is_vfs,
                None => include_vfs || !entity.is_vfs,
            }
        };

        if let Some(text) = &options.query {
            let vector = self.store().embed(text).await?;
            let types: Option<Vec<NounType>> = match options.noun_type {
                Some(noun_type) => Some(vec![noun_type]),
                None => {
                    let hinted: Vec<NounType> = self
                        .inference()
                        .infer_types(text)
                        .into_iter()
                        .filter(|g| g.confidence >= MIN_TYPE_CONFIDENCE)
                        .map(|g| g.noun_type)
                        .collect();
                    if hinted.is_empty() {
                        None
                    } else {
                        Some(hinted)
                    }
                }
            };
            let hits =
                self.store()
                    .vector_search(&vector, overfetch(limit), None, types.as_deref())?;
            let mut entities = Vec::new();
            for hit in hits {
                if entities.len() >= limit {
                    break;
                }
                if let Some(set) = &where_set {
                    if !set.contains(&hit.id) {
                        continue;
                    }
                }
                if let Some(entity) = self.store().get(&hit.id, false).await? {
                    if keep(&entity) {
                        entities.push(entity);
                    }
                }
            }
            return Ok(FindResult {
                entities,
                next_cursor: None,
                total_count: None,
            });
        }

        // Metadata-only path: candidates come from the inverted index, or
        // from a full id scan when no filter applies.
        let candidates: Vec<Uuid> = match &where_set {
            Some(set) => set.iter().copied().collect(),
            None => {
                let mut ids = self.store().all_ids().await?;
                ids.sort();
                ids
            }
        };
        let after: Option<Uuid> = match options.cursor.as_deref() {
            Some(cursor) => Some(
                Uuid::parse_str(cursor)
                    .map_err(|e| EngramError::Message(format!("malformed cursor: {}", e)))?,
            ),
            None => None,
        };

        let mut matched = Vec::new();
        for id in candidates {
            if let Some(after) = after {
                if id <= after {
                    continue;
                }
            }
            if let Some(entity) = self.store().get(&id, false).await? {
                if keep(&entity) {
                    matched.push(entity);
                }
            }
        }

        let total_count = if after.is_none() {
            Some(matched.len())
        } else {
            None
        };
        let next_cursor = if matched.len() > limit {
            Some(matched[limit - 1].id.to_string())
        } else {
            None
        };
        matched.truncate(limit);
        Ok(FindResult {
            entities: matched,
            next_cursor,
            total_count,
        })
    }

    /// Nearest neighbors of a stored entity or a caller-held one.
    ///
    /// Fails with [EngramError::MissingVector] when the target carries no
    /// vector (a metadata-only load or an entity stored without one); it
    /// is never auto-loaded.
    pub async fn similar(&self, target: SimilarTarget, limit: usize) -> Result<Vec<ScoredEntity>> {
        let entity = match target {
            SimilarTarget::Entity(entity) => {
                if !entity.has_vector() {
                    return Err(EngramError::MissingVector(entity.id));
                }
                *entity
            }
            SimilarTarget::Id(id) => {
                let entity = self
                    .store()
                    .get(&id, true)
                    .await?
                    .ok_or_else(|| EngramError::NotFound(id.to_string()))?;
                if !entity.has_vector() {
                    return Err(EngramError::MissingVector(id));
                }
                entity
            }
        };

        let hits = self
            .store()
            .vector_search(&entity.vector, overfetch(limit), None, None)?;
        let mut out = Vec::new();
        for hit in hits {
            if hit.id == entity.id {
                continue;
            }
            if out.len() >= limit {
                break;
            }
            if let Some(found) = self.store().get(&hit.id, false).await? {
                if !found.is_vfs {
                    out.push(ScoredEntity {
                        entity: found,
                        score: hit.score,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Vector search intersected with metadata filters (range operators
    /// included).
    pub async fn triple_search(&self, query: TripleQuery) -> Result<Vec<ScoredEntity>> {
        let vector = self.store().embed(&query.like).await?;
        let limit = query.limit.unwrap_or(DEFAULT_FIND_LIMIT);
        let where_set = query
            .where_clause
            .as_ref()
            .and_then(|m| self.store().where_query(m));

        let hits = self
            .store()
            .vector_search(&vector, overfetch(limit), None, None)?;
        let mut out = Vec::new();
        for hit in hits {
            if out.len() >= limit {
                break;
            }
            if let Some(set) = &where_set {
                if !set.contains(&hit.id) {
                    continue;
                }
            }
            if let Some(entity) = self.store().get(&hit.id, false).await? {
                if !entity.is_vfs {
                    out.push(ScoredEntity {
                        entity,
                        score: hit.score,
                    });
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::EntityDraft;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_where_only_path() {
        let brain = Brain::open_in_memory().await.unwrap();
        let lisbon = brain
            .add(
                EntityDraft::new(NounType::Person, "ana")
                    .with_metadata(object(json!({"city": "lisbon"}))),
            )
            .await
            .unwrap();
        brain
            .add(
                EntityDraft::new(NounType::Person, "bo")
                    .with_metadata(object(json!({"city": "porto"}))),
            )
            .await
            .unwrap();

        let result = brain
            .find(FindOptions {
                where_clause: Some(object(json!({"city": "lisbon"}))),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.total_count, Some(1));
        assert_eq!(result.entities[0].id, lisbon);
        // Metadata-only loads.
        assert!(result.entities[0].vector.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_operator_applies_no_filter() {
        let brain = Brain::open_in_memory().await.unwrap();
        brain
            .add(
                EntityDraft::new(NounType::Concept, "a")
                    .with_metadata(object(json!({"n": 1}))),
            )
            .await
            .unwrap();
        brain
            .add(
                EntityDraft::new(NounType::Concept, "b")
                    .with_metadata(object(json!({"n": 2}))),
            )
            .await
            .unwrap();

        // `filter` is not a recognized operator, so no filter applies and
        // every entity comes back.
        let result = brain
            .find(FindOptions {
                where_clause: Some(object(json!({"n": {"filter": 1}}))),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(result.entities.len(), 2);
    }

    #[tokio::test]
    async fn test_pagination_cursor() {
        let brain = Brain::open_in_memory().await.unwrap();
        for i in 0..5 {
            brain
                .add(
                    EntityDraft::new(NounType::Concept, format!("c{}", i))
                        .with_metadata(object(json!({"k": "v"}))),
                )
                .await
                .unwrap();
        }

        let first = brain
            .find(FindOptions {
                where_clause: Some(object(json!({"k": "v"}))),
                limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.entities.len(), 2);
        assert_eq!(first.total_count, Some(5));

        let second = brain
            .find(FindOptions {
                where_clause: Some(object(json!({"k": "v"}))),
                limit: Some(10),
                cursor: first.next_cursor,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.entities.len(), 3);
        assert!(second.next_cursor.is_none());

        let mut all: Vec<Uuid> = first
            .entities
            .iter()
            .chain(second.entities.iter())
            .map(|e| e.id)
            .collect();
        all.dedup();
        assert_eq!(all.len(), 5);
    }

    #[tokio::test]
    async fn test_vfs_excluded_unless_selected() {
        let brain = Brain::open_in_memory().await.unwrap();
        brain.vfs().write_file("/doc.txt", b"text").await.unwrap();
        brain
            .add(EntityDraft::new(NounType::Document, "real doc"))
            .await
            .unwrap();

        let plain = brain.find(FindOptions::default()).await.unwrap();
        assert!(plain.entities.iter().all(|e| !e.is_vfs));
        assert_eq!(plain.entities.len(), 1);

        let with_vfs = brain
            .find(FindOptions {
                include_vfs: true,
                limit: Some(100),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(with_vfs.entities.iter().any(|e| e.is_vfs));

        let only_vfs = brain
            .find(FindOptions {
                where_clause: Some(object(json!({"isVFS": true}))),
                limit: Some(100),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!only_vfs.entities.is_empty());
        assert!(only_vfs.entities.iter().all(|e| e.is_vfs));
    }

    #[tokio::test]
    async fn test_similar_rejects_metadata_only() {
        let brain = Brain::open_in_memory().await.unwrap();
        let id = brain
            .add(EntityDraft::new(NounType::Concept, "anchor"))
            .await
            .unwrap();
        brain
            .add(EntityDraft::new(NounType::Concept, "anchor point"))
            .await
            .unwrap();

        let lean = brain.get(&id, false).await.unwrap().unwrap();
        let err = brain
            .similar(SimilarTarget::Entity(Box::new(lean)), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, EngramError::MissingVector(_)));

        // By id the vector loads and neighbors come back.
        let neighbors = brain.similar(SimilarTarget::Id(id), 5).await.unwrap();
        assert_eq!(neighbors.len(), 1);
    }

    #[tokio::test]
    async fn test_triple_search_intersects_ranges() {
        let brain = Brain::open_in_memory().await.unwrap();
        brain
            .add(
                EntityDraft::new(NounType::Document, "annual budget report")
                    .with_metadata(object(json!({"year": 2020}))),
            )
            .await
            .unwrap();
        let recent = brain
            .add(
                EntityDraft::new(NounType::Document, "annual budget report draft")
                    .with_metadata(object(json!({"year": 2024}))),
            )
            .await
            .unwrap();

        let results = brain
            .triple_search(TripleQuery {
                like: "budget report".to_string(),
                where_clause: Some(object(json!({"year": {"greaterThan": 2022}}))),
                limit: None,
            })
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].entity.id, recent);
    }
}
