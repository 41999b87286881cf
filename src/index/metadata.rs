/*!
The per-field inverted index over entity metadata.

Nested objects flatten to dotted paths (`address.city`); arrays up to ten
elements index element-wise while longer ones are treated as bulk data and
skipped; fields named `vector`, `embedding` or `embeddings` are never
indexed at any depth. Values keep a total order so numeric fields answer
`greaterThan` / `lessThan` range filters.

On disk the index is chunked: each `(field, bucket)` pair persists at
`_system/__chunk__<field>__<bucket>` so no single object grows unbounded.
*/

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::Result;

/// Field names that are never indexed, at any nesting depth.
pub const EXCLUDED_FIELDS: [&str; 3] = ["vector", "embedding", "embeddings"];

/// Arrays longer than this are bulk data and stay unindexed.
pub const MAX_INDEXED_ARRAY: usize = 10;

/// Entries per persisted chunk.
const CHUNK_CAPACITY: usize = 128;

/// f64 with a total order so it can key a BTreeMap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderedNumber(pub f64);

impl Eq for OrderedNumber {}

impl PartialOrd for OrderedNumber {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedNumber {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// An indexable scalar. The tagged representation the design calls for:
/// indexing branches on this tag, never on host-language reflection.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexValue {
    /// Boolean scalar.
    Bool(bool),
    /// Numeric scalar (integers and floats collapse to f64).
    Number(OrderedNumber),
    /// String scalar.
    Text(String),
}

impl IndexValue {
    /// Convert a JSON scalar. Null, arrays and objects are not scalars.
    pub fn from_json(value: &Value) -> Option<IndexValue> {
        match value {
            Value::Bool(b) => Some(IndexValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(|f| IndexValue::Number(OrderedNumber(f))),
            Value::String(s) => Some(IndexValue::Text(s.clone())),
            _ => None,
        }
    }

    fn to_json(&self) -> Value {
        match self {
            IndexValue::Bool(b) => Value::Bool(*b),
            IndexValue::Number(OrderedNumber(f)) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            IndexValue::Text(s) => Value::String(s.clone()),
        }
    }
}

#[derive(Default)]
struct FieldIndex {
    values: BTreeMap<IndexValue, BTreeSet<Uuid>>,
}

impl FieldIndex {
    fn equals(&self, value: &IndexValue) -> BTreeSet<Uuid> {
        self.values.get(value).cloned().unwrap_or_default()
    }

    fn range(&self, greater_than: Option<f64>, less_than: Option<f64>) -> BTreeSet<Uuid> {
        let lower = match greater_than {
            Some(g) => Bound::Excluded(IndexValue::Number(OrderedNumber(g))),
            None => Bound::Included(IndexValue::Number(OrderedNumber(f64::NEG_INFINITY))),
        };
        let upper = match less_than {
            Some(l) => Bound::Excluded(IndexValue::Number(OrderedNumber(l))),
            None => Bound::Included(IndexValue::Number(OrderedNumber(f64::INFINITY))),
        };
        self.values
            .range((lower, upper))
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }
}

/// The in-memory inverted index.
#[derive(Default)]
pub struct MetadataIndex {
    fields: HashMap<String, FieldIndex>,
    by_entity: HashMap<Uuid, Vec<(String, IndexValue)>>,
}

impl MetadataIndex {
    /// An empty index.
    pub fn new() -> MetadataIndex {
        MetadataIndex::default()
    }

    /// Number of distinct indexed fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Index an entity's metadata, replacing whatever was indexed for the
    /// id before.
    pub fn index_entity(&mut self, id: Uuid, metadata: &Map<String, Value>) {
        self.remove_entity(&id);
        let mut pairs = Vec::new();
        flatten_object("", metadata, &mut pairs);
        for (field, value) in &pairs {
            self.fields
                .entry(field.clone())
                .or_default()
                .values
                .entry(value.clone())
                .or_default()
                .insert(id);
        }
        if !pairs.is_empty() {
            self.by_entity.insert(id, pairs);
        }
    }

    /// Remove every posting of an entity. Missing ids are a no-op.
    pub fn remove_entity(&mut self, id: &Uuid) {
        let pairs = match self.by_entity.remove(id) {
            Some(pairs) => pairs,
            None => return,
        };
        for (field, value) in pairs {
            let mut drop_field = false;
            if let Some(index) = self.fields.get_mut(&field) {
                if let Some(ids) = index.values.get_mut(&value) {
                    ids.remove(id);
                    if ids.is_empty() {
                        index.values.remove(&value);
                    }
                }
                drop_field = index.values.is_empty();
            }
            if drop_field {
                self.fields.remove(&field);
            }
        }
    }

    /// Evaluate a where-clause: a conjunction of per-field conditions.
    ///
    /// A scalar condition is equality; an object condition supports the
    /// `greaterThan` / `lessThan` range operators. Unknown operators are
    /// ignored, never transformed — a condition with no recognized
    /// operator contributes no filter, and a where-clause contributing no
    /// filters at all returns None ("no filter applied").
    pub fn query(&self, where_clause: &Map<String, Value>) -> Option<BTreeSet<Uuid>> {
        let mut result: Option<BTreeSet<Uuid>> = None;
        for (field, condition) in where_clause {
            let matched: Option<BTreeSet<Uuid>> = match condition {
                Value::Object(ops) => {
                    let greater_than = ops.get("greaterThan").and_then(Value::as_f64);
                    let less_than = ops.get("lessThan").and_then(Value::as_f64);
                    if greater_than.is_none() && less_than.is_none() {
                        None
                    } else {
                        Some(
                            self.fields
                                .get(field)
                                .map(|f| f.range(greater_than, less_than))
                                .unwrap_or_default(),
                        )
                    }
                }
                other => IndexValue::from_json(other).map(|value| {
                    self.fields
                        .get(field)
                        .map(|f| f.equals(&value))
                        .unwrap_or_default()
                }),
            };
            if let Some(matched) = matched {
                result = Some(match result {
                    None => matched,
                    Some(acc) => acc.intersection(&matched).copied().collect(),
                });
            }
        }
        result
    }

    /// Drop all state.
    pub fn reset(&mut self) {
        self.fields.clear();
        self.by_entity.clear();
    }

    /// Serialize as `(key, bytes)` chunk records for the
    /// `_system/__chunk__<field>__<bucket>` keys.
    pub fn to_chunks(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut chunks = Vec::new();
        for (field, index) in &self.fields {
            let entries: Vec<ChunkEntry> = index
                .values
                .iter()
                .map(|(value, ids)| ChunkEntry {
                    value: value.to_json(),
                    ids: ids.iter().copied().collect(),
                })
                .collect();
            for (bucket, window) in entries.chunks(CHUNK_CAPACITY).enumerate() {
                let chunk = Chunk {
                    field: field.clone(),
                    entries: window.to_vec(),
                };
                chunks.push((
                    format!("_system/__chunk__{}__{}", field, bucket),
                    serde_json::to_vec(&chunk)?,
                ));
            }
        }
        Ok(chunks)
    }

    /// Rebuild an index from persisted chunk bytes.
    pub fn from_chunks(chunks: &[Vec<u8>]) -> Result<MetadataIndex> {
        let mut index = MetadataIndex::new();
        for bytes in chunks {
            let chunk: Chunk = serde_json::from_slice(bytes)?;
            for entry in chunk.entries {
                let value = match IndexValue::from_json(&entry.value) {
                    Some(value) => value,
                    None => continue,
                };
                for id in entry.ids {
                    index
                        .fields
                        .entry(chunk.field.clone())
                        .or_default()
                        .values
                        .entry(value.clone())
                        .or_default()
                        .insert(id);
                    index
                        .by_entity
                        .entry(id)
                        .or_default()
                        .push((chunk.field.clone(), value.clone()));
                }
            }
        }
        Ok(index)
    }
}

/// Flatten one object level into dotted-path scalar postings.
fn flatten_object(prefix: &str, object: &Map<String, Value>, out: &mut Vec<(String, IndexValue)>) {
    for (name, value) in object {
        if EXCLUDED_FIELDS.contains(&name.as_str()) {
            continue;
        }
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}.{}", prefix, name)
        };
        flatten_value(&path, value, out);
    }
}

fn flatten_value(path: &str, value: &Value, out: &mut Vec<(String, IndexValue)>) {
    match value {
        Value::Object(object) => flatten_object(path, object, out),
        Value::Array(items) => {
            if items.len() > MAX_INDEXED_ARRAY {
                return;
            }
            for item in items {
                if let Some(scalar) = IndexValue::from_json(item) {
                    out.push((path.to_string(), scalar));
                }
            }
        }
        Value::Null => {}
        scalar => {
            if let Some(scalar) = IndexValue::from_json(scalar) {
                out.push((path.to_string(), scalar));
            }
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct ChunkEntry {
    value: Value,
    ids: Vec<Uuid>,
}

#[derive(Serialize, Deserialize)]
struct Chunk {
    field: String,
    entries: Vec<ChunkEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("metadata must be an object"),
        }
    }

    #[test]
    fn test_equality_and_conjunction() {
        let mut index = MetadataIndex::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        index.index_entity(a, &meta(json!({"city": "lisbon", "age": 30})));
        index.index_entity(b, &meta(json!({"city": "lisbon", "age": 40})));

        let both = index.query(&meta(json!({"city": "lisbon"}))).unwrap();
        assert_eq!(both.len(), 2);

        let just_a = index
            .query(&meta(json!({"city": "lisbon", "age": 30})))
            .unwrap();
        assert_eq!(just_a.into_iter().collect::<Vec<_>>(), vec![a]);
    }

    #[test]
    fn test_nested_paths_flatten() {
        let mut index = MetadataIndex::new();
        let id = Uuid::new_v4();
        index.index_entity(id, &meta(json!({"address": {"city": "porto"}})));
        let hit = index.query(&meta(json!({"address.city": "porto"}))).unwrap();
        assert!(hit.contains(&id));
    }

    #[test]
    fn test_vector_fields_never_indexed() {
        let mut index = MetadataIndex::new();
        let id = Uuid::new_v4();
        index.index_entity(
            id,
            &meta(json!({
                "vector": [1, 2, 3],
                "embedding": [4, 5],
                "nested": {"embeddings": [6], "ok": "yes"}
            })),
        );
        assert_eq!(index.field_count(), 1);
        let chunks = index.to_chunks().unwrap();
        assert!(chunks.iter().all(|(key, _)| !key.contains("embedding")
            && !key.contains("__vector__")));
        assert!(index
            .query(&meta(json!({"nested.ok": "yes"})))
            .unwrap()
            .contains(&id));
    }

    #[test]
    fn test_long_arrays_skipped_short_indexed() {
        let mut index = MetadataIndex::new();
        let id = Uuid::new_v4();
        index.index_entity(
            id,
            &meta(json!({
                "tags": ["a", "b", "c"],
                "bulk": [1,2,3,4,5,6,7,8,9,10,11]
            })),
        );
        assert!(index.query(&meta(json!({"tags": "b"}))).unwrap().contains(&id));
        assert!(index.query(&meta(json!({"bulk": 3}))).unwrap().is_empty());
    }

    #[test]
    fn test_range_operators() {
        let mut index = MetadataIndex::new();
        let young = Uuid::new_v4();
        let old = Uuid::new_v4();
        index.index_entity(young, &meta(json!({"age": 20})));
        index.index_entity(old, &meta(json!({"age": 60})));

        let over_30 = index
            .query(&meta(json!({"age": {"greaterThan": 30}})))
            .unwrap();
        assert_eq!(over_30.into_iter().collect::<Vec<_>>(), vec![old]);

        let between = index
            .query(&meta(json!({"age": {"greaterThan": 10, "lessThan": 30}})))
            .unwrap();
        assert_eq!(between.into_iter().collect::<Vec<_>>(), vec![young]);

        // Bounds are exclusive.
        assert!(index
            .query(&meta(json!({"age": {"greaterThan": 60}})))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_unknown_operators_mean_no_filter() {
        let mut index = MetadataIndex::new();
        let id = Uuid::new_v4();
        index.index_entity(id, &meta(json!({"age": 20})));

        // `filter` is not an operator; the condition is ignored and the
        // clause applies no filter at all.
        assert!(index.query(&meta(json!({"age": {"filter": 20}}))).is_none());
        assert!(index.query(&meta(json!({})))
            .is_none());
    }

    #[test]
    fn test_remove_entity() {
        let mut index = MetadataIndex::new();
        let id = Uuid::new_v4();
        index.index_entity(id, &meta(json!({"k": "v"})));
        index.remove_entity(&id);
        assert!(index.query(&meta(json!({"k": "v"}))).unwrap().is_empty());
        assert_eq!(index.field_count(), 0);
        // Idempotent.
        index.remove_entity(&id);
    }

    #[test]
    fn test_chunk_round_trip() {
        let mut index = MetadataIndex::new();
        let mut ids = Vec::new();
        for i in 0..20 {
            let id = Uuid::new_v4();
            index.index_entity(
                id,
                &meta(json!({"n": i, "parity": if i % 2 == 0 {"even"} else {"odd"}})),
            );
            ids.push(id);
        }
        let chunks = index.to_chunks().unwrap();
        assert!(chunks.iter().all(|(key, _)| key.starts_with("_system/__chunk__")));

        let bytes: Vec<Vec<u8>> = chunks.into_iter().map(|(_, b)| b).collect();
        let restored = MetadataIndex::from_chunks(&bytes).unwrap();
        let evens = restored.query(&meta(json!({"parity": "even"}))).unwrap();
        assert_eq!(evens.len(), 10);
        let small = restored
            .query(&meta(json!({"n": {"lessThan": 5}})))
            .unwrap();
        assert_eq!(small.len(), 5);
    }
}
