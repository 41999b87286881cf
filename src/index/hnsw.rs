/*!
A type-partitioned Hierarchical Navigable Small World index.

Each [NounType](crate::model::NounType) owns an independent sub-graph, so
a query with a known type touches one small graph (the fast path) while an
untyped query searches every sub-graph and merges by score. Deletions are
tombstones; [HnswIndex::rebuild] consolidates them away.

Scores are cosine similarity clamped to `[0, 1]` (vectors are verified
L2-normalized on insert, so cosine is a dot product). Ties break by id.
*/

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use itertools::Itertools;
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{EngramError, Result};
use crate::model::{NounType, NORM_TOLERANCE};

/// Maximum links per node and per layer.
pub const DEFAULT_M: usize = 16;
/// Candidate pool size while building.
pub const DEFAULT_EF_CONSTRUCTION: usize = 200;
/// Candidate pool size while searching.
pub const DEFAULT_EF_SEARCH: usize = 50;
/// Hard cap on the layer a node can be assigned to.
const MAX_LEVEL: usize = 16;

/// One search result: entity id and cosine similarity in `[0, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Entity id.
    pub id: Uuid,
    /// Cosine similarity; 1 is identical.
    pub score: f32,
}

/// f32 with a total order, for heaps and sorts over similarities.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Score(f32);

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

struct Node {
    id: Uuid,
    vector: Vec<f32>,
    level: usize,
    /// Adjacency per layer, `0..=level`.
    neighbors: Vec<Vec<usize>>,
    deleted: bool,
}

#[derive(Default)]
struct Partition {
    nodes: Vec<Node>,
    by_id: HashMap<Uuid, usize>,
    /// Node the descent starts from: the highest-level node inserted.
    /// May be tombstoned; tombstones stay traversable.
    entry: Option<usize>,
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

impl Partition {
    fn live_count(&self) -> usize {
        self.by_id.len()
    }

    fn greedy_descend(&self, query: &[f32], mut current: usize, layer: usize) -> usize {
        let mut best = dot(query, &self.nodes[current].vector);
        loop {
            let mut improved = false;
            for &neighbor in &self.nodes[current].neighbors[layer] {
                let sim = dot(query, &self.nodes[neighbor].vector);
                if sim > best {
                    best = sim;
                    current = neighbor;
                    improved = true;
                }
            }
            if !improved {
                return current;
            }
        }
    }

    /// Best-first expansion at one layer. Returns up to `ef` candidates
    /// sorted most-similar first, tombstones included (they stay
    /// navigable; callers filter them from results).
    fn search_layer(&self, query: &[f32], entry: usize, ef: usize, layer: usize) -> Vec<(Score, usize)> {
        let mut visited: HashSet<usize> = HashSet::new();
        visited.insert(entry);
        let entry_sim = Score(dot(query, &self.nodes[entry].vector));

        let mut candidates: BinaryHeap<(Score, usize)> = BinaryHeap::new();
        candidates.push((entry_sim, entry));
        let mut results: BinaryHeap<Reverse<(Score, usize)>> = BinaryHeap::new();
        results.push(Reverse((entry_sim, entry)));

        while let Some((sim, node)) = candidates.pop() {
            let worst = results.peek().map(|Reverse((s, _))| *s).unwrap_or(Score(f32::MIN));
            if sim < worst && results.len() >= ef {
                break;
            }
            for &neighbor in &self.nodes[node].neighbors[layer] {
                if !visited.insert(neighbor) {
                    continue;
                }
                let neighbor_sim = Score(dot(query, &self.nodes[neighbor].vector));
                let worst = results.peek().map(|Reverse((s, _))| *s).unwrap_or(Score(f32::MIN));
                if results.len() < ef || neighbor_sim > worst {
                    candidates.push((neighbor_sim, neighbor));
                    results.push(Reverse((neighbor_sim, neighbor)));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<(Score, usize)> =
            results.into_iter().map(|Reverse(pair)| pair).collect();
        out.sort_by(|a, b| b.0.cmp(&a.0));
        out
    }

    fn insert(&mut self, id: Uuid, vector: Vec<f32>, level: usize, m: usize, ef_construction: usize) {
        let index = self.nodes.len();
        self.nodes.push(Node {
            id,
            vector,
            level,
            neighbors: vec![Vec::new(); level + 1],
            deleted: false,
        });
        self.by_id.insert(id, index);

        let entry = match self.entry {
            Some(entry) => entry,
            None => {
                self.entry = Some(index);
                return;
            }
        };

        let query = self.nodes[index].vector.clone();
        let top = self.nodes[entry].level;
        let mut current = entry;
        for layer in ((level + 1)..=top).rev() {
            current = self.greedy_descend(&query, current, layer);
        }

        for layer in (0..=level.min(top)).rev() {
            let candidates = self.search_layer(&query, current, ef_construction, layer);
            current = candidates.first().map(|&(_, n)| n).unwrap_or(current);
            let selected: Vec<usize> = candidates
                .iter()
                .map(|&(_, n)| n)
                .filter(|&n| n != index)
                .take(m)
                .collect();
            for neighbor in selected {
                self.nodes[index].neighbors[layer].push(neighbor);
                self.nodes[neighbor].neighbors[layer].push(index);
                self.prune(neighbor, layer, m);
            }
        }

        if level > top {
            self.entry = Some(index);
        }
    }

    /// Keep only the `m` most similar links of a node at one layer.
    fn prune(&mut self, node: usize, layer: usize, m: usize) {
        if self.nodes[node].neighbors[layer].len() <= m {
            return;
        }
        let anchor = self.nodes[node].vector.clone();
        let mut links = std::mem::take(&mut self.nodes[node].neighbors[layer]);
        links.sort_unstable();
        links.dedup();
        links.sort_by(|&a, &b| {
            Score(dot(&anchor, &self.nodes[b].vector))
                .cmp(&Score(dot(&anchor, &self.nodes[a].vector)))
        });
        links.truncate(m);
        self.nodes[node].neighbors[layer] = links;
    }

    fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<SearchHit> {
        let entry = match self.entry {
            Some(entry) if !self.nodes.is_empty() => entry,
            _ => return Vec::new(),
        };
        let mut current = entry;
        for layer in (1..=self.nodes[entry].level).rev() {
            current = self.greedy_descend(query, current, layer);
        }
        let candidates = self.search_layer(query, current, ef.max(k), 0);
        candidates
            .into_iter()
            .filter(|&(_, n)| !self.nodes[n].deleted)
            .map(|(sim, n)| SearchHit {
                id: self.nodes[n].id,
                score: sim.0.clamp(0.0, 1.0),
            })
            .take(k)
            .collect()
    }
}

/// The type-partitioned index.
pub struct HnswIndex {
    dim: usize,
    m: usize,
    ef_construction: usize,
    ef_search: usize,
    partitions: HashMap<NounType, Partition>,
}

impl HnswIndex {
    /// An empty index over vectors of dimension `dim`, with the default
    /// graph parameters.
    pub fn new(dim: usize) -> HnswIndex {
        HnswIndex {
            dim,
            m: DEFAULT_M,
            ef_construction: DEFAULT_EF_CONSTRUCTION,
            ef_search: DEFAULT_EF_SEARCH,
            partitions: HashMap::new(),
        }
    }

    /// The index dimension.
    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Number of live (non-tombstoned) vectors across all partitions.
    pub fn len(&self) -> usize {
        self.partitions.values().map(Partition::live_count).sum()
    }

    /// True when no live vector is indexed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when `id` is indexed and live.
    pub fn contains(&self, id: &Uuid) -> bool {
        self.partitions.values().any(|p| p.by_id.contains_key(id))
    }

    /// Insert a vector into the sub-graph of `noun_type`.
    ///
    /// The vector must have the index dimension and be L2-normalized
    /// within [NORM_TOLERANCE]. Re-inserting an existing id replaces it.
    pub fn insert(&mut self, id: Uuid, vector: Vec<f32>, noun_type: NounType) -> Result<()> {
        if vector.len() != self.dim {
            return Err(EngramError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        let norm = dot(&vector, &vector).sqrt();
        if (norm - 1.0).abs() > NORM_TOLERANCE {
            return Err(EngramError::InvalidVector { norm });
        }
        // Upsert: tombstone any previous node for this id, in whichever
        // partition it lives.
        self.delete(&id);

        let level = sample_level(self.m);
        let (m, ef_construction) = (self.m, self.ef_construction);
        self.partitions
            .entry(noun_type)
            .or_default()
            .insert(id, vector, level, m, ef_construction);
        Ok(())
    }

    /// Search for the `k` most similar vectors.
    ///
    /// With `types`, only those sub-graphs are consulted; otherwise every
    /// sub-graph is searched and results merge by score, ties broken by
    /// id. An empty index returns an empty list, never an error.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        ef: Option<usize>,
        types: Option<&[NounType]>,
    ) -> Result<Vec<SearchHit>> {
        if query.len() != self.dim {
            return Err(EngramError::DimensionMismatch {
                expected: self.dim,
                actual: query.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let ef = ef.unwrap_or(self.ef_search);
        let searched: Vec<NounType> = match types {
            Some(types) => types.to_vec(),
            None => NounType::ALL.to_vec(),
        };
        let hits = searched
            .iter()
            .filter_map(|t| self.partitions.get(t))
            .flat_map(|p| p.search(query, k, ef))
            .sorted_by(|a, b| {
                Score(b.score)
                    .cmp(&Score(a.score))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .take(k)
            .collect();
        Ok(hits)
    }

    /// Tombstone an id. Returns whether it was present. The node stays
    /// navigable until the next [HnswIndex::rebuild].
    pub fn delete(&mut self, id: &Uuid) -> bool {
        for partition in self.partitions.values_mut() {
            if let Some(index) = partition.by_id.remove(id) {
                partition.nodes[index].deleted = true;
                return true;
            }
        }
        false
    }

    /// Rebuild every partition from its live nodes, dropping tombstones.
    pub fn rebuild(&mut self) {
        let old = std::mem::take(&mut self.partitions);
        for (noun_type, partition) in old {
            for node in partition.nodes {
                if !node.deleted {
                    let level = sample_level(self.m);
                    let (m, efc) = (self.m, self.ef_construction);
                    self.partitions.entry(noun_type).or_default().insert(
                        node.id,
                        node.vector,
                        level,
                        m,
                        efc,
                    );
                }
            }
        }
    }

    /// Drop all state.
    pub fn reset(&mut self) {
        self.partitions.clear();
    }

    /// Serialize the graph as one record per layer, keyed for the
    /// `_system/hnsw/<layer>` keys. Layer 0 carries vectors, levels and
    /// tombstones; higher layers carry adjacency only.
    pub fn to_layer_files(&self) -> Result<Vec<(usize, Vec<u8>)>> {
        if self.partitions.values().all(|p| p.nodes.is_empty()) {
            return Ok(Vec::new());
        }
        let max_level = self
            .partitions
            .values()
            .flat_map(|p| p.nodes.iter().map(|n| n.level))
            .max()
            .unwrap_or(0);
        let mut files = Vec::new();
        for layer in 0..=max_level {
            let mut partitions: HashMap<String, Vec<LayerNode>> = HashMap::new();
            for (noun_type, partition) in &self.partitions {
                let mut nodes = Vec::new();
                for node in &partition.nodes {
                    if node.level < layer {
                        continue;
                    }
                    nodes.push(LayerNode {
                        id: node.id,
                        vector: if layer == 0 {
                            Some(node.vector.clone())
                        } else {
                            None
                        },
                        level: node.level,
                        deleted: node.deleted,
                        neighbors: node.neighbors[layer]
                            .iter()
                            .map(|&n| partition.nodes[n].id)
                            .collect(),
                    });
                }
                if !nodes.is_empty() {
                    partitions.insert(noun_type.as_str().to_string(), nodes);
                }
            }
            let file = LayerFile { layer, partitions };
            files.push((layer, serde_json::to_vec(&file)?));
        }
        Ok(files)
    }

    /// Rebuild an index from persisted layer files.
    pub fn from_layer_files(dim: usize, files: &[(usize, Vec<u8>)]) -> Result<HnswIndex> {
        let mut index = HnswIndex::new(dim);
        let mut parsed: Vec<LayerFile> = Vec::new();
        for (_, bytes) in files {
            parsed.push(serde_json::from_slice(bytes)?);
        }
        parsed.sort_by_key(|f| f.layer);

        // Layer 0 defines the node set.
        let base = match parsed.iter().find(|f| f.layer == 0) {
            Some(base) => base,
            None => return Ok(index),
        };
        for (type_name, layer_nodes) in &base.partitions {
            let noun_type = NounType::parse(type_name)?;
            let partition = index.partitions.entry(noun_type).or_default();
            for layer_node in layer_nodes {
                let vector = match &layer_node.vector {
                    Some(vector) => vector.clone(),
                    None => continue,
                };
                let node_index = partition.nodes.len();
                partition.nodes.push(Node {
                    id: layer_node.id,
                    vector,
                    level: layer_node.level,
                    neighbors: vec![Vec::new(); layer_node.level + 1],
                    deleted: layer_node.deleted,
                });
                if !layer_node.deleted {
                    partition.by_id.insert(layer_node.id, node_index);
                }
            }
            partition.entry = partition
                .nodes
                .iter()
                .enumerate()
                .max_by_key(|(_, n)| n.level)
                .map(|(i, _)| i);
        }

        for file in &parsed {
            for (type_name, layer_nodes) in &file.partitions {
                let noun_type = NounType::parse(type_name)?;
                let partition = match index.partitions.get_mut(&noun_type) {
                    Some(partition) => partition,
                    None => continue,
                };
                let positions: HashMap<Uuid, usize> = partition
                    .nodes
                    .iter()
                    .enumerate()
                    .map(|(i, n)| (n.id, i))
                    .collect();
                for layer_node in layer_nodes {
                    if let Some(&node_index) = positions.get(&layer_node.id) {
                        if file.layer <= partition.nodes[node_index].level {
                            partition.nodes[node_index].neighbors[file.layer] = layer_node
                                .neighbors
                                .iter()
                                .filter_map(|id| positions.get(id).copied())
                                .collect();
                        }
                    }
                }
            }
        }
        Ok(index)
    }
}

/// Exponentially distributed level: `floor(-ln(u) / ln(M))`, capped.
fn sample_level(m: usize) -> usize {
    let ml = 1.0 / (m as f64).ln();
    let u: f64 = rand::thread_rng().gen_range(f64::EPSILON..1.0);
    ((-u.ln() * ml).floor() as usize).min(MAX_LEVEL)
}

#[derive(Serialize, Deserialize)]
struct LayerNode {
    id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    level: usize,
    #[serde(default)]
    deleted: bool,
    neighbors: Vec<Uuid>,
}

#[derive(Serialize, Deserialize)]
struct LayerFile {
    layer: usize,
    partitions: HashMap<String, Vec<LayerNode>>,
}
