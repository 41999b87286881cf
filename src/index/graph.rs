/*!
Adjacency lists over relations: for every verb two entries exist, one
under the source (`outgoing`) and one under the target (`incoming`).
Entities are referenced by UUID only; the index never embeds records, so
cyclic shapes (directory ↔ file ↔ directory) cost nothing.
*/

use std::collections::{HashMap, HashSet, VecDeque};

use uuid::Uuid;

use crate::model::{Relation, VerbType};

/// One adjacency entry: the verb, the entity on the other end, and the
/// relation's own id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// Relation type.
    pub verb: VerbType,
    /// The other endpoint.
    pub other: Uuid,
    /// Id of the relation record.
    pub verb_id: Uuid,
}

/// A relation reference returned by lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRef {
    /// Relation record id.
    pub verb_id: Uuid,
    /// Source entity.
    pub from: Uuid,
    /// Target entity.
    pub to: Uuid,
    /// Relation type.
    pub verb: VerbType,
}

/// Filter for [GraphIndex::relations_of]. Unset fields match anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelationFilter {
    /// Match relations leaving this entity.
    pub from: Option<Uuid>,
    /// Match relations arriving at this entity.
    pub to: Option<Uuid>,
    /// Match relations of this type.
    pub verb: Option<VerbType>,
}

/// The in-memory adjacency index.
#[derive(Default)]
pub struct GraphIndex {
    outgoing: HashMap<Uuid, Vec<Edge>>,
    incoming: HashMap<Uuid, Vec<Edge>>,
}

impl GraphIndex {
    /// An empty index.
    pub fn new() -> GraphIndex {
        GraphIndex::default()
    }

    /// Record both adjacency entries of a relation.
    pub fn link(&mut self, relation: &Relation) {
        self.outgoing.entry(relation.from).or_default().push(Edge {
            verb: relation.verb_type,
            other: relation.to,
            verb_id: relation.id,
        });
        self.incoming.entry(relation.to).or_default().push(Edge {
            verb: relation.verb_type,
            other: relation.from,
            verb_id: relation.id,
        });
    }

    /// Remove one relation by id from both sides.
    pub fn unlink(&mut self, verb_id: &Uuid) {
        for map in [&mut self.outgoing, &mut self.incoming] {
            map.retain(|_, edges| {
                edges.retain(|e| &e.verb_id != verb_id);
                !edges.is_empty()
            });
        }
    }

    /// Remove every relation touching an entity. Returns the ids of the
    /// removed relation records so callers can cascade storage deletes.
    pub fn unlink_entity(&mut self, id: &Uuid) -> Vec<Uuid> {
        let mut removed: HashSet<Uuid> = HashSet::new();
        for edge in self.outgoing.remove(id).unwrap_or_default() {
            removed.insert(edge.verb_id);
        }
        for edge in self.incoming.remove(id).unwrap_or_default() {
            removed.insert(edge.verb_id);
        }
        for map in [&mut self.outgoing, &mut self.incoming] {
            map.retain(|_, edges| {
                edges.retain(|e| !removed.contains(&e.verb_id));
                !edges.is_empty()
            });
        }
        removed.into_iter().collect()
    }

    /// Relations matching the filter. With both `from` and `to` set the
    /// outgoing list is intersected against the target.
    pub fn relations_of(&self, filter: RelationFilter) -> Vec<RelationRef> {
        let mut out: Vec<RelationRef> = match (filter.from, filter.to) {
            (Some(from), _) => self
                .outgoing
                .get(&from)
                .into_iter()
                .flatten()
                .filter(|e| filter.to.map_or(true, |to| e.other == to))
                .map(|e| RelationRef {
                    verb_id: e.verb_id,
                    from,
                    to: e.other,
                    verb: e.verb,
                })
                .collect(),
            (None, Some(to)) => self
                .incoming
                .get(&to)
                .into_iter()
                .flatten()
                .map(|e| RelationRef {
                    verb_id: e.verb_id,
                    from: e.other,
                    to,
                    verb: e.verb,
                })
                .collect(),
            (None, None) => self
                .outgoing
                .iter()
                .flat_map(|(from, edges)| {
                    edges.iter().map(|e| RelationRef {
                        verb_id: e.verb_id,
                        from: *from,
                        to: e.other,
                        verb: e.verb,
                    })
                })
                .collect(),
        };
        if let Some(verb) = filter.verb {
            out.retain(|r| r.verb == verb);
        }
        out.sort_by_key(|r| r.verb_id);
        out
    }

    /// Breadth-first traversal along outgoing edges, bounded by `depth`.
    /// Returns reached entity ids, excluding the start.
    pub fn traverse(&self, start: Uuid, verb: Option<VerbType>, depth: usize) -> Vec<Uuid> {
        let mut seen: HashSet<Uuid> = HashSet::new();
        seen.insert(start);
        let mut queue: VecDeque<(Uuid, usize)> = VecDeque::new();
        queue.push_back((start, 0));
        let mut reached = Vec::new();
        while let Some((node, at)) = queue.pop_front() {
            if at >= depth {
                continue;
            }
            for edge in self.outgoing.get(&node).into_iter().flatten() {
                if verb.map_or(true, |v| edge.verb == v) && seen.insert(edge.other) {
                    reached.push(edge.other);
                    queue.push_back((edge.other, at + 1));
                }
            }
        }
        reached
    }

    /// Drop all state.
    pub fn reset(&mut self) {
        self.outgoing.clear();
        self.incoming.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Map;

    fn relation(from: Uuid, to: Uuid, verb: VerbType) -> Relation {
        Relation {
            id: Uuid::new_v4(),
            from,
            to,
            verb_type: verb,
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_both_directions_indexed() {
        let mut graph = GraphIndex::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let rel = relation(a, b, VerbType::Knows);
        graph.link(&rel);

        let from_a = graph.relations_of(RelationFilter {
            from: Some(a),
            ..Default::default()
        });
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].to, b);

        let to_b = graph.relations_of(RelationFilter {
            to: Some(b),
            ..Default::default()
        });
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0].from, a);
    }

    #[test]
    fn test_filter_intersection() {
        let mut graph = GraphIndex::new();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        graph.link(&relation(a, b, VerbType::Knows));
        graph.link(&relation(a, c, VerbType::References));

        let knows = graph.relations_of(RelationFilter {
            from: Some(a),
            verb: Some(VerbType::Knows),
            ..Default::default()
        });
        assert_eq!(knows.len(), 1);
        assert_eq!(knows[0].to, b);

        let a_to_c = graph.relations_of(RelationFilter {
            from: Some(a),
            to: Some(c),
            ..Default::default()
        });
        assert_eq!(a_to_c.len(), 1);
        assert_eq!(a_to_c[0].verb, VerbType::References);
    }

    #[test]
    fn test_unlink_entity_cascades() {
        let mut graph = GraphIndex::new();
        let (dir, file) = (Uuid::new_v4(), Uuid::new_v4());
        let rel = relation(dir, file, VerbType::Contains);
        graph.link(&rel);

        let removed = graph.unlink_entity(&file);
        assert_eq!(removed, vec![rel.id]);
        assert!(graph
            .relations_of(RelationFilter {
                from: Some(dir),
                ..Default::default()
            })
            .is_empty());
    }

    #[test]
    fn test_bfs_depth_bound() {
        let mut graph = GraphIndex::new();
        let nodes: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        for pair in nodes.windows(2) {
            graph.link(&relation(pair[0], pair[1], VerbType::Contains));
        }

        let one_hop = graph.traverse(nodes[0], None, 1);
        assert_eq!(one_hop, vec![nodes[1]]);

        let all = graph.traverse(nodes[0], None, 10);
        assert_eq!(all.len(), 3);

        // Cycles terminate.
        graph.link(&relation(nodes[3], nodes[0], VerbType::Contains));
        let cyclic = graph.traverse(nodes[0], None, 100);
        assert_eq!(cyclic.len(), 3);
    }
}
