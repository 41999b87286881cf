/*!
The index complex: vector similarity (HNSW), metadata inverted index and
graph adjacency. All three are single-writer in-memory structures whose
persistence lives under `_system/`.
*/

pub mod graph;
pub mod hnsw;
pub mod metadata;
